//! Plugin identity and health data shared by host and plugin.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role a plugin plays in a telemetry pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    /// Ingests telemetry.
    Receiver,
    /// Transforms telemetry.
    Processor,
    /// Ships telemetry out.
    Exporter,
    /// Auxiliary service.
    Extension,
}

impl PluginType {
    /// Every plugin type in discovery order.
    pub const ALL: [Self; 4] = [
        Self::Receiver,
        Self::Processor,
        Self::Exporter,
        Self::Extension,
    ];

    /// Singular lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Receiver => "receiver",
            Self::Processor => "processor",
            Self::Exporter => "exporter",
            Self::Extension => "extension",
        }
    }

    /// Subdirectory of the plugin root holding binaries of this type.
    #[must_use]
    pub const fn directory_name(self) -> &'static str {
        match self {
            Self::Receiver => "receivers",
            Self::Processor => "processors",
            Self::Exporter => "exporters",
            Self::Extension => "extensions",
        }
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when text names no plugin type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown plugin type '{0}'")]
pub struct PluginTypeParseError(pub String);

impl FromStr for PluginType {
    type Err = PluginTypeParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let lowered = input.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| lowered == kind.as_str() || lowered == kind.directory_name())
            .ok_or_else(|| PluginTypeParseError(input.to_owned()))
    }
}

/// Identity of a plugin binary.
///
/// The host supplies the expected metadata at load time; the plugin confirms
/// it during the `Initialize` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    name: String,
    #[serde(rename = "type")]
    plugin_type: PluginType,
    #[serde(default)]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

impl PluginMetadata {
    /// Creates metadata with no description, capabilities or digests.
    #[must_use]
    pub fn new(name: impl Into<String>, plugin_type: PluginType, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plugin_type,
            version: version.into(),
            description: String::new(),
            capabilities: BTreeSet::new(),
            sha256: None,
            signature: None,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Adds one capability tag.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Replaces the capability set.
    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Records the binary's SHA-256 digest, hex encoded.
    #[must_use]
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    /// Records a detached signature over the binary.
    #[must_use]
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Replaces the digest and signature with those from `other`.
    #[must_use]
    pub fn with_provenance_of(mut self, other: &Self) -> Self {
        self.sha256.clone_from(&other.sha256);
        self.signature.clone_from(&other.signature);
        self
    }

    /// Unique plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Plugin type.
    #[must_use]
    pub const fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    /// Version string; empty when unknown.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Ordered capability tags.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Recorded SHA-256 digest.
    #[must_use]
    pub fn sha256(&self) -> Option<&str> {
        self.sha256.as_deref()
    }

    /// Recorded signature.
    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// `"<type>/<name>"`, the key used when aggregating factories.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.plugin_type, self.name)
    }
}

/// Coarse plugin health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No check has run yet.
    #[default]
    Unknown,
    /// Operating normally.
    Healthy,
    /// Operating with reduced function.
    Degraded,
    /// Not operating.
    Failed,
    /// Stopped on request.
    Stopped,
}

impl HealthStatus {
    /// Lowercase status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A timestamped health observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginHealth {
    status: HealthStatus,
    last_check: SystemTime,
    #[serde(default)]
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PluginHealth {
    /// Observation stamped with the current time.
    #[must_use]
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            last_check: SystemTime::now(),
            message: message.into(),
            error: None,
        }
    }

    /// A `failed` observation carrying `error`.
    #[must_use]
    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(HealthStatus::Failed, message)
        }
    }

    /// The initial `unknown` observation.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(HealthStatus::Unknown, "not checked yet")
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        self.status
    }

    /// When the observation was made.
    #[must_use]
    pub const fn last_check(&self) -> SystemTime {
        self.last_check
    }

    /// Free-form detail.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Error detail for failed observations.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Stamps the observation with the current time.
    pub fn touch(&mut self) {
        self.last_check = SystemTime::now();
    }
}

impl Default for PluginHealth {
    fn default() -> Self {
        Self::unknown()
    }
}
