//! Component factory descriptors returned by `GetFactory`.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::metadata::PluginType;

/// Maturity of a component.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Stability {
    /// Unstable, may change at any time.
    #[default]
    Development,
    /// Feature incomplete.
    Alpha,
    /// Feature complete, may still change.
    Beta,
    /// Covered by compatibility guarantees.
    Stable,
    /// Scheduled for removal.
    Deprecated,
}

/// What a plugin hands the pipeline assembler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactoryDescriptor {
    component_type: String,
    #[serde(rename = "type")]
    plugin_type: PluginType,
    #[serde(default)]
    stability: Stability,
    #[serde(default)]
    default_config: serde_json::Value,
}

impl FactoryDescriptor {
    /// Creates a descriptor with an empty default configuration.
    #[must_use]
    pub fn new(component_type: impl Into<String>, plugin_type: PluginType, stability: Stability) -> Self {
        Self {
            component_type: component_type.into(),
            plugin_type,
            stability,
            default_config: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Sets the default component configuration.
    #[must_use]
    pub fn with_default_config(mut self, config: serde_json::Value) -> Self {
        self.default_config = config;
        self
    }

    /// The plugin's own component type identifier.
    #[must_use]
    pub fn component_type(&self) -> &str {
        &self.component_type
    }

    /// Pipeline role.
    #[must_use]
    pub const fn plugin_type(&self) -> PluginType {
        self.plugin_type
    }

    /// Maturity level.
    #[must_use]
    pub const fn stability(&self) -> Stability {
        self.stability
    }

    /// Default configuration as JSON.
    #[must_use]
    pub const fn default_config(&self) -> &serde_json::Value {
        &self.default_config
    }
}
