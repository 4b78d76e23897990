//! Shared configuration for the plugin host and its operator tooling.
//!
//! [`Config`] is assembled by `ortho_config` from built-in defaults, an
//! optional TOML file (`--config-path` or `OTELPLUG_CONFIG_PATH`),
//! `OTELPLUG_*` environment variables and command-line flags, in increasing
//! order of precedence. The values drive plugin discovery, the IPC runtime
//! directory, per-call timeouts and telemetry output.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

mod defaults;
mod logging;
mod runtime;

pub use defaults::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_FACTORY_TIMEOUT_MS, DEFAULT_HEALTH_TIMEOUT_MS,
    DEFAULT_INITIALIZE_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_RING_CAPACITY_KIB,
    DEFAULT_SHUTDOWN_GRACE_MS, DEFAULT_STREAM_POOL_SIZE, default_log_filter, default_log_format, default_plugin_dir,
    default_runtime_dir,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{RuntimeDirError, prepare_runtime_dir};

/// Host configuration shared by the daemon and the plugin commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "OTELPLUG")]
pub struct Config {
    /// Root directory holding the `receivers`, `processors`, `exporters` and
    /// `extensions` plugin subdirectories.
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: Utf8PathBuf,
    /// Directory where per-plugin rendezvous sockets and shared-memory
    /// regions are created.
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: Utf8PathBuf,
    /// `tracing` filter expression.
    #[serde(default = "defaults::default_log_filter_string")]
    pub log_filter: String,
    /// Log output format.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    /// Budget for the cold-start `Initialize` handshake, in milliseconds.
    #[serde(default = "defaults::default_initialize_timeout_ms")]
    pub initialize_timeout_ms: u64,
    /// Budget for `Start`/`Stop` control calls, in milliseconds.
    #[serde(default = "defaults::default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Budget for a single `HealthCheck` call, in milliseconds.
    #[serde(default = "defaults::default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// Budget for factory retrieval, in milliseconds.
    #[serde(default = "defaults::default_factory_timeout_ms")]
    pub factory_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when unloading, in milliseconds.
    #[serde(default = "defaults::default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Maximum number of concurrently open streams per plugin session.
    #[serde(default = "defaults::default_stream_pool_size")]
    pub stream_pool_size: usize,
    /// Size of each direction's shared-memory ring, in KiB.
    #[serde(default = "defaults::default_ring_capacity_kib")]
    pub ring_capacity_kib: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            runtime_dir: default_runtime_dir(),
            log_filter: defaults::default_log_filter_string(),
            log_format: default_log_format(),
            initialize_timeout_ms: DEFAULT_INITIALIZE_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
            factory_timeout_ms: DEFAULT_FACTORY_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            stream_pool_size: DEFAULT_STREAM_POOL_SIZE,
            ring_capacity_kib: DEFAULT_RING_CAPACITY_KIB,
        }
    }
}

impl Config {
    /// Root plugin directory.
    #[must_use]
    pub fn plugin_dir(&self) -> &Utf8Path {
        self.plugin_dir.as_path()
    }

    /// Directory for rendezvous sockets.
    #[must_use]
    pub fn runtime_dir(&self) -> &Utf8Path {
        self.runtime_dir.as_path()
    }

    /// Configured log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Configured log format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Timeout applied to the `Initialize` handshake.
    #[must_use]
    pub const fn initialize_timeout(&self) -> Duration {
        Duration::from_millis(self.initialize_timeout_ms)
    }

    /// Timeout applied to `Start` and `Stop`.
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Timeout applied to each `HealthCheck`.
    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Timeout applied to factory retrieval.
    #[must_use]
    pub const fn factory_timeout(&self) -> Duration {
        Duration::from_millis(self.factory_timeout_ms)
    }

    /// Grace period granted to a plugin after SIGTERM.
    #[must_use]
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Per-plugin stream pool capacity; never below one.
    #[must_use]
    pub fn stream_pool_size(&self) -> usize {
        self.stream_pool_size.max(1)
    }

    /// Bytes in each shared-memory ring: at least 4 KiB and rounded up to a
    /// power of two.
    #[must_use]
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity_kib
            .max(4)
            .checked_next_power_of_two()
            .map_or(usize::MAX, |kib| kib.saturating_mul(1_024))
    }
}
