//! Daemon bootstrap and lifetime.

use std::sync::Arc;

use ortho_config::{OrthoConfig, OrthoError};
use otelplug_config::{Config, RuntimeDirError, prepare_runtime_dir};
use otelplug_ipc::CallContext;
use thiserror::Error;
use tracing::{info, warn};

use crate::commands::AppContext;
use crate::error::PluginError;
use crate::events::StructuredEventReporter;
use crate::manager::PluginManager;
use crate::process::{PluginLauncher, SystemLauncher};
use crate::shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};
use crate::telemetry::{self, TelemetryError};

const DAEMON_TARGET: &str = "otelplug_host::daemon";

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the host configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to `Config::load`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader returning a fixed configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader(Config);

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self(config)
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.0.clone())
    }
}

/// Errors that end the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The rendezvous directory could not be prepared.
    #[error("failed to prepare runtime directory: {source}")]
    RuntimeDirectory {
        /// Underlying filesystem error.
        #[source]
        source: RuntimeDirError,
    },
    /// The plugin directory could not be scanned.
    #[error("failed to scan plugins: {source}")]
    Discovery {
        /// Underlying discovery error.
        #[source]
        source: PluginError,
    },
    /// Waiting for a termination signal failed.
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// Runs the daemon with the system collaborators.
pub fn run_daemon() -> Result<(), DaemonError> {
    run_daemon_with(&SystemConfigLoader, Arc::new(SystemLauncher), &SystemShutdownSignal)
}

/// Loads configuration, starts every discovered plugin, waits for `signal`
/// and unloads everything.
pub fn run_daemon_with(
    loader: &dyn ConfigLoader,
    launcher: Arc<dyn PluginLauncher>,
    signal: &dyn ShutdownSignal,
) -> Result<(), DaemonError> {
    let config = loader
        .load()
        .map_err(|source| DaemonError::Configuration { source })?;
    telemetry::install(&config).map_err(|source| DaemonError::Telemetry { source })?;
    prepare_runtime_dir(config.runtime_dir())
        .map_err(|source| DaemonError::RuntimeDirectory { source })?;

    let plugin_dir = config.plugin_dir().to_path_buf();
    let manager = PluginManager::with_parts(
        config,
        launcher,
        Arc::new(StructuredEventReporter::new()),
    );
    let app = AppContext::new(manager);
    let ctx = CallContext::background();

    let report = app
        .loader()
        .load_plugins(&ctx, &plugin_dir)
        .map_err(|source| DaemonError::Discovery { source })?;
    info!(
        target: DAEMON_TARGET,
        loaded = report.loaded.len(),
        failed = report.failures.len(),
        "plugin host ready"
    );

    let waited = signal.wait();
    for error in app.manager().shutdown(&ctx) {
        warn!(target: DAEMON_TARGET, error = %error, "plugin did not unload cleanly");
    }
    info!(target: DAEMON_TARGET, "plugin host stopped");
    waited.map_err(DaemonError::from)
}
