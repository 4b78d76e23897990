//! Waiting for the operator to stop `otelplugd`.

use std::io;
use std::sync::Arc;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use thiserror::Error;
use tracing::info;

const SHUTDOWN_TARGET: &str = "otelplug_host::shutdown";

/// Signals that end the daemon and unload every plugin.
pub const TERMINATION_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGQUIT, SIGHUP];

/// Blocks the daemon's main thread until it should unload its plugins.
pub trait ShutdownSignal: Send + Sync {
    /// Returns once shutdown should begin.
    fn wait(&self) -> Result<(), ShutdownError>;
}

/// Failure to listen for termination signals.
#[derive(Debug, Clone, Error)]
pub enum ShutdownError {
    /// The signal handlers could not be registered.
    #[error("could not register termination signal handlers: {source}")]
    Install {
        /// Registration error.
        #[source]
        source: Arc<io::Error>,
    },
}

/// Waits for one of [`TERMINATION_SIGNALS`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShutdownSignal;

impl ShutdownSignal for SystemShutdownSignal {
    fn wait(&self) -> Result<(), ShutdownError> {
        let mut signals = register()?;
        if let Some(signal) = next_signal(&mut signals) {
            info!(target: SHUTDOWN_TARGET, signal, "termination signal received, unloading plugins");
        }
        Ok(())
    }
}

fn register() -> Result<Signals, ShutdownError> {
    Signals::new(TERMINATION_SIGNALS).map_err(|source| ShutdownError::Install {
        source: Arc::new(source),
    })
}

fn next_signal(signals: &mut Signals) -> Option<i32> {
    signals.forever().next()
}
