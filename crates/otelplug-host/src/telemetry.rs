//! Process-wide log output for `otelplugd`.
//!
//! Everything the host logs, including plugin lifecycle events, goes to
//! stderr through one `tracing` subscriber. Supervisor threads are named
//! after the plugin they watch, so thread names are kept in the output.

use std::io::{self, IsTerminal};

use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::{EnvFilter, fmt};

use otelplug_config::{Config, LogFormat};

type BoxedSubscriber = Box<dyn Subscriber + Send + Sync>;

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Why log output could not be set up.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// `log_filter` is not a valid `EnvFilter` directive list.
    #[error("log filter '{filter}' is invalid: {message}")]
    Filter {
        /// The rejected directives.
        filter: String,
        /// Parser diagnostic.
        message: String,
    },
    /// Something else installed a subscriber first.
    #[error("a global tracing subscriber is already set: {0}")]
    Subscriber(SetGlobalDefaultError),
}

/// Installs the subscriber described by `config`.
///
/// Only the first successful call has an effect; the host may call it again
/// (for example to report a configuration failure) without error.
///
/// ```rust
/// use otelplug_config::Config;
///
/// # fn main() -> Result<(), otelplug_host::TelemetryError> {
/// otelplug_host::telemetry::install(&Config::default())?;
/// otelplug_host::telemetry::install(&Config::default())?;
/// # Ok(())
/// # }
/// ```
pub fn install(config: &Config) -> Result<(), TelemetryError> {
    INSTALLED
        .get_or_try_init(|| {
            let subscriber = subscriber_for(config)?;
            tracing::subscriber::set_global_default(subscriber).map_err(TelemetryError::Subscriber)
        })
        .copied()
}

fn subscriber_for(config: &Config) -> Result<BoxedSubscriber, TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter()).map_err(|error| TelemetryError::Filter {
        filter: config.log_filter().to_owned(),
        message: error.to_string(),
    })?;
    let base = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_thread_names(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    Ok(match config.log_format() {
        LogFormat::Json => Box::new(base.json().flatten_event(true).finish()),
        LogFormat::Compact => Box::new(base.compact().finish()),
    })
}
