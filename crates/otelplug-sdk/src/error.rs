use otelplug_ipc::{IpcAddress, TransportError};
use thiserror::Error;

/// Errors that stop a plugin before or while serving.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The command line could not be parsed.
    #[error("invalid plugin arguments: {0}")]
    Arguments(#[from] clap::Error),
    /// The host's rendezvous socket could not be reached.
    #[error("failed to connect to host at '{address}': {source}")]
    Connect {
        /// Address passed via `--ipc`.
        address: IpcAddress,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },
    /// The serving thread could not be started.
    #[error("failed to spawn stream worker: {source}")]
    Spawn {
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
