//! Domain errors raised by host-side plugin operations.
//!
//! Every variant names the plugin it concerns; load-path variants also carry
//! the plugin type. [`PluginError::kind`] and [`PluginError::phase`] let
//! callers classify a failure without matching on every variant. I/O errors
//! are wrapped in `Arc` to satisfy the `result_large_err` Clippy lint.

use std::fmt;
use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use otelplug_config::RuntimeDirError;
use otelplug_ipc::{Method, PluginType, ProtocolError, TransportError};
use thiserror::Error;

/// Coarse classification of a [`PluginError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The plugin, binary or factory does not exist.
    NotFound,
    /// A plugin with the same name is loaded or loading.
    AlreadyLoaded,
    /// `Start` on a running plugin.
    AlreadyStarted,
    /// `Stop` on a stopped plugin.
    NotStarted,
    /// The connection to the plugin failed.
    Transport,
    /// The plugin spoke the protocol incorrectly.
    Protocol,
    /// The plugin reported a failure.
    Remote,
    /// Spawning, signalling or reaping the process failed.
    Process,
    /// A deadline passed.
    Timeout,
    /// The caller cancelled.
    Cancelled,
}

/// Step of an operation at which a failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Locating the plugin or its binary.
    Resolve,
    /// Preparing the rendezvous socket and shared-memory region.
    Rendezvous,
    /// Launching the process.
    Spawn,
    /// Waiting for the plugin to connect.
    Connect,
    /// The `Initialize` exchange.
    Handshake,
    /// A request/response exchange after the handshake.
    Io,
    /// The plugin answered with an error.
    Remote,
    /// Stopping and reaping the process.
    Terminate,
    /// Scanning the plugin directory.
    Discovery,
}

impl Phase {
    /// Lowercase phase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Rendezvous => "rendezvous",
            Self::Spawn => "spawn",
            Self::Connect => "connect",
            Self::Handshake => "handshake",
            Self::Io => "io",
            Self::Remote => "remote",
            Self::Terminate => "terminate",
            Self::Discovery => "discovery",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors arising from plugin management.
#[derive(Debug, Clone, Error)]
pub enum PluginError {
    /// No plugin with this name is loaded.
    #[error("plugin '{name}' is not loaded")]
    NotLoaded {
        /// Name that was looked up.
        name: String,
    },

    /// The plugin binary does not exist or is not a regular file.
    #[error("{plugin_type} plugin '{name}' not found at '{path}'")]
    BinaryNotFound {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Path that was checked.
        path: Utf8PathBuf,
    },

    /// No loaded plugin provides a factory of this type.
    #[error("no loaded {plugin_type} plugin provides a factory")]
    NoFactory {
        /// Requested plugin type.
        plugin_type: PluginType,
    },

    /// The name is already loaded or being loaded.
    #[error("plugin '{name}' is already loaded")]
    AlreadyLoaded {
        /// Plugin name.
        name: String,
    },

    /// `Start` was sent to a running plugin.
    #[error("plugin '{name}' is already started")]
    AlreadyStarted {
        /// Plugin name.
        name: String,
    },

    /// `Stop` was sent to a stopped plugin.
    #[error("plugin '{name}' is not started")]
    NotStarted {
        /// Plugin name.
        name: String,
    },

    /// The binary could not be read to compute its digest.
    #[error("failed to read {plugin_type} plugin '{name}' at '{path}': {source}")]
    Digest {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Binary path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The runtime directory could not be prepared.
    #[error("{plugin_type} plugin '{name}': {source}")]
    RuntimeDirectory {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Underlying failure.
        #[source]
        source: RuntimeDirError,
    },

    /// The rendezvous socket or shared-memory region could not be set up.
    #[error("{plugin_type} plugin '{name}': rendezvous failed: {source}")]
    Rendezvous {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The plugin process could not be launched.
    #[error("{plugin_type} plugin '{name}' failed to spawn from '{path}': {source}")]
    Spawn {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Binary path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The plugin never connected to its rendezvous socket.
    #[error("{plugin_type} plugin '{name}' did not connect: {source}")]
    Connect {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The plugin rejected the handshake or confirmed a different identity.
    #[error("{plugin_type} plugin '{name}' handshake failed: {message}")]
    Handshake {
        /// Plugin name.
        name: String,
        /// Plugin type.
        plugin_type: PluginType,
        /// Reason reported by the plugin or detected by the host.
        message: String,
    },

    /// The connection failed during a request.
    #[error("plugin '{name}' {method} failed: {source}")]
    Transport {
        /// Plugin name.
        name: String,
        /// Request method.
        method: Method,
        /// Underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// A deadline passed.
    #[error("plugin '{name}' timed out after {timeout_ms}ms during {phase}")]
    Timeout {
        /// Plugin name.
        name: String,
        /// Phase that timed out.
        phase: Phase,
        /// Budget that was exhausted.
        timeout_ms: u64,
    },

    /// The caller cancelled the operation.
    #[error("plugin '{name}' operation cancelled during {phase}")]
    Cancelled {
        /// Plugin name.
        name: String,
        /// Phase that was interrupted.
        phase: Phase,
    },

    /// The plugin's reply could not be interpreted.
    #[error("plugin '{name}' sent an invalid {method} reply: {source}")]
    Protocol {
        /// Plugin name.
        name: String,
        /// Request method.
        method: Method,
        /// Underlying protocol failure.
        #[source]
        source: ProtocolError,
    },

    /// The plugin answered with an error.
    #[error("plugin '{name}' {method} failed: {message}")]
    Remote {
        /// Plugin name.
        name: String,
        /// Request method.
        method: Method,
        /// Message relayed from the plugin.
        message: String,
    },

    /// Stopping or reaping the process failed.
    #[error("failed to terminate plugin '{name}': {source}")]
    Terminate {
        /// Plugin name.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The plugin directory could not be prepared or listed.
    #[error("plugin discovery failed at '{path}': {source}")]
    Discovery {
        /// Directory being scanned.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl PluginError {
    /// Taxonomy bucket for this failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotLoaded { .. } | Self::BinaryNotFound { .. } | Self::NoFactory { .. } => {
                ErrorKind::NotFound
            }
            Self::AlreadyLoaded { .. } => ErrorKind::AlreadyLoaded,
            Self::AlreadyStarted { .. } => ErrorKind::AlreadyStarted,
            Self::NotStarted { .. } => ErrorKind::NotStarted,
            Self::RuntimeDirectory { .. }
            | Self::Rendezvous { .. }
            | Self::Connect { .. }
            | Self::Transport { .. } => ErrorKind::Transport,
            Self::Handshake { .. } | Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Digest { .. }
            | Self::Spawn { .. }
            | Self::Terminate { .. }
            | Self::Discovery { .. } => ErrorKind::Process,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Step at which the failure occurred.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        match self {
            Self::NotLoaded { .. }
            | Self::BinaryNotFound { .. }
            | Self::NoFactory { .. }
            | Self::AlreadyLoaded { .. }
            | Self::Digest { .. } => Phase::Resolve,
            Self::RuntimeDirectory { .. } | Self::Rendezvous { .. } => Phase::Rendezvous,
            Self::Spawn { .. } => Phase::Spawn,
            Self::Connect { .. } => Phase::Connect,
            Self::Handshake { .. } => Phase::Handshake,
            Self::Transport { .. } | Self::Protocol { .. } => Phase::Io,
            Self::AlreadyStarted { .. } | Self::NotStarted { .. } | Self::Remote { .. } => {
                Phase::Remote
            }
            Self::Timeout { phase, .. } | Self::Cancelled { phase, .. } => *phase,
            Self::Terminate { .. } => Phase::Terminate,
            Self::Discovery { .. } => Phase::Discovery,
        }
    }

    /// Plugin the failure concerns, when one is known.
    #[must_use]
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            Self::NotLoaded { name }
            | Self::BinaryNotFound { name, .. }
            | Self::AlreadyLoaded { name }
            | Self::AlreadyStarted { name }
            | Self::NotStarted { name }
            | Self::Digest { name, .. }
            | Self::RuntimeDirectory { name, .. }
            | Self::Rendezvous { name, .. }
            | Self::Spawn { name, .. }
            | Self::Connect { name, .. }
            | Self::Handshake { name, .. }
            | Self::Transport { name, .. }
            | Self::Timeout { name, .. }
            | Self::Cancelled { name, .. }
            | Self::Protocol { name, .. }
            | Self::Remote { name, .. }
            | Self::Terminate { name, .. } => Some(name),
            Self::NoFactory { .. } | Self::Discovery { .. } => None,
        }
    }

    /// Moves a request-level failure into the handshake phase.
    pub(crate) fn into_handshake(self, plugin_type: PluginType) -> Self {
        match self {
            Self::Remote { name, message, .. } => Self::Handshake {
                name,
                plugin_type,
                message,
            },
            Self::Protocol { name, source, .. } => Self::Handshake {
                name,
                plugin_type,
                message: source.to_string(),
            },
            Self::Timeout {
                name, timeout_ms, ..
            } => Self::Timeout {
                name,
                phase: Phase::Handshake,
                timeout_ms,
            },
            Self::Cancelled { name, .. } => Self::Cancelled {
                name,
                phase: Phase::Handshake,
            },
            other => other,
        }
    }
}
