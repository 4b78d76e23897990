//! Transport and protocol errors.
//!
//! Errors are `Clone` so a single failure can be fanned out to every waiter
//! on a session. I/O errors are wrapped in `Arc` for that reason.

use std::io;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::context::ContextError;

/// Failures moving frames between host and plugin.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Reading or writing the connection failed.
    #[error("I/O error while {operation}: {source}")]
    Io {
        /// What the transport was doing.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// A frame exceeded the payload limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Offending payload length.
        len: usize,
        /// Permitted maximum.
        max: usize,
    },
    /// The peer sent bytes that do not form a frame.
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// Description of the violation.
        message: String,
    },
    /// The session was closed locally or by the peer.
    #[error("session closed")]
    SessionClosed,
    /// The peer abandoned the stream.
    #[error("stream {stream} was reset by the peer")]
    StreamReset {
        /// Stream identifier.
        stream: u32,
    },
    /// The call's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// The call was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// The peer process exited while the transport waited for it.
    #[error("peer process exited before connecting")]
    PeerExited,
    /// The rendezvous path would not fit in a socket address.
    #[error("rendezvous path '{path}' is longer than {max} bytes")]
    AddressTooLong {
        /// Offending path.
        path: Utf8PathBuf,
        /// Platform limit.
        max: usize,
    },
    /// Binding the rendezvous socket failed.
    #[error("failed to bind rendezvous socket '{path}': {source}")]
    Bind {
        /// Socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Something other than a socket occupies the rendezvous path.
    #[error("rendezvous path '{path}' exists and is not a socket")]
    NotSocket {
        /// Occupied path.
        path: Utf8PathBuf,
    },
    /// Another process is already listening on the rendezvous path.
    #[error("rendezvous socket '{path}' is in use")]
    InUse {
        /// Socket path.
        path: Utf8PathBuf,
    },
    /// Connecting to the rendezvous socket failed.
    #[error("failed to connect to rendezvous socket '{path}': {source}")]
    Connect {
        /// Socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Creating or mapping a shared-memory region failed.
    #[error("failed to map shared-memory region '{path}': {source}")]
    Region {
        /// Region file.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
    /// A shared-memory region's header or size is unusable.
    #[error("invalid shared-memory region '{path}': {message}")]
    InvalidRegion {
        /// Region file.
        path: Utf8PathBuf,
        /// What is wrong with it.
        message: String,
    },
    /// Removing a rendezvous socket or region file failed.
    #[error("failed to remove rendezvous file '{path}': {source}")]
    Cleanup {
        /// Socket path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl TransportError {
    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io {
            operation,
            source: Arc::new(source),
        }
    }

    /// Reports whether the error ends the whole session rather than one stream.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::FrameTooLarge { .. }
                | Self::MalformedFrame { .. }
                | Self::SessionClosed
                | Self::PeerExited
        )
    }
}

impl From<ContextError> for TransportError {
    fn from(error: ContextError) -> Self {
        match error {
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
            ContextError::Cancelled => Self::Cancelled,
        }
    }
}

/// Failures encoding or interpreting protocol messages.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// A message could not be serialised.
    #[error("failed to encode {what}: {source}")]
    Encode {
        /// Kind of message being encoded.
        what: &'static str,
        /// Underlying JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// A message could not be deserialised.
    #[error("failed to decode {what}: {source}")]
    Decode {
        /// Kind of message being decoded.
        what: &'static str,
        /// Underlying JSON error.
        #[source]
        source: Arc<serde_json::Error>,
    },
    /// A message decoded but violates the protocol.
    #[error("malformed message: {message}")]
    Malformed {
        /// Description of the violation.
        message: String,
    },
    /// The request named a method outside the protocol.
    #[error("unknown method: {method}")]
    UnknownMethod {
        /// Method name as received.
        method: String,
    },
}

impl ProtocolError {
    pub(crate) fn encode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Encode {
            what,
            source: Arc::new(source),
        }
    }

    pub(crate) fn decode(what: &'static str, source: serde_json::Error) -> Self {
        Self::Decode {
            what,
            source: Arc::new(source),
        }
    }
}
