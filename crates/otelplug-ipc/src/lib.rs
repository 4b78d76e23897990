//! Wire protocol and transport shared by the plugin host and plugin SDK.
//!
//! Host and plugin rendezvous over a per-plugin Unix-domain socket and share
//! a memory-mapped [`SharedRegion`] that carries message payloads. The
//! connection is a [`Session`] that multiplexes many logical [`Stream`]s;
//! each stream carries one [`IpcRequest`] followed by one [`IpcResponse`] at
//! a time and may be reused for later exchanges. The socket keeps framing,
//! ordering and liveness signals.
//!
//! Every blocking operation takes a [`CallContext`] carrying an optional
//! deadline and a cancellation token.

pub mod context;
pub mod error;
pub mod factory;
pub mod frame;
pub mod metadata;
pub mod protocol;
pub mod region;
pub mod rendezvous;
pub mod session;

pub use context::{CallContext, CancelToken, ContextError};
pub use error::{ProtocolError, TransportError};
pub use factory::{FactoryDescriptor, Stability};
pub use frame::{Frame, FrameKind, MAX_FRAME_LEN};
pub use metadata::{
    HealthStatus, PluginHealth, PluginMetadata, PluginType, PluginTypeParseError,
};
pub use protocol::{
    ALREADY_STARTED, INVALID_REQUEST, IpcRequest, IpcResponse, Method, NOT_INITIALIZED,
    NOT_STARTED, decode_result,
};
pub use region::{MIN_RING_CAPACITY, SharedRegion, remove_region_file};
pub use rendezvous::{IpcAddress, RendezvousListener, connect, remove_socket_file};
pub use session::{Role, Session, Stream};
