//! Multiplexed sessions over one Unix-domain connection.
//!
//! A reader thread demultiplexes inbound frames into per-stream channels.
//! Writers share the socket behind a mutex and always emit whole frames.
//! With a [`SharedRegion`] attached, data payloads go through the mapping
//! and the socket carries only [`FrameKind::Mapped`] doorbells; a payload
//! that does not fit in the free ring space falls back to an inline frame.
//! The host opens streams with odd identifiers; the plugin side learns of a
//! stream when its first data frame arrives and hands it out through
//! [`Session::accept`].
//!
//! Dropping a [`Stream`] sends a reset frame unless the peer already ended
//! it. Closing a session shuts the socket down and disconnects every stream
//! channel, so all waiters observe [`TransportError::SessionClosed`].

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::io::BufReader;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::TransportError;
use crate::frame::{Frame, FrameKind, MAX_FRAME_LEN};
use crate::region::SharedRegion;

const SESSION_TARGET: &str = "otelplug_ipc::session";

/// Which end of the connection a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens streams and sends requests.
    Host,
    /// Accepts streams and answers requests.
    Plugin,
}

impl Role {
    const fn first_stream_id(self) -> u32 {
        match self {
            Self::Host => 1,
            Self::Plugin => 2,
        }
    }

    const fn is_peer_stream(self, id: u32) -> bool {
        match self {
            Self::Host => id & 1 == 0,
            Self::Plugin => id & 1 == 1,
        }
    }
}

enum Inbound {
    Data(Vec<u8>),
    Reset,
}

struct Shared {
    role: Role,
    writer: Mutex<UnixStream>,
    control: UnixStream,
    routes: Mutex<HashMap<u32, Sender<Inbound>>>,
    closed: AtomicBool,
    next_id: AtomicU32,
    region: Option<SharedRegion>,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<u32, Sender<Inbound>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn write(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        frame.write_to(&mut *writer)
    }

    fn write_data(&self, stream: u32, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let len = payload.len();
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        // Ring pushes and doorbells must hit the socket in the same order.
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = match &self.region {
            Some(region) if region.push(&payload) => Frame::mapped(stream, len),
            _ => Frame::data(stream, payload),
        };
        frame.write_to(&mut *writer)
    }

    fn close(&self) {
        let already_closed = self.closed.swap(true, Ordering::SeqCst);
        if !already_closed
            && let Err(error) = self.control.shutdown(Shutdown::Both)
        {
            debug!(
                target: SESSION_TARGET,
                error = %error,
                "socket shutdown reported an error"
            );
        }
        self.routes().clear();
    }

    fn register(
        self: &Arc<Self>,
        id: u32,
        initial: Option<Vec<u8>>,
    ) -> Result<Stream, TransportError> {
        let (sender, inbox) = mpsc::channel();
        if let Some(payload) = initial
            && sender.send(Inbound::Data(payload)).is_err()
        {
            return Err(TransportError::SessionClosed);
        }
        let mut routes = self.routes();
        if self.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        routes.insert(id, sender);
        drop(routes);
        Ok(Stream {
            id,
            shared: Arc::clone(self),
            inbox,
            finished: Cell::new(false),
        })
    }
}

/// One multiplexed connection between host and plugin.
pub struct Session {
    shared: Arc<Shared>,
    incoming: Option<Mutex<Receiver<Stream>>>,
}

impl Session {
    /// Wraps a connected socket and starts the reader thread. Every payload
    /// travels inline on the socket.
    pub fn new(socket: UnixStream, role: Role) -> Result<Self, TransportError> {
        Self::build(socket, role, None)
    }

    /// Wraps a connected socket whose payloads travel through `region`.
    pub fn with_region(
        socket: UnixStream,
        role: Role,
        region: SharedRegion,
    ) -> Result<Self, TransportError> {
        Self::build(socket, role, Some(region))
    }

    fn build(
        socket: UnixStream,
        role: Role,
        region: Option<SharedRegion>,
    ) -> Result<Self, TransportError> {
        let reader = socket
            .try_clone()
            .map_err(|source| TransportError::io("cloning session socket", source))?;
        let control = socket
            .try_clone()
            .map_err(|source| TransportError::io("cloning session socket", source))?;
        let shared = Arc::new(Shared {
            role,
            writer: Mutex::new(socket),
            control,
            routes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU32::new(role.first_stream_id()),
            region,
        });

        let (accepted, incoming) = match role {
            Role::Plugin => {
                let (sender, receiver) = mpsc::channel();
                (Some(sender), Some(Mutex::new(receiver)))
            }
            Role::Host => (None, None),
        };

        let reader_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("otelplug-session".to_owned())
            .spawn(move || read_loop(&reader_shared, reader, accepted.as_ref()))
            .map_err(|source| TransportError::io("spawning session reader", source))?;

        Ok(Self { shared, incoming })
    }

    /// Which end this session represents.
    #[must_use]
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Opens a new stream.
    pub fn open_stream(&self) -> Result<Stream, TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::SessionClosed);
        }
        let id = self.shared.next_id.fetch_add(2, Ordering::SeqCst);
        self.shared.register(id, None)
    }

    /// Waits for the peer to open a stream; `None` once the session ends.
    ///
    /// Always `None` for host sessions.
    #[must_use]
    pub fn accept(&self) -> Option<Stream> {
        let incoming = self.incoming.as_ref()?;
        let receiver = incoming.lock().unwrap_or_else(PoisonError::into_inner);
        receiver.recv().ok()
    }

    /// Shuts the connection down; idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Reports whether the session has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Shared-memory region carrying this session's payloads, if any.
    #[must_use]
    pub fn region(&self) -> Option<&SharedRegion> {
        self.shared.region.as_ref()
    }

    /// Number of streams currently registered.
    #[must_use]
    pub fn open_stream_count(&self) -> usize {
        self.shared.routes().len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// A logical channel within a session.
pub struct Stream {
    id: u32,
    shared: Arc<Shared>,
    inbox: Receiver<Inbound>,
    finished: Cell<bool>,
}

impl Stream {
    /// Stream identifier.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Reports whether the stream can carry another exchange.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.finished.get() && !self.shared.is_closed()
    }

    /// Writes one data frame.
    pub fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        let result = self.shared.write_data(self.id, payload);
        if matches!(result, Err(TransportError::Io { .. })) {
            self.shared.close();
        }
        result
    }

    /// Waits for the next data frame within the context's bounds.
    pub fn recv(&self, ctx: &CallContext) -> Result<Vec<u8>, TransportError> {
        loop {
            ctx.check()?;
            match self.inbox.recv_timeout(ctx.wait_slice()) {
                Ok(inbound) => return self.accept_inbound(inbound),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished.set(true);
                    return Err(TransportError::SessionClosed);
                }
            }
        }
    }

    /// Waits for the next data frame with no deadline.
    pub fn recv_blocking(&self) -> Result<Vec<u8>, TransportError> {
        match self.inbox.recv() {
            Ok(inbound) => self.accept_inbound(inbound),
            Err(_) => {
                self.finished.set(true);
                Err(TransportError::SessionClosed)
            }
        }
    }

    /// Sends `payload` and waits for the reply.
    pub fn exchange(&self, ctx: &CallContext, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        ctx.check()?;
        self.send(payload)?;
        self.recv(ctx)
    }

    fn accept_inbound(&self, inbound: Inbound) -> Result<Vec<u8>, TransportError> {
        match inbound {
            Inbound::Data(payload) => Ok(payload),
            Inbound::Reset => {
                self.finished.set(true);
                Err(TransportError::StreamReset { stream: self.id })
            }
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("usable", &self.is_usable())
            .finish_non_exhaustive()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.shared.routes().remove(&self.id);
        if self.finished.get() || self.shared.is_closed() {
            return;
        }
        if let Err(error) = self.shared.write(&Frame::reset(self.id)) {
            debug!(
                target: SESSION_TARGET,
                stream = self.id,
                error = %error,
                "failed to send stream reset"
            );
        }
    }
}

fn read_loop(shared: &Arc<Shared>, socket: UnixStream, accepted: Option<&Sender<Stream>>) {
    let mut reader = BufReader::new(socket);
    loop {
        match Frame::read_from(&mut reader) {
            Ok(Some(frame)) => {
                if let Err(error) = route_frame(shared, frame, accepted) {
                    warn!(
                        target: SESSION_TARGET,
                        role = ?shared.role,
                        error = %error,
                        "session read failed"
                    );
                    break;
                }
            }
            Ok(None) => {
                debug!(target: SESSION_TARGET, role = ?shared.role, "peer closed session");
                break;
            }
            Err(error) => {
                if !shared.is_closed() {
                    warn!(
                        target: SESSION_TARGET,
                        role = ?shared.role,
                        error = %error,
                        "session read failed"
                    );
                }
                break;
            }
        }
    }
    shared.close();
}

fn route_frame(
    shared: &Arc<Shared>,
    frame: Frame,
    accepted: Option<&Sender<Stream>>,
) -> Result<(), TransportError> {
    let id = frame.stream();
    let payload = match frame.kind() {
        FrameKind::Reset => {
            let route = shared.routes().remove(&id);
            if let Some(route) = route
                && route.send(Inbound::Reset).is_err()
            {
                debug!(target: SESSION_TARGET, stream = id, "reset for departed stream");
            }
            return Ok(());
        }
        FrameKind::Data => frame.into_payload(),
        // Drain the ring even when the stream is gone so later doorbells
        // still line up with their bytes.
        FrameKind::Mapped => {
            let region = shared.region.as_ref().ok_or_else(|| TransportError::MalformedFrame {
                message: format!("mapped frame on stream {id} without a shared-memory region"),
            })?;
            region.pull(frame.mapped_len())?
        }
    };

    let route = shared.routes().get(&id).cloned();
    match (route, accepted) {
        (Some(route), _) => {
            if route.send(Inbound::Data(payload)).is_err() {
                debug!(target: SESSION_TARGET, stream = id, "dropping frame for departed stream");
            }
        }
        (None, Some(accepted)) if shared.role.is_peer_stream(id) => {
            accept_stream(shared, id, payload, accepted);
        }
        (None, _) => {
            debug!(target: SESSION_TARGET, stream = id, "discarding frame for unknown stream");
        }
    }
    Ok(())
}

fn accept_stream(shared: &Arc<Shared>, id: u32, payload: Vec<u8>, accepted: &Sender<Stream>) {
    match shared.register(id, Some(payload)) {
        Ok(stream) => {
            if accepted.send(stream).is_err() {
                debug!(target: SESSION_TARGET, stream = id, "no acceptor for incoming stream");
            }
        }
        Err(error) => {
            debug!(target: SESSION_TARGET, stream = id, error = %error, "could not accept stream");
        }
    }
}

#[cfg(test)]
mod tests;
