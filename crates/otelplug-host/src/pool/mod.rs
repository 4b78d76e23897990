//! Bounded pool of reusable streams over one plugin session.
//!
//! Streams are handed out as [`PooledStream`] guards. A guard returns its
//! stream to the idle list only after [`PooledStream::complete`]; every other
//! exit path (error, timeout, cancellation, panic) drops the stream, which
//! resets it on the peer.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use otelplug_ipc::{CallContext, Session, Stream, TransportError};

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Stream>,
    in_use: usize,
}

/// Streams over one session, capped at `capacity` concurrently in use.
#[derive(Debug)]
pub struct StreamPool {
    session: Arc<Session>,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl StreamPool {
    /// Creates an empty pool; `capacity` is raised to at least one.
    #[must_use]
    pub fn new(session: Arc<Session>, capacity: usize) -> Self {
        Self {
            session,
            capacity: capacity.max(1),
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    /// Maximum number of streams in use at once.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Streams waiting for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.state().idle.len()
    }

    /// Streams currently checked out.
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.state().in_use
    }

    /// Checks out a stream, reusing an idle one when possible.
    ///
    /// Waits for a free slot while the pool is at capacity, within the
    /// context's bounds.
    pub fn acquire(&self, ctx: &CallContext) -> Result<PooledStream<'_>, TransportError> {
        let mut state = self.state();
        loop {
            ctx.check()?;
            if self.session.is_closed() {
                return Err(TransportError::SessionClosed);
            }
            if let Some(stream) = state.idle.pop() {
                if stream.is_usable() {
                    state.in_use += 1;
                    return Ok(PooledStream::new(self, stream));
                }
                continue;
            }
            if state.in_use < self.capacity {
                state.in_use += 1;
                drop(state);
                return match self.session.open_stream() {
                    Ok(stream) => Ok(PooledStream::new(self, stream)),
                    Err(error) => {
                        self.release(None);
                        Err(error)
                    }
                };
            }
            state = self
                .available
                .wait_timeout(state, ctx.wait_slice())
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Drops every idle stream and wakes all waiters.
    pub fn drain(&self) {
        let idle = std::mem::take(&mut self.state().idle);
        drop(idle);
        self.available.notify_all();
    }

    /// Drains the pool and closes the session; waiting streams observe
    /// `SessionClosed`.
    pub fn close(&self) {
        self.session.close();
        self.drain();
    }

    /// Reports whether the underlying session has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, stream: Option<Stream>) {
        let reusable = stream.filter(Stream::is_usable);
        let mut state = self.state();
        state.in_use = state.in_use.saturating_sub(1);
        if let Some(stream) = reusable {
            state.idle.push(stream);
        }
        drop(state);
        self.available.notify_one();
    }
}

/// A checked-out stream.
#[derive(Debug)]
pub struct PooledStream<'pool> {
    pool: &'pool StreamPool,
    stream: Option<Stream>,
    completed: bool,
}

impl<'pool> PooledStream<'pool> {
    const fn new(pool: &'pool StreamPool, stream: Stream) -> Self {
        Self {
            pool,
            stream: Some(stream),
            completed: false,
        }
    }

    /// Sends `payload` and waits for the reply on the checked-out stream.
    pub fn exchange(&self, ctx: &CallContext, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        match &self.stream {
            Some(stream) => stream.exchange(ctx, payload),
            None => Err(TransportError::SessionClosed),
        }
    }

    /// Marks the exchange finished so the stream returns to the pool.
    pub fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for PooledStream<'_> {
    fn drop(&mut self) {
        let stream = self.stream.take();
        if self.completed {
            self.pool.release(stream);
        } else {
            drop(stream);
            self.pool.release(None);
        }
    }
}
