//! Request dispatcher and stream server.
//!
//! [`PluginServer`] keeps the handshake result and the started flag behind
//! one mutex and the health snapshot behind a read-write lock. Health is
//! only ever changed through [`PluginServer::update_health`], which also
//! refreshes the timestamp. The state lock may be held while taking the
//! health lock, never the reverse.
//!
//! Lifecycle hooks run with no lock held, so a slow `on_start` never stalls
//! `HealthCheck`. While a hook runs the state is marked as transitioning
//! and an overlapping `Start` or `Stop` is refused.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use otelplug_ipc::{
    ALREADY_STARTED, HealthStatus, INVALID_REQUEST, IpcRequest, IpcResponse, Method,
    NOT_INITIALIZED, NOT_STARTED, PluginHealth, PluginMetadata, Session, Stream, TransportError,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SdkError;
use crate::handler::PluginHandler;

const SERVER_TARGET: &str = "otelplug_sdk::server";

const ENCODE_FAILURE: &[u8] = br#"{"error":"failed to encode response"}"#;

/// Reply to `Start` or `Stop` while another lifecycle hook is running.
pub const TRANSITION_IN_PROGRESS: &str = "lifecycle transition in progress";

#[derive(Debug, Default)]
struct ServerState {
    metadata: Option<PluginMetadata>,
    started: bool,
    transitioning: bool,
}

/// Dispatches protocol requests to a [`PluginHandler`].
#[derive(Debug)]
pub struct PluginServer<H> {
    handler: H,
    state: Mutex<ServerState>,
    health: RwLock<PluginHealth>,
}

impl<H: PluginHandler> PluginServer<H> {
    /// Wraps `handler`; health starts as `unknown`.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            state: Mutex::new(ServerState::default()),
            health: RwLock::new(PluginHealth::unknown()),
        }
    }

    /// The wrapped handler.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Metadata confirmed by the last successful handshake.
    #[must_use]
    pub fn confirmed_metadata(&self) -> Option<PluginMetadata> {
        self.state().metadata.clone()
    }

    /// Whether `Start` has succeeded without a later `Stop`.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state().started
    }

    /// Current health snapshot.
    #[must_use]
    pub fn health(&self) -> PluginHealth {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the health snapshot, stamping it with the current time.
    pub fn update_health(&self, mut health: PluginHealth) -> PluginHealth {
        health.touch();
        let mut guard = self.health.write().unwrap_or_else(PoisonError::into_inner);
        *guard = health;
        guard.clone()
    }

    /// Decodes and dispatches one encoded request.
    ///
    /// Bytes that are not a request yield an `invalid request` failure.
    #[must_use]
    pub fn handle_bytes(&self, bytes: &[u8]) -> IpcResponse {
        match IpcRequest::decode(bytes) {
            Ok(request) => self.handle(&request),
            Err(error) => IpcResponse::failure(format!("{INVALID_REQUEST}: {error}")),
        }
    }

    /// Dispatches one request; always produces exactly one response.
    #[must_use]
    pub fn handle(&self, request: &IpcRequest) -> IpcResponse {
        let method = match request.method() {
            Ok(method) => method,
            Err(error) => return IpcResponse::failure(error.to_string()),
        };
        debug!(target: SERVER_TARGET, method = %method, "dispatching request");
        if method != Method::Initialize && self.state().metadata.is_none() {
            return IpcResponse::failure(NOT_INITIALIZED);
        }
        match method {
            Method::Initialize => self.initialize(request),
            Method::Start => self.start(),
            Method::Stop => self.stop(),
            Method::HealthCheck => respond(&self.health_check()),
            Method::GetFactory => match self.handler.factory() {
                Ok(descriptor) => respond(&descriptor),
                Err(message) => IpcResponse::failure(message),
            },
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialize(&self, request: &IpcRequest) -> IpcResponse {
        let declared: PluginMetadata = match request.params_as() {
            Ok(declared) => declared,
            Err(error) => return IpcResponse::failure(format!("{INVALID_REQUEST}: {error}")),
        };
        let own = self.handler.metadata();
        if let Err(message) = check_declared(&own, &declared) {
            warn!(target: SERVER_TARGET, plugin = own.name(), %message, "rejecting handshake");
            return IpcResponse::failure(message);
        }
        if let Err(message) = self.handler.accept(&declared) {
            return IpcResponse::failure(message);
        }

        let confirmed = own.with_provenance_of(&declared);
        let mut state = self.state();
        if state.metadata.is_none() {
            info!(
                target: SERVER_TARGET,
                plugin = confirmed.name(),
                version = confirmed.version(),
                "plugin initialised"
            );
        }
        state.metadata = Some(confirmed.clone());
        drop(state);
        respond(&confirmed)
    }

    fn start(&self) -> IpcResponse {
        if let Err(refusal) = self.begin_transition(false) {
            return IpcResponse::failure(refusal);
        }
        let outcome = self.handler.on_start();
        let mut state = self.state();
        state.transitioning = false;
        match outcome {
            Ok(()) => {
                state.started = true;
                let health = self.update_health(PluginHealth::new(HealthStatus::Healthy, "started"));
                drop(state);
                respond(&health)
            }
            Err(message) => {
                drop(state);
                self.update_health(PluginHealth::failed("start failed", message.clone()));
                IpcResponse::failure(message)
            }
        }
    }

    fn stop(&self) -> IpcResponse {
        if let Err(refusal) = self.begin_transition(true) {
            return IpcResponse::failure(refusal);
        }
        let outcome = self.handler.on_stop();
        let mut state = self.state();
        state.transitioning = false;
        match outcome {
            Ok(()) => {
                state.started = false;
                let health = self.update_health(PluginHealth::new(HealthStatus::Stopped, "stopped"));
                drop(state);
                respond(&health)
            }
            Err(message) => IpcResponse::failure(message),
        }
    }

    /// Claims the lifecycle for one hook call when the started flag matches
    /// `started`.
    fn begin_transition(&self, started: bool) -> Result<(), &'static str> {
        let mut state = self.state();
        if state.transitioning {
            return Err(TRANSITION_IN_PROGRESS);
        }
        match (state.started, started) {
            (true, false) => Err(ALREADY_STARTED),
            (false, true) => Err(NOT_STARTED),
            _ => {
                state.transitioning = true;
                Ok(())
            }
        }
    }

    fn health_check(&self) -> PluginHealth {
        let observed = self
            .handler
            .observe_health()
            .unwrap_or_else(|| self.health());
        self.update_health(observed)
    }
}

impl<H: PluginHandler> PluginServer<H> {
    /// Serves every stream the host opens until the session closes.
    ///
    /// Each stream is served on its own thread, one request/response pair at
    /// a time.
    pub fn serve(self: &Arc<Self>, session: &Session) -> Result<(), SdkError> {
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        while let Some(stream) = session.accept() {
            workers.retain(|worker| !worker.is_finished());
            let server = Arc::clone(self);
            let worker = thread::Builder::new()
                .name(format!("otelplug-stream-{}", stream.id()))
                .spawn(move || server.serve_stream(&stream))
                .map_err(|source| SdkError::Spawn { source })?;
            workers.push(worker);
        }
        for worker in workers {
            if worker.join().is_err() {
                warn!(target: SERVER_TARGET, "stream worker panicked");
            }
        }
        debug!(target: SERVER_TARGET, "session ended");
        Ok(())
    }

    fn serve_stream(&self, stream: &Stream) {
        loop {
            let bytes = match stream.recv_blocking() {
                Ok(bytes) => bytes,
                Err(TransportError::StreamReset { .. } | TransportError::SessionClosed) => return,
                Err(error) => {
                    warn!(target: SERVER_TARGET, stream = stream.id(), error = %error, "stream read failed");
                    return;
                }
            };
            let response = self.handle_bytes(&bytes);
            let encoded = response.encode().unwrap_or_else(|error| {
                warn!(target: SERVER_TARGET, error = %error, "failed to encode response");
                ENCODE_FAILURE.to_vec()
            });
            if let Err(error) = stream.send(encoded) {
                debug!(target: SERVER_TARGET, stream = stream.id(), error = %error, "reply not delivered");
                return;
            }
        }
    }
}

fn respond<T: Serialize>(value: &T) -> IpcResponse {
    IpcResponse::success_with(value).unwrap_or_else(|error| IpcResponse::failure(error.to_string()))
}

fn check_declared(own: &PluginMetadata, declared: &PluginMetadata) -> Result<(), String> {
    if declared.name() != own.name() {
        return Err(format!(
            "plugin name mismatch: host expects '{}', plugin is '{}'",
            declared.name(),
            own.name()
        ));
    }
    if declared.plugin_type() != own.plugin_type() {
        return Err(format!(
            "plugin type mismatch: host expects '{}', plugin is '{}'",
            declared.plugin_type(),
            own.plugin_type()
        ));
    }
    if !declared.version().is_empty() && declared.version() != own.version() {
        return Err(format!(
            "plugin version mismatch: host expects '{}', plugin is '{}'",
            declared.version(),
            own.version()
        ));
    }
    let unsupported: BTreeSet<&str> = declared
        .capabilities()
        .difference(own.capabilities())
        .map(String::as_str)
        .collect();
    if !unsupported.is_empty() {
        let list: Vec<&str> = unsupported.into_iter().collect();
        return Err(format!("unsupported capabilities: {}", list.join(", ")));
    }
    Ok(())
}
