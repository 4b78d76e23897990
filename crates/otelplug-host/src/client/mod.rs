//! Typed request/response calls to one loaded plugin.

use std::sync::Arc;
use std::time::Duration;

use otelplug_config::Config;
use otelplug_ipc::{
    ALREADY_STARTED, CallContext, FactoryDescriptor, IpcRequest, IpcResponse, Method, NOT_STARTED,
    PluginHealth, PluginMetadata, ProtocolError, TransportError, decode_result,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{Phase, PluginError};
use crate::pool::StreamPool;

const CLIENT_TARGET: &str = "otelplug_host::client";

/// Per-method default budgets applied on top of the caller's context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// `Initialize` handshake.
    pub initialize: Duration,
    /// `Start` and `Stop`.
    pub control: Duration,
    /// `HealthCheck`.
    pub health: Duration,
    /// `GetFactory`.
    pub factory: Duration,
}

impl CallTimeouts {
    /// Reads the budgets from host configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            initialize: config.initialize_timeout(),
            control: config.call_timeout(),
            health: config.health_timeout(),
            factory: config.factory_timeout(),
        }
    }

    /// Budget for `method`.
    #[must_use]
    pub const fn for_method(&self, method: Method) -> Duration {
        match method {
            Method::Initialize => self.initialize,
            Method::Start | Method::Stop => self.control,
            Method::HealthCheck => self.health,
            Method::GetFactory => self.factory,
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Handle for calling one plugin. Cheap to clone; clones share the stream
/// pool.
#[derive(Debug, Clone)]
pub struct PluginClient {
    name: Arc<str>,
    pool: Arc<StreamPool>,
    timeouts: CallTimeouts,
}

impl PluginClient {
    /// Wraps a pool connected to the plugin called `name`.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, pool: Arc<StreamPool>, timeouts: CallTimeouts) -> Self {
        Self {
            name: name.into(),
            pool,
            timeouts,
        }
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Budgets applied to the typed calls.
    #[must_use]
    pub const fn timeouts(&self) -> CallTimeouts {
        self.timeouts
    }

    /// Reports whether the session to the plugin has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Sends the handshake and returns the metadata the plugin confirmed.
    pub fn initialize(
        &self,
        ctx: &CallContext,
        expected: &PluginMetadata,
    ) -> Result<PluginMetadata, PluginError> {
        self.typed(ctx, Method::Initialize, expected)
    }

    /// Asks the plugin to begin processing.
    pub fn start(&self, ctx: &CallContext) -> Result<PluginHealth, PluginError> {
        self.typed(ctx, Method::Start, &Value::Null)
    }

    /// Asks the plugin to cease processing.
    pub fn stop(&self, ctx: &CallContext) -> Result<PluginHealth, PluginError> {
        self.typed(ctx, Method::Stop, &Value::Null)
    }

    /// Fetches the plugin's current health.
    pub fn health_check(&self, ctx: &CallContext) -> Result<PluginHealth, PluginError> {
        self.typed(ctx, Method::HealthCheck, &Value::Null)
    }

    /// Fetches the plugin's component factory descriptor.
    pub fn factory(&self, ctx: &CallContext) -> Result<FactoryDescriptor, PluginError> {
        self.typed(ctx, Method::GetFactory, &Value::Null)
    }

    /// Performs one exchange bounded by `ctx` alone and returns the raw
    /// result.
    ///
    /// Remote "already started" and "not started" replies become
    /// [`PluginError::AlreadyStarted`] and [`PluginError::NotStarted`].
    pub fn call<P: Serialize>(
        &self,
        ctx: &CallContext,
        method: Method,
        params: &P,
    ) -> Result<Value, PluginError> {
        let request =
            IpcRequest::with_params(method, params).map_err(|source| self.protocol(method, source))?;
        let payload = request
            .encode()
            .map_err(|source| self.protocol(method, source))?;

        let pooled = self
            .pool
            .acquire(ctx)
            .map_err(|error| self.transport(ctx, method, error))?;
        let reply = pooled
            .exchange(ctx, payload)
            .map_err(|error| self.transport(ctx, method, error))?;
        pooled.complete();

        let response = IpcResponse::decode(&reply).map_err(|source| self.protocol(method, source))?;
        response.into_result().map_err(|message| {
            debug!(
                target: CLIENT_TARGET,
                plugin = %self.name,
                method = %method,
                message = %message,
                "plugin returned an error"
            );
            self.remote(method, message)
        })
    }

    /// Closes the session, aborting every outstanding call.
    pub fn close(&self) {
        self.pool.close();
    }

    fn typed<P: Serialize, T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        method: Method,
        params: &P,
    ) -> Result<T, PluginError> {
        let bounded = ctx.child(self.timeouts.for_method(method));
        let value = self.call(&bounded, method, params)?;
        decode_result(value).map_err(|source| self.protocol(method, source))
    }

    fn transport(&self, ctx: &CallContext, method: Method, error: TransportError) -> PluginError {
        let name = self.name.to_string();
        match error {
            TransportError::DeadlineExceeded => PluginError::Timeout {
                name,
                phase: Phase::Io,
                timeout_ms: budget_ms(ctx),
            },
            TransportError::Cancelled => PluginError::Cancelled {
                name,
                phase: Phase::Io,
            },
            source => PluginError::Transport {
                name,
                method,
                source,
            },
        }
    }

    fn protocol(&self, method: Method, source: ProtocolError) -> PluginError {
        PluginError::Protocol {
            name: self.name.to_string(),
            method,
            source,
        }
    }

    fn remote(&self, method: Method, message: String) -> PluginError {
        let name = self.name.to_string();
        match message.as_str() {
            ALREADY_STARTED => PluginError::AlreadyStarted { name },
            NOT_STARTED => PluginError::NotStarted { name },
            _ => PluginError::Remote {
                name,
                method,
                message,
            },
        }
    }
}

/// Milliseconds in the budget that bounded `ctx`, or zero when unbounded.
pub(crate) fn budget_ms(ctx: &CallContext) -> u64 {
    ctx.budget()
        .map_or(0, |budget| u64::try_from(budget.as_millis()).unwrap_or(u64::MAX))
}
