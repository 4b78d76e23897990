//! Request/response envelopes exchanged on a stream.
//!
//! Each stream exchange is one JSON-encoded [`IpcRequest`] answered by one
//! JSON-encoded [`IpcResponse`]. A response carries either a `result` or a
//! non-empty `error`, never both.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Reply to `Start` when the plugin is already running.
pub const ALREADY_STARTED: &str = "plugin already started";

/// Reply to `Stop` when the plugin is not running.
pub const NOT_STARTED: &str = "plugin not started";

/// Reply to any call other than `Initialize` before the handshake.
pub const NOT_INITIALIZED: &str = "plugin not initialized";

/// Prefix of the reply to bytes that do not decode as a request.
pub const INVALID_REQUEST: &str = "invalid request";

/// Operations a plugin serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Identity handshake.
    Initialize,
    /// Begin processing.
    Start,
    /// Cease processing.
    Stop,
    /// Report health.
    HealthCheck,
    /// Return the component factory descriptor.
    GetFactory,
}

impl Method {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Start => "Start",
            Self::Stop => "Stop",
            Self::HealthCheck => "HealthCheck",
            Self::GetFactory => "GetFactory",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "Initialize" => Ok(Self::Initialize),
            "Start" => Ok(Self::Start),
            "Stop" => Ok(Self::Stop),
            "HealthCheck" => Ok(Self::HealthCheck),
            "GetFactory" => Ok(Self::GetFactory),
            other => Err(ProtocolError::UnknownMethod {
                method: other.to_owned(),
            }),
        }
    }
}

/// A request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

impl IpcRequest {
    /// Request with no parameters.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            method: method.as_str().to_owned(),
            params: Value::Null,
        }
    }

    /// Request carrying `params` serialised as JSON.
    pub fn with_params<T: Serialize>(method: Method, params: &T) -> Result<Self, ProtocolError> {
        let params =
            serde_json::to_value(params).map_err(|source| ProtocolError::encode("params", source))?;
        Ok(Self {
            method: method.as_str().to_owned(),
            params,
        })
    }

    /// Request with an arbitrary method name, for exercising unknown methods.
    #[must_use]
    pub fn raw(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Method name as sent.
    #[must_use]
    pub fn method_name(&self) -> &str {
        &self.method
    }

    /// Parses the method name.
    pub fn method(&self) -> Result<Method, ProtocolError> {
        self.method.parse()
    }

    /// Raw parameters.
    #[must_use]
    pub const fn params(&self) -> &Value {
        &self.params
    }

    /// Decodes the parameters as `T`.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.params.clone())
            .map_err(|source| ProtocolError::decode("params", source))
    }

    /// Serialises the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|source| ProtocolError::encode("request", source))
    }

    /// Deserialises an envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|source| ProtocolError::decode("request", source))
    }
}

/// A response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl IpcResponse {
    /// Successful response.
    #[must_use]
    pub const fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    /// Successful response carrying `value` serialised as JSON.
    pub fn success_with<T: Serialize>(value: &T) -> Result<Self, ProtocolError> {
        serde_json::to_value(value)
            .map(Self::success)
            .map_err(|source| ProtocolError::encode("result", source))
    }

    /// Failed response.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(message.into()),
        }
    }

    /// Builds a response without enforcing exclusivity, for protocol tests.
    #[must_use]
    pub const fn from_parts(result: Option<Value>, error: Option<String>) -> Self {
        Self { result, error }
    }

    /// Remote failure message, if any.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref().filter(|message| !message.is_empty())
    }

    /// Result payload, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Splits the response into the remote outcome.
    ///
    /// A success without a `result` yields `Value::Null`.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(message) if !message.is_empty() => Err(message),
            _ => Ok(self.result.unwrap_or(Value::Null)),
        }
    }

    /// Serialises the envelope.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|source| ProtocolError::encode("response", source))
    }

    /// Deserialises an envelope, rejecting one that carries both fields.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let response: Self = serde_json::from_slice(bytes)
            .map_err(|source| ProtocolError::decode("response", source))?;
        if response.error().is_some() && response.result.is_some() {
            return Err(ProtocolError::Malformed {
                message: "response carries both result and error".to_owned(),
            });
        }
        Ok(response)
    }
}

/// Decodes a successful result payload as `T`.
pub fn decode_result<T: DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::decode("result", source))
}

#[cfg(test)]
mod tests;
