//! The tagged message envelope exchanged with sandboxed plugins.

use crate::ids::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single message crossing the sandbox boundary, in either direction.
///
/// Every `Call` is answered by exactly one `Response` carrying the same id.
/// A response with an `error` is a failure; otherwise `result` (or `null`
/// when absent) is the return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Call {
        id: CallId,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Response {
        id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    /// Sent once by the plugin when its bootstrap has finished.
    Ready,
}

impl Envelope {
    /// Builds a call with a freshly minted id, returning the id alongside.
    pub fn call(method: impl Into<String>, args: Vec<Value>) -> (CallId, Self) {
        let id = CallId::new();
        let envelope = Self::Call {
            id: id.clone(),
            method: method.into(),
            args,
        };
        (id, envelope)
    }

    /// Successful response to `id`.
    pub fn ok(id: CallId, result: Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Failed response to `id`.
    pub fn err(id: CallId, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(message.into()),
        }
    }

    /// Builds a response from a handler outcome.
    pub fn reply(id: CallId, outcome: Result<Value, String>) -> Self {
        match outcome {
            Ok(value) => Self::ok(id, value),
            Err(message) => Self::err(id, message),
        }
    }

    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
        }
    }

    /// The wire tag of this envelope.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::Response { .. } => "response",
            Self::Event { .. } => "event",
            Self::Ready => "ready",
        }
    }
}

/// Collapses the optional `result`/`error` pair of a response.
pub fn response_outcome(result: Option<Value>, error: Option<String>) -> Result<Value, String> {
    match error {
        Some(message) => Err(message),
        None => Ok(result.unwrap_or(Value::Null)),
    }
}
