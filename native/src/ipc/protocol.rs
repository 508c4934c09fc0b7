// Wire frames exchanged with the installer process, JSON encoded.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Key of the single-field object standing in for a callback inside parameters.
pub const CALLBACK_KEY: &str = "__callback";

/// Opaque token the peer receives instead of a function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackId(String);

impl CallbackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Placeholder object embedded in request parameters.
    pub fn placeholder(&self) -> Value {
        let mut object = serde_json::Map::with_capacity(1);
        object.insert(CALLBACK_KEY.to_string(), Value::String(self.0.clone()));
        Value::Object(object)
    }

    /// Recognize a placeholder object produced by either side.
    pub fn from_placeholder(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.len() != 1 {
            return None;
        }
        match object.get(CALLBACK_KEY)? {
            Value::String(id) => Some(Self(id.clone())),
            Value::Number(id) => Some(Self(id.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure payload carried by response and reply frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// One message on the wire.
///
/// `id` correlates a `Request` with its `Response` and a `CallbackInvoke` with its
/// `CallbackReply`. Each side allocates ids for the frames it originates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
    CallbackInvoke {
        id: u64,
        callback: CallbackId,
        #[serde(default)]
        args: Value,
    },
    CallbackReply {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
}

impl Frame {
    pub fn response(id: u64, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(data) => Frame::Response {
                id,
                data: Some(data),
                error: None,
            },
            Err(error) => Frame::Response {
                id,
                data: None,
                error: Some(error),
            },
        }
    }

    pub fn reply(id: u64, outcome: Result<Value, RemoteError>) -> Self {
        match outcome {
            Ok(data) => Frame::CallbackReply {
                id,
                data: Some(data),
                error: None,
            },
            Err(error) => Frame::CallbackReply {
                id,
                data: None,
                error: Some(error),
            },
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            Frame::Request { id, .. }
            | Frame::Response { id, .. }
            | Frame::CallbackInvoke { id, .. }
            | Frame::CallbackReply { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::CallbackInvoke { .. } => "callback_invoke",
            Frame::CallbackReply { .. } => "callback_reply",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Collapse the data/error pair of a response or reply.
pub(crate) fn outcome(data: Option<Value>, error: Option<RemoteError>) -> Result<Value, RemoteError> {
    match error {
        Some(error) => Err(error),
        None => Ok(data.unwrap_or(Value::Null)),
    }
}

/// Faults that are logged and dropped; the connection survives them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("no pending request or invocation with id {0}")]
    UnknownCorrelation(u64),
    #[error("frame {kind} does not match pending entry {id}")]
    MismatchedReply { id: u64, kind: &'static str },
    #[error("unknown or already released callback {0}")]
    UnknownCallback(CallbackId),
    #[error("unsupported method {0}")]
    UnsupportedMethod(String),
}

impl ProtocolError {
    /// Error payload returned to the peer when its frame cannot be served.
    pub fn to_remote(&self) -> RemoteError {
        RemoteError::new("ProtocolError", self.to_string())
    }
}
