//! palaverproto - Wire protocol types for the Palaver RPC substrate
//!
//! This crate defines the messages exchanged between Palaver clients and
//! servers as JSON text over a full-duplex channel (or an HTTP POST body).
//! Four message shapes exist on the wire, discriminated by the `type` field:
//!
//! - Request:  `{"type": <task>, "id": <string>, "payload": <any>}`
//! - OK reply: `{"type": "OK", "id": <string>, "payload": <any>}`
//! - ERR reply: `{"type": "ERR", "id": <string>, "error": <any>}`
//! - Push:     `{"type": "PUSH", "event": <string>, "payload": <any>}`
//!
//! `type` carries the task name for requests and the literal tag otherwise,
//! so the codec dispatches on the reserved tags first and treats everything
//! else as a request. Unknown fields survive a decode in `extras` and are
//! written back on encode.

pub mod close;
pub mod codec;

pub use close::CloseCode;
pub use codec::CodecError;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved task type that invokes the server healthcheck.
pub const PING_TASK: &str = "$PING";

/// Wire tag for successful replies.
pub const TAG_OK: &str = "OK";
/// Wire tag for error replies.
pub const TAG_ERR: &str = "ERR";
/// Wire tag for server-originated pushes.
pub const TAG_PUSH: &str = "PUSH";

/// A client-originated request, correlated to its reply by `id`.
///
/// The codec is the wire boundary: on the wire the task name rides in the
/// `type` field, so these structs do not carry serde derives of their own.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Task type; keys of the application schema.
    pub task: String,
    /// Globally unique correlation id, echoed in the reply.
    pub id: String,
    /// Opaque task input.
    pub payload: Value,
    /// Unknown wire fields preserved across a decode.
    pub extras: Map<String, Value>,
}

impl Request {
    /// Create a request with a fresh UUID-v4 correlation id.
    pub fn new(task: impl Into<String>, payload: Value) -> Self {
        Self {
            task: task.into(),
            id: Uuid::new_v4().to_string(),
            payload,
            extras: Map::new(),
        }
    }

    /// Create a request with a caller-supplied id.
    pub fn with_id(task: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            task: task.into(),
            id: id.into(),
            payload,
            extras: Map::new(),
        }
    }

    /// Whether this request targets the reserved healthcheck task.
    pub fn is_ping(&self) -> bool {
        self.task == PING_TASK
    }
}

/// Error shape carried by ERR replies.
///
/// The legacy protocol passed arbitrary error values through verbatim; this
/// implementation narrows to a single schema. `code`, when it lands in the
/// valid HTTP error range, doubles as the status of the HTTP variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Coerce an arbitrary wire value into the error schema.
    ///
    /// Objects contribute their `message`/`code`/`details` fields; strings
    /// become the message; anything else is rendered as compact JSON.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(mut obj) => {
                let message_field = obj.remove("message");
                let code = obj
                    .remove("code")
                    .and_then(|c| c.as_u64())
                    .and_then(|c| u16::try_from(c).ok());
                let details = obj.remove("details");
                // The fallback stringifies only what is left once the
                // admin fields are extracted, so a code is not baked into
                // the message text a second time.
                let message = match message_field {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => Value::Object(obj).to_string(),
                };
                Self {
                    message,
                    code,
                    details,
                }
            }
            Value::String(s) => Self::new(s),
            other => Self::new(other.to_string()),
        }
    }

    /// HTTP status for this error: `code` when it is a valid error status,
    /// else 500.
    pub fn http_status(&self) -> u16 {
        match self.code {
            Some(c) if (400..=599).contains(&c) => c,
            _ => 500,
        }
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WireError {}

/// The terminal outcome of a request. Exactly one per accepted id.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok {
        id: String,
        payload: Value,
        extras: Map<String, Value>,
    },
    Err {
        id: String,
        error: WireError,
        extras: Map<String, Value>,
    },
}

impl Reply {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self::Ok {
            id: id.into(),
            payload,
            extras: Map::new(),
        }
    }

    pub fn err(id: impl Into<String>, error: WireError) -> Self {
        Self::Err {
            id: id.into(),
            error,
            extras: Map::new(),
        }
    }

    /// Correlation id this reply retires.
    pub fn id(&self) -> &str {
        match self {
            Self::Ok { id, .. } => id,
            Self::Err { id, .. } => id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Unwrap into the caller-facing result.
    pub fn into_result(self) -> Result<Value, WireError> {
        match self {
            Self::Ok { payload, .. } => Ok(payload),
            Self::Err { error, .. } => Err(error),
        }
    }
}

/// A server-originated event. Carries no id and expects no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Push {
    pub event: String,
    pub payload: Value,
    pub extras: Map<String, Value>,
}

impl Push {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            extras: Map::new(),
        }
    }
}

/// Everything that can appear on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Reply(Reply),
    Push(Push),
}

impl From<Request> for Message {
    fn from(r: Request) -> Self {
        Self::Request(r)
    }
}

impl From<Reply> for Message {
    fn from(r: Reply) -> Self {
        Self::Reply(r)
    }
}

impl From<Push> for Message {
    fn from(p: Push) -> Self {
        Self::Push(p)
    }
}
