//! JSON codec for the tagged message union.
//!
//! Decoding dispatches on the `type` field: the reserved tags `OK`, `ERR`
//! and `PUSH` select a reply or push; any other string is a task name and
//! selects a request. Fields the codec does not recognize are moved into
//! the message's `extras` map and written back on encode, so foreign
//! annotations survive a round trip.

use serde_json::{Map, Value};

use crate::{Message, Push, Reply, Request, WireError, TAG_ERR, TAG_OK, TAG_PUSH};

/// Decode failures. The containing transport treats any of these as a
/// protocol error and closes with [`crate::CloseCode::ProtocolError`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("missing or malformed \"{0}\" field")]
    BadField(&'static str),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

impl Message {
    /// Encode to the JSON wire text.
    pub fn encode(&self) -> String {
        let value = match self {
            Message::Request(req) => {
                let mut obj = req.extras.clone();
                obj.insert("type".into(), Value::String(req.task.clone()));
                obj.insert("id".into(), Value::String(req.id.clone()));
                obj.insert("payload".into(), req.payload.clone());
                Value::Object(obj)
            }
            Message::Reply(Reply::Ok {
                id,
                payload,
                extras,
            }) => {
                let mut obj = extras.clone();
                obj.insert("type".into(), Value::String(TAG_OK.into()));
                obj.insert("id".into(), Value::String(id.clone()));
                obj.insert("payload".into(), payload.clone());
                Value::Object(obj)
            }
            Message::Reply(Reply::Err { id, error, extras }) => {
                let mut obj = extras.clone();
                obj.insert("type".into(), Value::String(TAG_ERR.into()));
                obj.insert("id".into(), Value::String(id.clone()));
                obj.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or_else(|_| {
                        Value::String(error.message.clone())
                    }),
                );
                Value::Object(obj)
            }
            Message::Push(push) => {
                let mut obj = push.extras.clone();
                obj.insert("type".into(), Value::String(TAG_PUSH.into()));
                obj.insert("event".into(), Value::String(push.event.clone()));
                obj.insert("payload".into(), push.payload.clone());
                Value::Object(obj)
            }
        };
        value.to_string()
    }

    /// Decode from JSON wire text.
    pub fn decode(text: &str) -> Result<Self, CodecError> {
        let value: Value = serde_json::from_str(text)?;
        let mut obj = match value {
            Value::Object(obj) => obj,
            _ => return Err(CodecError::NotAnObject),
        };

        let tag = match obj.remove("type") {
            Some(Value::String(s)) => s,
            _ => return Err(CodecError::BadField("type")),
        };

        match tag.as_str() {
            TAG_OK => {
                let id = take_string(&mut obj, "id")?;
                let payload = obj.remove("payload").unwrap_or(Value::Null);
                Ok(Message::Reply(Reply::Ok {
                    id,
                    payload,
                    extras: obj,
                }))
            }
            TAG_ERR => {
                let id = take_string(&mut obj, "id")?;
                let error = WireError::from_value(obj.remove("error").unwrap_or(Value::Null));
                Ok(Message::Reply(Reply::Err {
                    id,
                    error,
                    extras: obj,
                }))
            }
            TAG_PUSH => {
                let event = take_string(&mut obj, "event")?;
                let payload = obj.remove("payload").unwrap_or(Value::Null);
                Ok(Message::Push(Push {
                    event,
                    payload,
                    extras: obj,
                }))
            }
            _ => {
                let id = take_string(&mut obj, "id")?;
                let payload = obj.remove("payload").unwrap_or(Value::Null);
                Ok(Message::Request(Request {
                    task: tag,
                    id,
                    payload,
                    extras: obj,
                }))
            }
        }
    }

    /// Decode from raw bytes, rejecting non-UTF-8 input.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
        Self::decode(text)
    }
}

fn take_string(obj: &mut Map<String, Value>, field: &'static str) -> Result<String, CodecError> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        _ => Err(CodecError::BadField(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn roundtrip(message: Message) {
        let encoded = message.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(message, decoded);
    }

    #[test]
    fn request_roundtrip() {
        roundtrip(Message::Request(Request::new(
            "ADD",
            json!({"x": 3, "y": 5}),
        )));
    }

    #[test]
    fn ok_roundtrip() {
        roundtrip(Message::Reply(Reply::ok("req-1", json!(8))));
    }

    #[test]
    fn err_roundtrip() {
        roundtrip(Message::Reply(Reply::err(
            "req-2",
            WireError::new("Unknown request type: \"NOPE\"").with_code(404),
        )));
    }

    #[test]
    fn push_roundtrip() {
        roundtrip(Message::Push(Push::new("foo", json!({"n": 1}))));
        roundtrip(Message::Push(Push::new("bare", Value::Null)));
    }

    #[test]
    fn request_tag_is_the_task_name() {
        let encoded = Message::Request(Request::with_id("SLEEP", "abc", Value::Null)).encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], json!("SLEEP"));
        assert_eq!(value["id"], json!("abc"));
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let decoded = Message::decode(
            r#"{"type":"ADD","id":"r1","payload":{"x":1},"trace":"00-abc","hop":3}"#,
        )
        .unwrap();
        match &decoded {
            Message::Request(req) => {
                assert_eq!(req.extras.get("trace"), Some(&json!("00-abc")));
                assert_eq!(req.extras.get("hop"), Some(&json!(3)));
            }
            other => panic!("expected request, got {:?}", other),
        }

        let reencoded = decoded.encode();
        let value: Value = serde_json::from_str(&reencoded).unwrap();
        assert_eq!(value["trace"], json!("00-abc"));
        assert_eq!(value["hop"], json!(3));
        assert_eq!(Message::decode(&reencoded).unwrap(), decoded);
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let decoded = Message::decode(r#"{"type":"OK","id":"r1"}"#).unwrap();
        assert_eq!(decoded, Message::Reply(Reply::ok("r1", Value::Null)));
    }

    #[test]
    fn err_with_opaque_error_value() {
        let decoded = Message::decode(r#"{"type":"ERR","id":"r1","error":"boom"}"#).unwrap();
        match decoded {
            Message::Reply(Reply::Err { error, .. }) => {
                assert_eq!(error.message, "boom");
                assert_eq!(error.code, None);
            }
            other => panic!("expected ERR, got {:?}", other),
        }
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(matches!(
            Message::decode("not json"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            Message::decode("[1,2,3]"),
            Err(CodecError::NotAnObject)
        ));
        assert!(matches!(
            Message::decode(r#"{"id":"x"}"#),
            Err(CodecError::BadField("type"))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"ADD"}"#),
            Err(CodecError::BadField("id"))
        ));
        assert!(matches!(
            Message::decode(r#"{"type":"PUSH","payload":1}"#),
            Err(CodecError::BadField("event"))
        ));
        assert!(matches!(
            Message::decode_bytes(&[0xff, 0xfe]),
            Err(CodecError::InvalidUtf8)
        ));
    }
}
