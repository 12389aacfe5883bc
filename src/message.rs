//! The message envelope exchanged over the socket.
//!
//! On the wire every message is one JSON document:
//!
//! ```text
//! {"type": "echo", "payload": <any JSON value>}
//! ```
//!
//! The payload is kept as raw JSON text until a handler asks for it in a
//! concrete shape with [`Envelope::decode_payload`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};

/// A typed message: a dispatch key plus an opaque JSON payload.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Box<RawValue>>,
}

impl Envelope {
    /// Build an envelope by serializing `payload`.
    ///
    /// Fails only if `payload` cannot be represented as JSON.
    pub fn new<T: Serialize + ?Sized>(kind: impl Into<String>, payload: &T) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(payload).map_err(Error::Marshal)?;
        Ok(Self {
            kind: kind.into(),
            payload: Some(raw),
        })
    }

    /// The message type used for handler lookup.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The payload as raw JSON text. A missing payload reads as `null`.
    pub fn raw_payload(&self) -> &str {
        self.payload.as_deref().map_or("null", RawValue::get)
    }

    /// Decode the payload into `T`.
    ///
    /// The raw bytes are retained, so this can be called repeatedly, even with
    /// different target types.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.raw_payload()).map_err(Error::Unmarshal)
    }

    /// Serialize to a single JSON document followed by a newline.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(self).map_err(Error::Marshal)?;
        buf.push(b'\n');
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Chat {
        username: String,
        message: String,
    }

    #[test]
    fn test_new_envelope_keeps_type_and_payload() {
        let mut payload = HashMap::new();
        payload.insert("hello", "world");
        let env = Envelope::new("greeting", &payload).unwrap();

        assert_eq!(env.kind(), "greeting");
        let decoded: serde_json::Value = serde_json::from_str(env.raw_payload()).unwrap();
        assert_eq!(decoded["hello"], "world");
    }

    #[test]
    fn test_decode_payload_into_struct() {
        let chat = Chat {
            username: "ada".into(),
            message: "hi".into(),
        };
        let env = Envelope::new("chat", &chat).unwrap();

        let decoded: Chat = env.decode_payload().unwrap();
        assert_eq!(decoded, chat);
        // Payload bytes are retained
        let again: Chat = env.decode_payload().unwrap();
        assert_eq!(again, chat);
    }

    #[test]
    fn test_decode_into_wrong_shape_is_unmarshal_error() {
        let env = Envelope::new("n", &42).unwrap();
        let result: Result<Chat> = env.decode_payload();
        assert!(matches!(result, Err(Error::Unmarshal(_))));
    }

    #[test]
    fn test_marshal_failure() {
        // Maps with non-string keys cannot be JSON objects
        let mut bad = HashMap::new();
        bad.insert((1, 2), "x");
        assert!(matches!(Envelope::new("bad", &bad), Err(Error::Marshal(_))));
    }

    #[test]
    fn test_wire_shape() {
        let env = Envelope::new("echo", "hello").unwrap();
        let wire = env.to_wire().unwrap();
        assert_eq!(wire.last(), Some(&b'\n'));

        let value: serde_json::Value = serde_json::from_slice(&wire).unwrap();
        assert_eq!(value, serde_json::json!({"type": "echo", "payload": "hello"}));
    }

    #[test]
    fn test_missing_payload_reads_as_null() {
        let env: Envelope = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert_eq!(env.raw_payload(), "null");
        let unit: Option<String> = env.decode_payload().unwrap();
        assert!(unit.is_none());
    }

    #[test]
    fn test_payload_is_opaque_until_decoded() {
        let json = r#"{"type": "blob", "payload": {"nested": [1, 2, {"x": null}]}}"#;
        let env: Envelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.raw_payload(), r#"{"nested": [1, 2, {"x": null}]}"#);
    }
}
