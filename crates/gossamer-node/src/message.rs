//! Message envelope and codec.
//!
//! Every message is one JSON object per line:
//!
//! ```text
//! {"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 1, "message": 10}}
//! ```
//!
//! Bodies are decoded in two phases. [`Message::header`] pulls out the fields
//! the runtime routes on (`type`, `msg_id`, `in_reply_to`, `code`, `text`);
//! [`Message::payload`] then decodes the type-specific shape a handler wants,
//! usually an internally tagged enum keyed by `type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorCode, Result, RpcError};

/// A message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Node the message came from.
    pub src: String,
    /// Node the message is addressed to.
    pub dest: String,
    /// Opaque body; always a JSON object for messages the runtime acts on.
    pub body: Value,
}

/// Fields shared by every message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Discriminator selecting the logical message.
    #[serde(rename = "type", default)]
    pub kind: String,

    /// Present on messages expecting a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,

    /// Present on replies; the `msg_id` of the request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,

    /// Present on error replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,

    /// Human-readable error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Message {
    /// Create a message from an already-encoded body.
    pub fn new(src: impl Into<String>, dest: impl Into<String>, body: Value) -> Self {
        Self {
            src: src.into(),
            dest: dest.into(),
            body,
        }
    }

    /// Decode one input line.
    ///
    /// Fails with [`Error::Malformed`] if the line is not an envelope or its
    /// body is not an object with a well-formed header.
    pub fn from_line(line: &str) -> Result<Self> {
        let msg: Message = serde_json::from_str(line).map_err(|e| Error::Malformed {
            line: line.to_string(),
            reason: e.to_string(),
        })?;

        if !msg.body.is_object() {
            return Err(Error::Malformed {
                line: line.to_string(),
                reason: "body is not a JSON object".to_string(),
            });
        }

        if let Err(e) = msg.header() {
            return Err(Error::Malformed {
                line: line.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(msg)
    }

    /// Encode as a single line, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Phase one: decode the common header fields.
    pub fn header(&self) -> Result<Header> {
        Ok(Header::deserialize(&self.body)?)
    }

    /// Phase two: decode the body as a type-specific payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.body).map_err(|e| {
            Error::Rpc(RpcError::new(
                ErrorCode::MalformedRequest,
                format!("invalid {} body: {}", self.kind(), e),
            ))
        })
    }

    /// The body's `type` field, or `""` if absent.
    pub fn kind(&self) -> &str {
        self.body.get("type").and_then(Value::as_str).unwrap_or("")
    }

    /// The structured error carried by this message, if it is an error reply.
    pub fn rpc_error(&self) -> Option<RpcError> {
        let header = self.header().ok()?;
        header
            .code
            .map(|code| RpcError::new(code, header.text.unwrap_or_default()))
    }
}

/// Serialize a body and require it to be a JSON object, so the runtime can
/// inject correlation ids into it.
pub(crate) fn body_object<B: Serialize>(body: B) -> Result<Map<String, Value>> {
    match serde_json::to_value(body)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::InvalidBody(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decode_request() {
        let msg = Message::from_line(
            r#"{"src":"c1","dest":"n1","body":{"type":"broadcast","msg_id":7,"message":10}}"#,
        )
        .unwrap();

        assert_eq!(msg.src, "c1");
        assert_eq!(msg.dest, "n1");
        assert_eq!(msg.kind(), "broadcast");

        let header = msg.header().unwrap();
        assert_eq!(header.kind, "broadcast");
        assert_eq!(header.msg_id, Some(7));
        assert_eq!(header.in_reply_to, None);
        assert!(msg.rpc_error().is_none());
    }

    #[test]
    fn test_decode_error_reply() {
        let msg = Message::from_line(
            r#"{"src":"n2","dest":"n1","body":{"type":"error","in_reply_to":3,"code":11,"text":"busy"}}"#,
        )
        .unwrap();

        let header = msg.header().unwrap();
        assert_eq!(header.in_reply_to, Some(3));
        assert_eq!(
            msg.rpc_error(),
            Some(RpcError::new(ErrorCode::TemporarilyUnavailable, "busy"))
        );
    }

    #[test]
    fn test_malformed_lines() {
        let cases = [
            "not json",
            r#"{"src":"c1","dest":"n1"}"#,
            r#"{"src":"c1","dest":"n1","body":[1,2,3]}"#,
            r#"{"src":"c1","dest":"n1","body":{"type":"read","msg_id":"seven"}}"#,
            r#"{"src":"c1","dest":"n1","body":{"type":5}}"#,
        ];

        for line in cases {
            match Message::from_line(line) {
                Err(Error::Malformed { line: l, .. }) => assert_eq!(l, line),
                other => panic!("expected malformed for {}, got {:?}", line, other),
            }
        }
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let header = Header {
            kind: "read".to_string(),
            msg_id: Some(1),
            ..Default::default()
        };

        let encoded = serde_json::to_value(&header).unwrap();
        assert_eq!(encoded, json!({"type": "read", "msg_id": 1}));
    }

    #[test]
    fn test_payload_decode_failure_is_malformed_request() {
        #[derive(Debug, Deserialize)]
        struct Needs {
            #[allow(dead_code)]
            message: f64,
        }

        let msg = Message::new("c1", "n1", json!({"type": "broadcast", "msg_id": 1}));
        match msg.payload::<Needs>() {
            Err(Error::Rpc(e)) => assert_eq!(e.code, ErrorCode::MalformedRequest),
            other => panic!("expected rpc error, got {:?}", other),
        }
    }

    #[test]
    fn test_body_object_rejects_non_objects() {
        assert!(body_object(json!({"type": "x"})).is_ok());
        assert!(matches!(body_object(42), Err(Error::InvalidBody(_))));
        assert!(matches!(body_object(vec![1, 2]), Err(Error::InvalidBody(_))));
    }

    fn arb_header() -> impl Strategy<Value = Header> {
        (
            "[a-z_]{1,12}",
            proptest::option::of(any::<u64>()),
            proptest::option::of(any::<u64>()),
            proptest::option::of(any::<u32>().prop_map(ErrorCode::from)),
            proptest::option::of(".{0,16}"),
        )
            .prop_map(|(kind, msg_id, in_reply_to, code, text)| Header {
                kind,
                msg_id,
                in_reply_to,
                code,
                text,
            })
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(header in arb_header()) {
            let msg = Message::new("a", "b", serde_json::to_value(&header).unwrap());
            let line = msg.to_line().unwrap();
            let decoded = Message::from_line(&line).unwrap();

            prop_assert_eq!(decoded.header().unwrap(), header.clone());

            let body = decoded.body.as_object().unwrap();
            prop_assert_eq!(body.contains_key("msg_id"), header.msg_id.is_some());
            prop_assert_eq!(body.contains_key("in_reply_to"), header.in_reply_to.is_some());
            prop_assert_eq!(body.contains_key("code"), header.code.is_some());
            prop_assert_eq!(body.contains_key("text"), header.text.is_some());
        }
    }
}
