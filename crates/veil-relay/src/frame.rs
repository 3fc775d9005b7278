//! The JSON frame envelope spoken on the wire.
//!
//! Every message in either direction is one JSON object. Only `t` is
//! always present; the rest of the envelope is optional and omitted
//! when unset. `data` carries the per-frame payload as opaque JSON;
//! for relayed ciphertext the server never looks inside it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Frame {
    /// Frame type, e.g. `AUTH`, `MSG`, `PEER_ONLINE`.
    #[serde(default)]
    pub t: String,

    /// Session id this frame belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// Sender requests a delivery ack (`DELIVERED` / `DELIVERED_FAILED`).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub c: bool,

    /// Sender email hash, set by the server on relayed frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sh: Option<String>,

    /// Target device for directed signaling frames.
    #[serde(
        rename = "targetPubKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_pub_key: Option<String>,

    /// Opaque inner payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Frame {
    /// A bare frame carrying only a type.
    pub fn of(t: &str) -> Self {
        Self {
            t: t.to_string(),
            ..Default::default()
        }
    }

    /// A frame with a payload.
    pub fn with_data(t: &str, data: Value) -> Self {
        Self {
            t: t.to_string(),
            data: Some(data),
            ..Default::default()
        }
    }

    /// A bare frame scoped to a session.
    pub fn in_session(t: &str, sid: &str) -> Self {
        Self {
            t: t.to_string(),
            sid: Some(sid.to_string()),
            ..Default::default()
        }
    }

    /// An `ERROR` frame with a human-readable message.
    pub fn error(message: &str) -> Self {
        Self::with_data("ERROR", json!({ "message": message }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_omitted() {
        let encoded = serde_json::to_string(&Frame::of("PING")).unwrap();
        assert_eq!(encoded, r#"{"t":"PING"}"#);
    }

    #[test]
    fn ack_flag_serializes_only_when_set() {
        let mut frame = Frame::in_session("MSG", "abc");
        frame.c = true;
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains(r#""c":true"#));

        frame.c = false;
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(!encoded.contains(r#""c""#));
    }

    #[test]
    fn target_pub_key_uses_wire_name() {
        let frame = Frame {
            t: "RTC_ICE".to_string(),
            target_pub_key: Some("k1".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains(r#""targetPubKey":"k1""#));
    }

    #[test]
    fn decodes_with_unknown_fields_and_absent_envelope() {
        let frame: Frame =
            serde_json::from_str(r#"{"t":"MSG","sid":"s","future":1,"data":{"payloads":{}}}"#)
                .unwrap();
        assert_eq!(frame.t, "MSG");
        assert_eq!(frame.sid.as_deref(), Some("s"));
        assert!(!frame.c);
        assert!(frame.data.is_some());
    }

    #[test]
    fn error_frame_carries_message() {
        let frame = Frame::error("Auth required");
        assert_eq!(frame.t, "ERROR");
        assert_eq!(frame.data.unwrap()["message"], "Auth required");
    }
}
