//! Wire protocol: the JSON frames exchanged over the WebSocket, tagged by
//! their `a` (action) field — `hs`, `f`, `s`, `us`, `op`, `p`, `pp` — plus
//! the `error` frame the dispatcher sends instead of a response when a
//! request fails.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{CreateSpec, Snapshot};
use crate::json0::OTOp;

/// The mutation carried by an `op` frame: exactly one of `op`, `create`,
/// `del`, mirroring [`crate::document::Operation`]'s invariant on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpMutation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<OTOp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "a")]
pub enum ClientMessage {
    #[serde(rename = "hs")]
    Handshake,

    #[serde(rename = "f")]
    Fetch { c: String, d: String, #[serde(default)] id: Option<String> },

    #[serde(rename = "s")]
    Subscribe { c: String, #[serde(default)] d: Option<String> },

    #[serde(rename = "us")]
    Unsubscribe { c: String, #[serde(default)] d: Option<String> },

    #[serde(rename = "op")]
    Op {
        c: String,
        d: String,
        v: i64,
        #[serde(flatten)]
        mutation: OpMutation,
        #[serde(default)]
        src: Option<String>,
        #[serde(default)]
        seq: Option<i64>,
    },

    #[serde(rename = "p")]
    Presence { c: String, d: String, presence: Value },

    #[serde(rename = "pp")]
    PresencePing,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "a")]
pub enum ServerMessage {
    #[serde(rename = "hs")]
    Handshake { protocol: u8, #[serde(rename = "type")] content_type: String, id: String },

    #[serde(rename = "f")]
    Fetch { c: String, d: String, data: Snapshot },

    #[serde(rename = "s")]
    Subscribe {
        c: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        d: Option<String>,
        v: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },

    #[serde(rename = "us")]
    Unsubscribe { c: String, #[serde(skip_serializing_if = "Option::is_none")] d: Option<String> },

    #[serde(rename = "op")]
    Op {
        c: String,
        d: String,
        v: i64,
        #[serde(flatten)]
        mutation: OpMutation,
        #[serde(skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        seq: Option<i64>,
    },

    #[serde(rename = "p")]
    Presence { c: String, d: String, presence: HashMap<String, Value> },

    #[serde(rename = "pp")]
    PresencePing,

    #[serde(rename = "error")]
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error { id: None, code: code.into(), message: message.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_subscribe_frame() {
        let raw = json!({"a": "s", "c": "rec_tbl_T1", "d": "rec_R1"});
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::Subscribe { c, d } => {
                assert_eq!(c, "rec_tbl_T1");
                assert_eq!(d, Some("rec_R1".to_string()));
            }
            _ => panic!("expected Subscribe"),
        }
    }

    #[test]
    fn parses_op_frame_with_create() {
        let raw = json!({
            "a": "op",
            "c": "rec_tbl_T1",
            "d": "rec_R1",
            "v": 0,
            "create": {"type": "json0", "data": {"data": {}}}
        });
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::Op { mutation, .. } => assert!(mutation.create.is_some()),
            _ => panic!("expected Op"),
        }
    }

    #[test]
    fn error_frame_serializes_with_action_tag() {
        let msg = ServerMessage::error("NOT_FOUND", "no such document");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["a"], "error");
        assert_eq!(v["code"], "NOT_FOUND");
    }

    /// Literal shape from spec.md S1/S2: `v` is a top-level sibling of
    /// `data`, and `data` is the snapshot's inner payload, not the whole
    /// `Snapshot` (no `id`/`type`/`version` leaking in alongside it).
    #[test]
    fn subscribe_reply_nests_only_the_inner_data_with_a_top_level_version() {
        let msg = ServerMessage::Subscribe {
            c: "rec_tbl_T1".into(),
            d: Some("rec_R1".into()),
            v: 3,
            data: Some(json!({"data": {"f1": "old"}})),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            v,
            json!({"a": "s", "c": "rec_tbl_T1", "d": "rec_R1", "v": 3, "data": {"data": {"f1": "old"}}})
        );
    }

    #[test]
    fn parses_presence_submit_frame() {
        let raw = json!({"a": "p", "c": "rec_tbl_T1", "d": "rec_R1", "presence": {"cursor": {"x": 10, "y": 20}}});
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        match msg {
            ClientMessage::Presence { c, d, presence } => {
                assert_eq!(c, "rec_tbl_T1");
                assert_eq!(d, "rec_R1");
                assert_eq!(presence, json!({"cursor": {"x": 10, "y": 20}}));
            }
            _ => panic!("expected Presence"),
        }
    }

    #[test]
    fn parses_presence_ping_frame() {
        let raw = json!({"a": "pp"});
        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        assert!(matches!(msg, ClientMessage::PresencePing));
    }

    #[test]
    fn presence_ping_reply_is_just_the_action_tag() {
        let v = serde_json::to_value(ServerMessage::PresencePing).unwrap();
        assert_eq!(v, json!({"a": "pp"}));
    }

    #[test]
    fn presence_reply_carries_the_merged_client_id_to_record_map() {
        let mut merged = HashMap::new();
        merged.insert("client-1".to_string(), json!({"cursor": {"x": 1, "y": 2}}));
        let msg = ServerMessage::Presence { c: "rec_tbl_T1".into(), d: "rec_R1".into(), presence: merged };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["a"], "p");
        assert_eq!(v["presence"]["client-1"], json!({"cursor": {"x": 1, "y": 2}}));
    }
}
