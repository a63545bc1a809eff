//! JSON0 operational-transform content type.
//!
//! A JSON0 op is a path plus exactly one mutation discriminator (`oi`/`od`
//! for object insert/delete, `li`/`ld` for list insert/delete, `na` for
//! numeric add). This module defines the wire shape and [`OpBuilder`], a
//! pure constructor used server-side to synthesize ops without a client
//! submission.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single path component: either an object key or a list index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathComponent {
    Key(String),
    Index(i64),
}

impl From<&str> for PathComponent {
    fn from(s: &str) -> Self {
        PathComponent::Key(s.to_string())
    }
}

impl From<i64> for PathComponent {
    fn from(i: i64) -> Self {
        PathComponent::Index(i)
    }
}

/// A single JSON0 operation. Exactly one of the mutation fields is expected
/// to be populated for any well-formed op; the struct stays permissive on
/// deserialization so a client that sends a slightly malformed op doesn't
/// crash the socket — invalid shapes are rejected by the dispatcher, not by
/// serde.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OTOp {
    pub p: Vec<PathComponent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub od: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub li: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ld: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub na: Option<f64>,
}

impl OTOp {
    /// `true` if this op carries no effective mutation — used by
    /// `DocumentAdapter::skip_poll` to skip query re-evaluation.
    pub fn is_noop(&self) -> bool {
        self.oi.is_none() && self.od.is_none() && self.li.is_none() && self.ld.is_none() && self.na.is_none()
    }
}

fn path(components: &[&str]) -> Vec<PathComponent> {
    components.iter().map(|c| PathComponent::Key(c.to_string())).collect()
}

/// Pure constructor of JSON0 ops keyed by path shape.
///
/// Record field ops MUST use the `["data", fieldId, ...]` prefix to match
/// the snapshot shape (`{ data: { <fieldId>: <value> } }`). A
/// `["fields", fieldId]` prefix is a known-confusing duality this builder
/// never produces.
pub struct OpBuilder;

impl OpBuilder {
    /// Set (or overwrite) a single record field.
    pub fn set_field(field_id: &str, new_value: Value, old_value: Option<Value>) -> OTOp {
        OTOp {
            p: path(&["data", field_id]),
            oi: Some(new_value),
            od: old_value,
            ..Default::default()
        }
    }

    /// Delete a single record field.
    pub fn delete_field(field_id: &str, old_value: Value) -> OTOp {
        OTOp {
            p: path(&["data", field_id]),
            od: Some(old_value),
            ..Default::default()
        }
    }

    /// Synthesize the op for creating a whole record's `data` object.
    pub fn create_record(fields: serde_json::Map<String, Value>) -> OTOp {
        OTOp {
            p: path(&["data"]),
            oi: Some(Value::Object(fields)),
            ..Default::default()
        }
    }

    /// Synthesize the op for deleting a whole record's `data` object.
    pub fn delete_record(fields: serde_json::Map<String, Value>) -> OTOp {
        OTOp {
            p: path(&["data"]),
            od: Some(Value::Object(fields)),
            ..Default::default()
        }
    }

    /// Field/view/table metadata mutation, e.g. renaming a field.
    /// `kind` is one of `"field" | "view" | "table"`.
    pub fn set_meta(kind: &str, key: &str, new_value: Value, old_value: Option<Value>) -> OTOp {
        OTOp {
            p: path(&[kind, key]),
            oi: Some(new_value),
            od: old_value,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_field_uses_data_prefix() {
        let op = OpBuilder::set_field("fld1", json!("new"), Some(json!("old")));
        assert_eq!(
            op.p,
            vec![PathComponent::Key("data".into()), PathComponent::Key("fld1".into())]
        );
        assert_eq!(op.oi, Some(json!("new")));
        assert_eq!(op.od, Some(json!("old")));
    }

    #[test]
    fn noop_detection() {
        let op = OTOp {
            p: path(&["data", "f1"]),
            ..Default::default()
        };
        assert!(op.is_noop());

        let op2 = OpBuilder::set_field("f1", json!(1), None);
        assert!(!op2.is_noop());
    }

    #[test]
    fn roundtrips_through_json() {
        let op = OpBuilder::set_field("f1", json!(42), None);
        let s = serde_json::to_string(&op).unwrap();
        let back: OTOp = serde_json::from_str(&s).unwrap();
        assert_eq!(op, back);
    }
}
