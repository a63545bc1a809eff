//! Translate committed operations into business-level events.
//!
//! A record-typed op becomes `record.created` / `record.updated` /
//! `record.deleted`; field/view/table ops become the matching `*.updated`.
//! Deterministic and pure — the same [`Operation`] always yields the same
//! event, regardless of when it's converted.

use serde::Serialize;
use serde_json::{json, Value};

use crate::document::{parse_collection, DocType, Operation, OperationKind};
use crate::json0::PathComponent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RecordCreated,
    RecordUpdated,
    RecordDeleted,
    FieldUpdated,
    ViewUpdated,
    TableUpdated,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusinessEvent {
    pub kind: EventKind,
    pub table_id: String,
    pub doc_id: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub struct EventConverter;

impl EventConverter {
    /// Convert a committed operation into its business event. Returns
    /// `None` only if the operation isn't well-formed (see
    /// [`Operation::is_well_formed`]) — callers should never feed it a
    /// malformed op, but staying total avoids a panic if one slips through.
    pub fn convert(op: &Operation) -> Option<BusinessEvent> {
        if !op.is_well_formed() {
            return None;
        }
        let parsed = parse_collection(&op.collection);
        let kind = match (parsed.doc_type, op.kind) {
            (DocType::Record, OperationKind::Create) => EventKind::RecordCreated,
            (DocType::Record, OperationKind::Delete) => EventKind::RecordDeleted,
            (DocType::Record, OperationKind::Edit) => EventKind::RecordUpdated,
            (DocType::Field, _) => EventKind::FieldUpdated,
            (DocType::View, _) => EventKind::ViewUpdated,
            (DocType::Table, _) => EventKind::TableUpdated,
        };
        let data = match &op.kind {
            OperationKind::Create => op.create.as_ref().map(|c| c.data.clone()),
            _ => None,
        };
        Some(BusinessEvent {
            kind,
            table_id: parsed.table_id,
            doc_id: op.doc_id.clone(),
            version: op.version,
            data,
        })
    }

    /// Expanded form used for record edits: one event per OT op that
    /// touches a field (`["data", fieldId, ...]`), rather than one generic
    /// event for the whole op list. Falls back to [`Self::convert`]'s
    /// single generic event for creates, deletes, non-record collections,
    /// or an edit whose ops don't touch `["data", fieldId]` at all.
    pub fn convert_all(op: &Operation) -> Vec<BusinessEvent> {
        if !op.is_well_formed() {
            return Vec::new();
        }
        let parsed = parse_collection(&op.collection);
        if parsed.doc_type == DocType::Record && op.kind == OperationKind::Edit {
            if let Some(ops) = &op.op {
                let field_events: Vec<BusinessEvent> = ops
                    .iter()
                    .filter_map(|ot_op| field_touched(ot_op))
                    .map(|field_id| BusinessEvent {
                        kind: EventKind::RecordUpdated,
                        table_id: parsed.table_id.clone(),
                        doc_id: op.doc_id.clone(),
                        version: op.version,
                        data: Some(json!({ "fieldId": field_id })),
                    })
                    .collect();
                if !field_events.is_empty() {
                    return field_events;
                }
            }
        }
        Self::convert(op).into_iter().collect()
    }
}

/// The field id an OT op mutates, if its path is `["data", fieldId, ...]`
/// — the unified prefix this core requires (see [`crate::json0::OpBuilder`]
/// doc comment on the `["fields", fieldId]` duality this replaces).
fn field_touched(ot_op: &crate::json0::OTOp) -> Option<String> {
    match ot_op.p.as_slice() {
        [PathComponent::Key(head), PathComponent::Key(field_id), ..] if head == "data" => {
            Some(field_id.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::CreateSpec;
    use serde_json::json;

    #[test]
    fn record_create_maps_to_created_event() {
        let op = Operation::create(
            "rec_tbl_T1",
            "rec_R1",
            1,
            CreateSpec { content_type: "json0".into(), data: json!({"data": {}}) },
        );
        let event = EventConverter::convert(&op).unwrap();
        assert_eq!(event.kind, EventKind::RecordCreated);
        assert_eq!(event.table_id, "tbl_T1");
        assert!(event.data.is_some());
    }

    #[test]
    fn record_edit_maps_to_updated_event() {
        let op = Operation::edit("rec_tbl_T1", "rec_R1", 2, vec![]);
        let event = EventConverter::convert(&op).unwrap();
        assert_eq!(event.kind, EventKind::RecordUpdated);
    }

    #[test]
    fn record_delete_maps_to_deleted_event() {
        let op = Operation::delete("rec_tbl_T1", "rec_R1", 3);
        let event = EventConverter::convert(&op).unwrap();
        assert_eq!(event.kind, EventKind::RecordDeleted);
    }

    #[test]
    fn field_edit_maps_to_field_updated_regardless_of_kind() {
        let op = Operation::edit("field_tbl_T1", "field_F1", 2, vec![]);
        let event = EventConverter::convert(&op).unwrap();
        assert_eq!(event.kind, EventKind::FieldUpdated);
    }

    #[test]
    fn malformed_operation_yields_none() {
        let mut op = Operation::edit("rec_tbl_T1", "rec_R1", 1, vec![]);
        op.op = None;
        assert!(EventConverter::convert(&op).is_none());
    }

    #[test]
    fn convert_all_yields_one_event_per_touched_field() {
        let op = Operation::edit(
            "rec_tbl_T1",
            "rec_R1",
            4,
            vec![
                crate::json0::OpBuilder::set_field("f1", json!("a"), None),
                crate::json0::OpBuilder::set_field("f2", json!("b"), None),
            ],
        );
        let events = EventConverter::convert_all(&op);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::RecordUpdated));
    }

    #[test]
    fn convert_all_falls_back_to_one_generic_event_without_field_paths() {
        let op = Operation::edit("rec_tbl_T1", "rec_R1", 4, vec![]);
        let events = EventConverter::convert_all(&op);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn convert_all_is_deterministic() {
        let op = Operation::edit(
            "rec_tbl_T1",
            "rec_R1",
            4,
            vec![crate::json0::OpBuilder::set_field("f1", json!("a"), None)],
        );
        assert_eq!(
            serde_json::to_value(EventConverter::convert_all(&op)).unwrap(),
            serde_json::to_value(EventConverter::convert_all(&op)).unwrap()
        );
    }
}
