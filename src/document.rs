//! Document addressing and the `DocumentAdapter`.
//!
//! Collection strings are parsed into `(DocType, tableID)` by splitting on
//! `_`; everything after the first token is rejoined with `_` so table IDs
//! that themselves contain underscores (`tbl_ABC`) survive the round trip.
//! An unknown prefix defaults to `Record`, a safe default for an
//! unrecognized discriminator.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::json0::OTOp;

// MARK: - Document type

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocType {
    Record,
    Field,
    View,
    Table,
}

impl DocType {
    pub fn prefix(self) -> &'static str {
        match self {
            DocType::Record => "rec",
            DocType::Field => "field",
            DocType::View => "view",
            DocType::Table => "table",
        }
    }

    fn from_prefix(prefix: &str) -> DocType {
        match prefix {
            "rec" => DocType::Record,
            "field" => DocType::Field,
            "view" => DocType::View,
            "table" => DocType::Table,
            other => {
                // Unknown prefixes default to Record.
                warn!(prefix = other, "unknown collection prefix, defaulting to record");
                DocType::Record
            }
        }
    }
}

/// Result of parsing a collection string like `rec_tbl_ABC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCollection {
    pub doc_type: DocType,
    pub table_id: String,
}

/// Parse `"<prefix>_<tableID>"` into its document type and table id.
/// Table ids containing underscores are preserved by rejoining every token
/// after the first with `_`.
pub fn parse_collection(collection: &str) -> ParsedCollection {
    let mut parts = collection.splitn(2, '_');
    let prefix = parts.next().unwrap_or_default();
    let table_id = parts.next().unwrap_or_default().to_string();
    ParsedCollection {
        doc_type: DocType::from_prefix(prefix),
        table_id,
    }
}

/// Format `(doc_type, table_id)` back into a collection string.
pub fn format_collection(doc_type: DocType, table_id: &str) -> String {
    format!("{}_{}", doc_type.prefix(), table_id)
}

/// The per-doc addressable channel form: `"<collection>.<docID>"`.
pub fn doc_channel(collection: &str, doc_id: &str) -> String {
    format!("{}.{}", collection, doc_id)
}

// MARK: - Snapshot

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub version: i64,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl Snapshot {
    pub fn new(id: impl Into<String>, version: i64, data: Value) -> Self {
        Self {
            id: id.into(),
            content_type: "json0".to_string(),
            version,
            data,
            meta: None,
        }
    }

    /// The `{data: {}}`/`v:0` skeleton sent when subscribing before create
    /// This is what's sent when a client subscribes to a document before
    /// it has been created.
    pub fn empty_skeleton(id: impl Into<String>) -> Self {
        Self::new(id, 0, json!({ "data": {} }))
    }
}

// MARK: - Operation record

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Edit,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSpec {
    #[serde(rename = "type")]
    pub content_type: String,
    pub data: Value,
}

/// Internal operation record.
/// Invariant: exactly one of `op`, `create`, `del` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub collection: String,
    #[serde(rename = "docID")]
    pub doc_id: String,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<OTOp>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub del: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl Operation {
    pub fn edit(collection: impl Into<String>, doc_id: impl Into<String>, version: i64, op: Vec<OTOp>) -> Self {
        Self {
            kind: OperationKind::Edit,
            collection: collection.into(),
            doc_id: doc_id.into(),
            version,
            op: Some(op),
            create: None,
            del: None,
            src: None,
            seq: None,
        }
    }

    pub fn create(collection: impl Into<String>, doc_id: impl Into<String>, version: i64, create: CreateSpec) -> Self {
        Self {
            kind: OperationKind::Create,
            collection: collection.into(),
            doc_id: doc_id.into(),
            version,
            op: None,
            create: Some(create),
            del: None,
            src: None,
            seq: None,
        }
    }

    pub fn delete(collection: impl Into<String>, doc_id: impl Into<String>, version: i64) -> Self {
        Self {
            kind: OperationKind::Delete,
            collection: collection.into(),
            doc_id: doc_id.into(),
            version,
            op: None,
            create: None,
            del: Some(true),
            src: None,
            seq: None,
        }
    }

    /// Validates the "exactly one of op/create/del" invariant.
    pub fn is_well_formed(&self) -> bool {
        let populated = [self.op.is_some(), self.create.is_some(), self.del.unwrap_or(false)];
        populated.iter().filter(|p| **p).count() == 1
    }

    /// The two channels a publish targets: the collection and the per-doc
    /// form.
    pub fn channels(&self) -> [String; 2] {
        [self.collection.clone(), doc_channel(&self.collection, &self.doc_id)]
    }
}

// MARK: - DocumentAdapter

/// Typed snapshot / doc-id queries, dispatched by collection prefix.
/// Implementations are polymorphic over [`DocType`] the way the
/// teacher's conversation actor is polymorphic over message kind — no shared
/// base-class state, just a tagged variant with per-variant behavior.
#[async_trait]
pub trait DocumentAdapter: Send + Sync {
    async fn get_snapshot(&self, collection: &str, doc_id: &str) -> CoreResult<Option<Snapshot>>;

    async fn get_doc_ids_by_query(&self, collection: &str) -> CoreResult<Vec<String>>;

    /// Operation history. Best-effort; an empty list is always an acceptable
    /// answer.
    async fn get_ops(&self, collection: &str, doc_id: &str, from: i64, to: Option<i64>) -> CoreResult<Vec<Operation>>;

    /// `true` when `op` carries no effective mutation, letting callers skip
    /// query re-evaluation.
    fn skip_poll(&self, op: &Operation) -> bool {
        match &op.op {
            Some(ops) => ops.iter().all(OTOp::is_noop),
            None => false,
        }
    }
}

// MARK: - In-memory adapter (dev/test fallback)

#[derive(Default)]
struct DocEntry {
    snapshot: Snapshot,
    recent_ops: VecDeque<Operation>,
}

const RECENT_OPS_CAP: usize = 200;

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::new("", 0, json!({}))
    }
}

/// Trivial store used by tests and local/dev runs without a database.
/// Keyed by `(collection, docID)`; not shared across process restarts.
pub struct InMemoryDocumentAdapter {
    docs: DashMap<(String, String), DocEntry>,
}

impl InMemoryDocumentAdapter {
    pub fn new() -> Self {
        Self { docs: DashMap::new() }
    }

    /// Seed (or overwrite) a record's data, used by tests and by server-side
    /// synthesis paths that bypass the wire protocol.
    pub fn put_record(&self, table_id: &str, record_id: &str, fields: Value, version: i64) {
        let collection = format_collection(DocType::Record, table_id);
        let snapshot = Snapshot::new(record_id, version, json!({ "data": fields }));
        self.docs.insert(
            (collection, record_id.to_string()),
            DocEntry { snapshot, recent_ops: VecDeque::new() },
        );
    }

    /// Apply a committed operation, bumping the stored version and
    /// recording it on the bounded recent-ops ring used by `get_ops`.
    pub fn record_committed_op(&self, op: Operation) {
        let key = (op.collection.clone(), op.doc_id.clone());
        let mut entry = self.docs.entry(key).or_insert_with(|| DocEntry {
            snapshot: Snapshot::empty_skeleton(op.doc_id.clone()),
            recent_ops: VecDeque::new(),
        });
        entry.snapshot.version = op.version;
        entry.recent_ops.push_back(op);
        if entry.recent_ops.len() > RECENT_OPS_CAP {
            entry.recent_ops.pop_front();
        }
    }
}

impl Default for InMemoryDocumentAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentAdapter for InMemoryDocumentAdapter {
    async fn get_snapshot(&self, collection: &str, doc_id: &str) -> CoreResult<Option<Snapshot>> {
        Ok(self
            .docs
            .get(&(collection.to_string(), doc_id.to_string()))
            .map(|e| e.snapshot.clone()))
    }

    async fn get_doc_ids_by_query(&self, collection: &str) -> CoreResult<Vec<String>> {
        Ok(self
            .docs
            .iter()
            .filter(|e| e.key().0 == collection)
            .map(|e| e.key().1.clone())
            .collect())
    }

    async fn get_ops(&self, collection: &str, doc_id: &str, from: i64, to: Option<i64>) -> CoreResult<Vec<Operation>> {
        Ok(self
            .docs
            .get(&(collection.to_string(), doc_id.to_string()))
            .map(|e| {
                e.recent_ops
                    .iter()
                    .filter(|op| op.version >= from && to.map(|t| op.version < t).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// MARK: - Postgres-backed adapter

/// Production-shaped adapter over the tabular store. The physical schema is
/// out of scope for this core; the queries below assume
/// one table per document type with `id`, `version`, `data jsonb` columns,
/// which is the minimal shape this core requires of whatever CRUD surface
/// owns schema and migrations.
pub struct PgDocumentAdapter {
    pool: PgPool,
}

impl PgDocumentAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn table_name(doc_type: DocType) -> &'static str {
        match doc_type {
            DocType::Record => "records",
            DocType::Field => "fields",
            DocType::View => "views",
            DocType::Table => "tables",
        }
    }
}

#[async_trait]
impl DocumentAdapter for PgDocumentAdapter {
    async fn get_snapshot(&self, collection: &str, doc_id: &str) -> CoreResult<Option<Snapshot>> {
        let parsed = parse_collection(collection);
        let table = Self::table_name(parsed.doc_type);

        let row = sqlx::query_as::<_, (i64, Value)>(&format!(
            "SELECT version, data FROM {table} WHERE id = $1 AND table_id = $2"
        ))
        .bind(doc_id)
        .bind(&parsed.table_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(version, data)| {
            let wrapped = match parsed.doc_type {
                DocType::Record => json!({ "data": data }),
                _ => data,
            };
            Snapshot::new(doc_id, version, wrapped)
        }))
    }

    async fn get_doc_ids_by_query(&self, collection: &str) -> CoreResult<Vec<String>> {
        let parsed = parse_collection(collection);
        let table = Self::table_name(parsed.doc_type);

        let rows = sqlx::query_as::<_, (String,)>(&format!(
            "SELECT id FROM {table} WHERE table_id = $1"
        ))
        .bind(&parsed.table_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_ops(&self, _collection: &str, _doc_id: &str, _from: i64, _to: Option<i64>) -> CoreResult<Vec<Operation>> {
        // No durable op log is wired for this core; best-effort empty.
        Ok(Vec::new())
    }
}

/// Shared handle used across the dispatcher; either backend behind one trait
/// object, selected at startup by `Config`.
pub type SharedAdapter = Arc<dyn DocumentAdapter>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_collection_roundtrip_simple() {
        let parsed = parse_collection("rec_tblABC");
        assert_eq!(parsed.doc_type, DocType::Record);
        assert_eq!(parsed.table_id, "tblABC");
        assert_eq!(format_collection(DocType::Record, "tblABC"), "rec_tblABC");
    }

    #[test]
    fn parse_collection_roundtrip_with_underscores_in_table_id() {
        let parsed = parse_collection("rec_tbl_ABC");
        assert_eq!(parsed.doc_type, DocType::Record);
        assert_eq!(parsed.table_id, "tbl_ABC");
        assert_eq!(format_collection(DocType::Record, "tbl_ABC"), "rec_tbl_ABC");
    }

    #[test]
    fn parse_collection_all_prefixes() {
        assert_eq!(parse_collection("field_tbl_1").doc_type, DocType::Field);
        assert_eq!(parse_collection("view_tbl_1").doc_type, DocType::View);
        assert_eq!(parse_collection("table_tbl_1").doc_type, DocType::Table);
    }

    #[test]
    fn unknown_prefix_defaults_to_record() {
        assert_eq!(parse_collection("whatever_tbl_1").doc_type, DocType::Record);
    }

    #[test]
    fn doc_channel_form() {
        assert_eq!(doc_channel("rec_tbl_ABC", "rec_XYZ"), "rec_tbl_ABC.rec_XYZ");
    }

    #[test]
    fn operation_well_formed_requires_exactly_one_variant() {
        let edit = Operation::edit("rec_t", "rec_1", 1, vec![]);
        assert!(edit.is_well_formed());

        let mut broken = edit.clone();
        broken.create = Some(CreateSpec { content_type: "json0".into(), data: json!({}) });
        assert!(!broken.is_well_formed());

        let mut empty = Operation::edit("rec_t", "rec_1", 1, vec![]);
        empty.op = None;
        assert!(!empty.is_well_formed());
    }

    #[tokio::test]
    async fn in_memory_adapter_subscribe_before_create() {
        let adapter = InMemoryDocumentAdapter::new();
        let snap = adapter.get_snapshot("rec_tbl_T2", "rec_R9").await.unwrap();
        assert!(snap.is_none());

        let create_op = Operation::create(
            "rec_tbl_T2",
            "rec_R9",
            1,
            CreateSpec { content_type: "json0".into(), data: json!({"data": {}}) },
        );
        adapter.record_committed_op(create_op);

        let snap = adapter.get_snapshot("rec_tbl_T2", "rec_R9").await.unwrap();
        assert!(snap.is_some());
        assert_eq!(snap.unwrap().version, 1);
    }

    #[test]
    fn skip_poll_true_for_noop() {
        let adapter = InMemoryDocumentAdapter::new();
        let op = Operation::edit("rec_t", "rec_1", 1, vec![OTOp { p: vec![], ..Default::default() }]);
        assert!(adapter.skip_poll(&op));
    }
}
