//! Per-request operation accumulator.
//!
//! A single client-facing action (e.g. "apply this formula across a
//! column") can touch many documents. `TransactionContext` batches the
//! resulting operations so they commit, and publish, together rather than
//! interleaving with other connections' traffic mid-batch. Outside of an
//! explicit transaction, ops publish immediately as they're produced.

use std::collections::HashMap;

use crate::document::Operation;
use crate::error::{CoreError, CoreResult};
use crate::pubsub::PubSub;

/// Accumulates operations keyed by their target document, preserving
/// per-document order but allowing independent documents to commit as a
/// single batch.
#[derive(Debug, Default)]
pub struct TransactionContext {
    ops_by_doc: HashMap<(String, String), Vec<Operation>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `op` against its document's accumulator.
    pub fn add_raw_op_map(&mut self, op: Operation) {
        let key = (op.collection.clone(), op.doc_id.clone());
        self.ops_by_doc.entry(key).or_default().push(op);
    }

    /// All accumulated ops, grouped by document, in insertion order within
    /// each document.
    pub fn get_raw_op_maps(&self) -> Vec<&Operation> {
        self.ops_by_doc.values().flatten().collect()
    }

    /// The set of channels this transaction will need to publish to once
    /// committed: each document's own channel plus its collection channel.
    pub fn get_cache_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .ops_by_doc
            .keys()
            .flat_map(|(collection, doc_id)| {
                [collection.clone(), crate::document::doc_channel(collection, doc_id)]
            })
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.ops_by_doc.is_empty()
    }

    pub fn clear(&mut self) {
        self.ops_by_doc.clear();
    }

    /// Drain and return every accumulated op, clearing the context.
    pub fn take_all(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.ops_by_doc).into_values().flatten().collect()
    }

    /// Publish every accumulated op to its two channels (collection and
    /// per-doc form), in insertion order within each document, then clear.
    /// Call this only once the enclosing business transaction has
    /// committed; on rollback, call [`Self::clear`] instead so nothing
    /// publishes.
    pub async fn commit(&mut self, pubsub: &dyn PubSub) -> CoreResult<()> {
        for op in self.take_all() {
            let value = serde_json::to_value(&op).map_err(|e| CoreError::Internal(e.to_string()))?;
            for channel in op.channels() {
                pubsub.publish(&channel, value.clone()).await?;
            }
        }
        Ok(())
    }
}
