//! Operation pub/sub: fan-out of committed operations to subscribed
//! connections, behind one trait with two interchangeable backends.
//!
//! Publishing targets a channel string (a collection, or
//! `"<collection>.<docID>"` for a single document); subscribers receive
//! whatever is published to a channel they've subscribed to, in publish
//! order, best-effort. A slow subscriber drops messages rather than
//! back-pressuring the publisher. Per-subscriber bounded queues let the
//! two backends share one shape.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::CoreResult;

/// A committed operation serialized for transit across a channel. Kept
/// separate from `document::Operation` so the pub/sub layer never needs to
/// know about JSON0 internals — it moves opaque payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: serde_json::Value,
}

/// A per-subscriber receive handle. Wraps the bounded channel so callers
/// don't depend on the concrete backend's queue type.
pub struct Subscription {
    pub id: u64,
    pub channel: String,
    pub rx: mpsc::Receiver<PublishedMessage>,
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` to `channel`. Fire-and-forget: delivery to any
    /// given subscriber is best-effort.
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> CoreResult<()>;

    /// Subscribe to `channel`, returning a handle whose `rx` yields
    /// messages published after this call returns.
    async fn subscribe(&self, channel: &str) -> CoreResult<Subscription>;

    /// Remove a previously created subscription. Idempotent.
    async fn unsubscribe(&self, subscription_id: u64);

    /// Release any backend resources (connections, background tasks).
    async fn close(&self);
}

pub type SharedPubSub = Arc<dyn PubSub>;
