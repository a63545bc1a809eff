//! In-process pub/sub backend: bounded per-subscriber queues indexed by
//! channel, no external dependency. Used standalone for tests and single-
//! instance deployments, and as the fallback when `REDIS_URL` is unset.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use super::{PublishedMessage, PubSub, Subscription};
use crate::error::CoreResult;

struct Sub {
    channel: String,
    tx: mpsc::Sender<PublishedMessage>,
}

pub struct InMemoryPubSub {
    subs: DashMap<u64, Sub>,
    by_channel: DashMap<String, DashSet<u64>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl InMemoryPubSub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subs: DashMap::new(),
            by_channel: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> CoreResult<()> {
        let Some(ids) = self.by_channel.get(channel) else {
            return Ok(());
        };
        let msg = PublishedMessage { channel: channel.to_string(), payload };
        for id in ids.iter() {
            if let Some(sub) = self.subs.get(&id) {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {
                        metrics::counter!("pubsub_messages_published_total").increment(1);
                    }
                    Err(_) => {
                        metrics::counter!("pubsub_messages_dropped_total").increment(1);
                        warn!(channel, subscriber = *id, "subscriber queue full, dropping message");
                    }
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CoreResult<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subs.insert(id, Sub { channel: channel.to_string(), tx });
        self.by_channel.entry(channel.to_string()).or_default().insert(id);
        Ok(Subscription { id, channel: channel.to_string(), rx })
    }

    async fn unsubscribe(&self, subscription_id: u64) {
        if let Some((_, sub)) = self.subs.remove(&subscription_id) {
            if let Some(ids) = self.by_channel.get(&sub.channel) {
                ids.remove(&subscription_id);
            }
        }
    }

    async fn close(&self) {
        self.subs.clear();
        self.by_channel.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let ps = InMemoryPubSub::new(8);
        let mut sub = ps.subscribe("rec_tbl_T1").await.unwrap();
        ps.publish("rec_tbl_T1", json!({"v": 1})).await.unwrap();
        let msg = sub.rx.recv().await.unwrap();
        assert_eq!(msg.channel, "rec_tbl_T1");
        assert_eq!(msg.payload, json!({"v": 1}));
    }

    #[tokio::test]
    async fn publish_to_unknown_channel_is_a_noop() {
        let ps = InMemoryPubSub::new(8);
        ps.publish("nobody_subscribed", json!({"v": 1})).await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let ps = InMemoryPubSub::new(8);
        let sub = ps.subscribe("rec_tbl_T1").await.unwrap();
        let id = sub.id;
        drop(sub);
        ps.unsubscribe(id).await;
        ps.publish("rec_tbl_T1", json!({"v": 1})).await.unwrap();
        assert!(ps.by_channel.get("rec_tbl_T1").map(|s| s.is_empty()).unwrap_or(true));
    }

    #[tokio::test]
    async fn full_queue_drops_rather_than_blocks() {
        let ps = InMemoryPubSub::new(1);
        let sub = ps.subscribe("rec_tbl_T1").await.unwrap();
        ps.publish("rec_tbl_T1", json!(1)).await.unwrap();
        // Second publish finds the queue full and must not hang.
        ps.publish("rec_tbl_T1", json!(2)).await.unwrap();
        drop(sub);
    }

    #[tokio::test]
    async fn independent_channels_do_not_cross_deliver() {
        let ps = InMemoryPubSub::new(8);
        let mut a = ps.subscribe("rec_tbl_A").await.unwrap();
        let _b = ps.subscribe("rec_tbl_B").await.unwrap();
        ps.publish("rec_tbl_A", json!("hello")).await.unwrap();
        let msg = a.rx.recv().await.unwrap();
        assert_eq!(msg.channel, "rec_tbl_A");
        assert!(a.rx.try_recv().is_err());
    }
}
