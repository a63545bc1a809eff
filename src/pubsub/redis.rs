//! Redis-backed pub/sub, for multi-instance deployments. One Redis
//! connection per locally-subscribed channel fans a `PUBLISH` out to every
//! local subscriber on that channel, same as [`super::memory::InMemoryPubSub`]
//! does for a single process — this backend just adds Redis as the
//! cross-instance relay.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::{PublishedMessage, PubSub, Subscription};
use crate::error::{CoreError, CoreResult};

struct Sub {
    tx: mpsc::Sender<PublishedMessage>,
}

struct Inner {
    subs: DashMap<u64, Sub>,
    by_channel: DashMap<String, DashSet<u64>>,
    listeners: DashMap<String, CancellationToken>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Inner {
    fn deliver(&self, channel: &str, msg: &PublishedMessage) {
        let Some(ids) = self.by_channel.get(channel) else { return };
        for id in ids.iter() {
            if let Some(sub) = self.subs.get(&id) {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => metrics::counter!("pubsub_messages_published_total").increment(1),
                    Err(_) => {
                        metrics::counter!("pubsub_messages_dropped_total").increment(1);
                        warn!(channel, subscriber = *id, "subscriber queue full, dropping message");
                    }
                }
            }
        }
    }
}

pub struct RedisPubSub {
    inner: Arc<Inner>,
    client: redis::Client,
    publish_conn: redis::aio::ConnectionManager,
}

impl RedisPubSub {
    pub async fn connect(redis_url: &str, queue_capacity: usize) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::Internal(format!("invalid redis url: {e}")))?;
        let publish_conn = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Internal(format!("redis connection failed: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                subs: DashMap::new(),
                by_channel: DashMap::new(),
                listeners: DashMap::new(),
                next_id: AtomicU64::new(1),
                queue_capacity,
            }),
            client,
            publish_conn,
        })
    }

    /// Spawn the background task relaying Redis messages on `channel` to
    /// every locally-registered subscriber. One task per channel per
    /// process, torn down when the last local subscriber leaves.
    fn spawn_listener(&self, channel: String) {
        let inner = self.inner.clone();
        let client = self.client.clone();
        let cancel = CancellationToken::new();
        self.inner.listeners.insert(channel.clone(), cancel.clone());

        tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    error!(channel = %channel, error = %e, "failed to open redis pubsub connection");
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel).await {
                error!(channel = %channel, error = %e, "failed to subscribe to redis channel");
                return;
            }
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = futures::StreamExt::next(&mut stream) => {
                        let Some(msg) = next else { break };
                        let payload: String = match msg.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!(channel = %channel, error = %e, "malformed redis payload");
                                continue;
                            }
                        };
                        match serde_json::from_str::<PublishedMessage>(&payload) {
                            Ok(parsed) => inner.deliver(&channel, &parsed),
                            Err(e) => warn!(channel = %channel, error = %e, "failed to decode published message"),
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: serde_json::Value) -> CoreResult<()> {
        let msg = PublishedMessage { channel: channel.to_string(), payload };
        let encoded = serde_json::to_string(&msg)
            .map_err(|e| CoreError::Internal(format!("failed to encode message: {e}")))?;
        let mut conn = self.publish_conn.clone();
        conn.publish::<_, _, ()>(channel, encoded)
            .await
            .map_err(|e| CoreError::Internal(format!("redis publish failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> CoreResult<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        self.inner.subs.insert(id, Sub { tx });
        let ids = self.inner.by_channel.entry(channel.to_string()).or_default();
        ids.insert(id);
        let is_first = ids.len() == 1;
        drop(ids);

        if is_first {
            self.spawn_listener(channel.to_string());
        }

        Ok(Subscription { id, channel: channel.to_string(), rx })
    }

    async fn unsubscribe(&self, subscription_id: u64) {
        self.inner.subs.remove(&subscription_id);
        let mut now_empty = None;
        for entry in self.inner.by_channel.iter() {
            if entry.value().contains(&subscription_id) {
                entry.value().remove(&subscription_id);
                if entry.value().is_empty() {
                    now_empty = Some(entry.key().clone());
                }
                break;
            }
        }
        if let Some(channel) = now_empty {
            self.inner.by_channel.remove(&channel);
            if let Some((_, cancel)) = self.inner.listeners.remove(&channel) {
                cancel.cancel();
            }
        }
    }

    async fn close(&self) {
        for entry in self.inner.listeners.iter() {
            entry.value().cancel();
        }
        self.inner.listeners.clear();
        self.inner.by_channel.clear();
        self.inner.subs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_malformed_url() {
        let result = futures::executor::block_on(RedisPubSub::connect("not-a-url", 8));
        assert!(result.is_err());
    }
}
