//! Connection bookkeeping: admission limits and per-connection
//! subscription tracking.
//!
//! A DashMap-keyed registry, one coarse concurrent map instead of a
//! supervisor tree, since connections here don't need mailboxes of their
//! own.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::error::{CoreError, CoreResult};

/// Live state for one WebSocket connection: its subscribed channels and a
/// cancellation token that tears down its background tasks on disconnect.
pub struct Connection {
    pub id: String,
    pub user_id: String,
    pub created_at: Instant,
    pub cancel: CancellationToken,
    subscriptions: Mutex<HashSet<String>>,
    last_seen: Mutex<Instant>,
}

impl Connection {
    fn new(user_id: &str) -> Self {
        let now = Instant::now();
        Self {
            id: Ulid::new().to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(HashSet::new()),
            last_seen: Mutex::new(now),
        }
    }

    pub fn track_subscription(&self, channel: &str) {
        self.subscriptions.lock().insert(channel.to_string());
    }

    pub fn untrack_subscription(&self, channel: &str) {
        self.subscriptions.lock().remove(channel);
    }

    pub fn subscribed_channels(&self) -> Vec<String> {
        self.subscriptions.lock().iter().cloned().collect()
    }

    /// Record that a pong (or other liveness signal) was just observed.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Enforces `max_connections_per_user` and `max_total_connections`, and
/// hands out a [`Connection`] handle per accepted socket.
pub struct ConnectionTracker {
    by_id: DashMap<String, Arc<Connection>>,
    by_user: DashMap<String, HashSet<String>>,
    total: AtomicUsize,
    max_per_user: usize,
    max_total: usize,
}

impl ConnectionTracker {
    pub fn new(max_per_user: usize, max_total: usize) -> Self {
        Self {
            by_id: DashMap::new(),
            by_user: DashMap::new(),
            total: AtomicUsize::new(0),
            max_per_user,
            max_total,
        }
    }

    /// Admit a new connection for `user_id`, or reject it if either limit
    /// would be exceeded.
    pub fn admit(&self, user_id: &str) -> CoreResult<Arc<Connection>> {
        if self.total.load(Ordering::Relaxed) >= self.max_total {
            return Err(CoreError::PolicyViolation("server connection limit reached".into()));
        }
        let per_user_count = self.by_user.get(user_id).map(|s| s.len()).unwrap_or(0);
        if per_user_count >= self.max_per_user {
            return Err(CoreError::PolicyViolation("per-user connection limit reached".into()));
        }

        let conn = Arc::new(Connection::new(user_id));
        self.by_id.insert(conn.id.clone(), conn.clone());
        self.by_user.entry(user_id.to_string()).or_default().insert(conn.id.clone());
        self.total.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("ws_connections_active").set(self.total.load(Ordering::Relaxed) as f64);
        metrics::counter!("ws_connections_total").increment(1);
        Ok(conn)
    }

    /// Remove a connection, e.g. when its socket closes. Cancels its token
    /// so any background tasks watching it wind down.
    pub fn remove(&self, connection_id: &str) {
        if let Some((_, conn)) = self.by_id.remove(connection_id) {
            conn.cancel.cancel();
            if let Some(mut ids) = self.by_user.get_mut(&conn.user_id) {
                ids.remove(connection_id);
            }
            self.total.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("ws_connections_active").set(self.total.load(Ordering::Relaxed) as f64);
        }
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.by_id.get(connection_id).map(|e| e.clone())
    }

    pub fn active_count(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Force-close every connection whose `lastSeen` is older than
    /// `max_idle`. Intended to run on a periodic cleanup tick; closing is
    /// just cancelling the connection's token — the dispatcher's own select
    /// loop performs the actual socket teardown and deregistration.
    pub fn reap_stale(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = self
            .by_id
            .iter()
            .filter(|e| e.value().idle_for() >= max_idle)
            .map(|e| e.key().clone())
            .collect();
        for id in &stale {
            if let Some(conn) = self.get(id) {
                conn.cancel.cancel();
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_per_user_limit() {
        let tracker = ConnectionTracker::new(2, 100);
        assert!(tracker.admit("user-1").is_ok());
        assert!(tracker.admit("user-1").is_ok());
        assert!(tracker.admit("user-1").is_err());
    }

    #[test]
    fn different_users_have_independent_limits() {
        let tracker = ConnectionTracker::new(1, 100);
        assert!(tracker.admit("user-1").is_ok());
        assert!(tracker.admit("user-2").is_ok());
    }

    #[test]
    fn enforces_total_connection_limit_across_users() {
        let tracker = ConnectionTracker::new(10, 1);
        assert!(tracker.admit("user-1").is_ok());
        assert!(tracker.admit("user-2").is_err());
    }

    #[test]
    fn remove_frees_up_both_limits() {
        let tracker = ConnectionTracker::new(1, 1);
        let conn = tracker.admit("user-1").unwrap();
        assert!(tracker.admit("user-1").is_err());
        tracker.remove(&conn.id);
        assert!(tracker.admit("user-1").is_ok());
    }

    #[test]
    fn remove_cancels_the_connection_token() {
        let tracker = ConnectionTracker::new(10, 10);
        let conn = tracker.admit("user-1").unwrap();
        assert!(!conn.cancel.is_cancelled());
        tracker.remove(&conn.id);
        assert!(conn.cancel.is_cancelled());
    }

    #[test]
    fn reap_stale_cancels_idle_connections_only() {
        let tracker = ConnectionTracker::new(10, 10);
        let idle = tracker.admit("user-1").unwrap();
        let fresh = tracker.admit("user-2").unwrap();
        // Simulate the idle connection not having been touched in a while.
        *idle.last_seen.lock() = std::time::Instant::now() - Duration::from_secs(200);

        let reaped = tracker.reap_stale(Duration::from_secs(120));
        assert_eq!(reaped, 1);
        assert!(idle.cancel.is_cancelled());
        assert!(!fresh.cancel.is_cancelled());
    }

    #[test]
    fn subscription_tracking_roundtrips() {
        let conn = Connection::new("user-1");
        conn.track_subscription("rec_tbl_T1");
        conn.track_subscription("rec_tbl_T1.rec_R1");
        assert_eq!(conn.subscribed_channels().len(), 2);
        conn.untrack_subscription("rec_tbl_T1");
        assert_eq!(conn.subscribed_channels().len(), 1);
    }
}
