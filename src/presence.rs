//! Ephemeral per-channel presence: who's looking at a document right now,
//! expiring automatically if nobody refreshes it.
//!
//! Presence never persists and never replays through the operation log —
//! it's its own coarse-locked map, separate from [`crate::document`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone)]
struct PresenceEntry {
    data: Value,
    updated_at: Instant,
}

/// Tracks presence payloads per `(channel, src)`, evicting entries older
/// than `ttl` on read.
pub struct PresenceManager {
    by_channel: DashMap<String, HashMap<String, PresenceEntry>>,
    ttl: Duration,
}

impl PresenceManager {
    pub fn new(ttl: Duration) -> Self {
        Self { by_channel: DashMap::new(), ttl }
    }

    /// Record (or refresh) `src`'s presence payload on `channel`.
    pub fn submit(&self, channel: &str, src: &str, data: Value) {
        let mut entries = self.by_channel.entry(channel.to_string()).or_default();
        entries.insert(src.to_string(), PresenceEntry { data, updated_at: Instant::now() });
    }

    /// All non-expired presence payloads on `channel`, keyed by source.
    pub fn get_presences(&self, channel: &str) -> HashMap<String, Value> {
        let Some(mut entries) = self.by_channel.get_mut(channel) else {
            return HashMap::new();
        };
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.updated_at.elapsed() < ttl);
        entries.iter().map(|(src, entry)| (src.clone(), entry.data.clone())).collect()
    }

    /// Explicitly remove `src`'s presence from `channel`, e.g. on
    /// disconnect.
    pub fn remove_presence(&self, channel: &str, src: &str) {
        if let Some(mut entries) = self.by_channel.get_mut(channel) {
            entries.remove(src);
        }
    }

    /// Sweep every channel, dropping expired entries and any channel left
    /// empty. Intended to run on a periodic background task. Returns the
    /// number of non-expired records left across every channel, so a caller
    /// can report it on the `presence_records_active` gauge.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.ttl;
        self.by_channel.retain(|_, entries| {
            entries.retain(|_, entry| entry.updated_at.elapsed() < ttl);
            !entries.is_empty()
        });
        self.by_channel.iter().map(|e| e.value().len()).sum()
    }

    /// Drop all presence state, e.g. on shutdown.
    pub fn close(&self) {
        self.by_channel.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn submit_then_get_roundtrips() {
        let pm = PresenceManager::new(Duration::from_secs(300));
        pm.submit("rec_tbl_T1", "user-1", json!({"cursor": 5}));
        let presences = pm.get_presences("rec_tbl_T1");
        assert_eq!(presences.get("user-1"), Some(&json!({"cursor": 5})));
    }

    #[test]
    fn expired_entries_are_excluded() {
        let pm = PresenceManager::new(Duration::from_millis(1));
        pm.submit("rec_tbl_T1", "user-1", json!({"cursor": 5}));
        std::thread::sleep(Duration::from_millis(5));
        assert!(pm.get_presences("rec_tbl_T1").is_empty());
    }

    #[test]
    fn remove_presence_is_immediate() {
        let pm = PresenceManager::new(Duration::from_secs(300));
        pm.submit("rec_tbl_T1", "user-1", json!({}));
        pm.remove_presence("rec_tbl_T1", "user-1");
        assert!(pm.get_presences("rec_tbl_T1").is_empty());
    }

    #[test]
    fn sweep_drops_empty_channels() {
        let pm = PresenceManager::new(Duration::from_millis(1));
        pm.submit("rec_tbl_T1", "user-1", json!({}));
        std::thread::sleep(Duration::from_millis(5));
        let remaining = pm.sweep_expired();
        assert!(pm.by_channel.is_empty());
        assert_eq!(remaining, 0);
    }

    #[test]
    fn sweep_reports_the_remaining_active_count() {
        let pm = PresenceManager::new(Duration::from_secs(300));
        pm.submit("rec_tbl_T1", "user-1", json!({}));
        pm.submit("rec_tbl_T1", "user-2", json!({}));
        pm.submit("rec_tbl_T2", "user-3", json!({}));
        assert_eq!(pm.sweep_expired(), 3);
    }

    #[test]
    fn unknown_channel_returns_empty() {
        let pm = PresenceManager::new(Duration::from_secs(300));
        assert!(pm.get_presences("nobody_here").is_empty());
    }
}
