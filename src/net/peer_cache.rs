//! Per-identity event flags.
//!
//! The cache suppresses duplicate work (re-adds, re-floods, re-disconnects)
//! and carries the reconnect rule: a disconnected peer is accepted again when
//! an event stamped later than its last recorded one arrives. Entries live
//! for the process lifetime.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct PeerFlags {
    pub added: bool,
    pub announced: bool,
    pub disconnected: bool,
    /// Wall-clock stamp of the last event that changed these flags. Wall time
    /// because it is compared against stamps minted by other peers.
    pub time: Option<DateTime<Utc>>,
}

impl PeerFlags {
    /// A later-stamped event from a disconnected peer re-enables it.
    pub fn reconnecting(&self, event_time: DateTime<Utc>) -> bool {
        self.disconnected && self.time.map_or(true, |t| event_time > t)
    }
}

#[derive(Default)]
pub struct PeerCache {
    map: HashMap<String, PeerFlags>,
}

impl PeerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags for `id`, defaulted if never seen.
    pub fn get(&self, id: &str) -> PeerFlags {
        self.map.get(id).copied().unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    /// Ensure an entry exists without setting any flag.
    pub fn touch(&mut self, id: &str) {
        self.map.entry(id.to_string()).or_default();
    }

    pub fn mark_added(&mut self, id: &str, time: DateTime<Utc>) {
        let flags = self.map.entry(id.to_string()).or_default();
        flags.added = true;
        flags.disconnected = false;
        flags.time = Some(time);
    }

    pub fn mark_announced(&mut self, id: &str) {
        self.map.entry(id.to_string()).or_default().announced = true;
    }

    /// Flip to disconnected. Returns false when already disconnected, so
    /// disconnect floods stay at-most-once per id.
    pub fn mark_disconnected(&mut self, id: &str, time: DateTime<Utc>) -> bool {
        let flags = self.map.entry(id.to_string()).or_default();
        if flags.disconnected {
            return false;
        }
        flags.disconnected = true;
        flags.time = Some(time);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn default_flags_are_clear() {
        let cache = PeerCache::new();
        let flags = cache.get("a.b");
        assert!(!flags.added && !flags.announced && !flags.disconnected);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let mut cache = PeerCache::new();
        let t = crate::types::now();
        assert!(cache.mark_disconnected("a.b", t));
        assert!(!cache.mark_disconnected("a.b", t));
    }

    #[test]
    fn later_event_reconnects() {
        let mut cache = PeerCache::new();
        let t = crate::types::now();
        cache.mark_added("a.b", t);
        cache.mark_disconnected("a.b", t);

        let flags = cache.get("a.b");
        assert!(!flags.reconnecting(t - Duration::seconds(1)));
        assert!(flags.reconnecting(t + Duration::seconds(1)));

        cache.mark_added("a.b", t + Duration::seconds(1));
        assert!(!cache.get("a.b").disconnected);
    }
}
