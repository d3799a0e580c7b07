//! Tracking of remote instances through presence broadcasts and heartbeats.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use karabo_core::Hash;

/// Missed heartbeat intervals after which a peer is declared gone.
pub const MISSED_BEATS: u32 = 3;

/// Topology change observed by an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    /// An instance announced itself, or was seen for the first time.
    New {
        /// Instance id.
        instance_id: String,
        /// Instance info.
        info: Hash,
    },
    /// An instance changed its info.
    Updated {
        /// Instance id.
        instance_id: String,
        /// New info.
        info: Hash,
    },
    /// An instance left, or stopped sending heartbeats.
    Gone {
        /// Instance id.
        instance_id: String,
        /// Last known info.
        info: Hash,
    },
}

impl InstanceEvent {
    /// Id of the instance concerned.
    pub fn instance_id(&self) -> &str {
        match self {
            InstanceEvent::New { instance_id, .. }
            | InstanceEvent::Updated { instance_id, .. }
            | InstanceEvent::Gone { instance_id, .. } => instance_id,
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    info: Hash,
    interval: Duration,
    last_seen: Instant,
}

/// Known peers with their last heartbeat.
#[derive(Debug, Default)]
pub struct InstanceTracker {
    peers: HashMap<String, Tracked>,
}

impl InstanceTracker {
    /// Record presence of `id`; returns true if it was unknown.
    pub fn seen(&mut self, id: &str, info: &Hash, interval_secs: Option<u64>) -> bool {
        let interval = interval_secs
            .or_else(|| info.get_as::<u64>("heartbeatInterval").ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(20));
        match self.peers.get_mut(id) {
            Some(t) => {
                t.last_seen = Instant::now();
                t.interval = interval;
                if !info.is_empty() {
                    t.info = info.clone();
                }
                false
            }
            None => {
                self.peers.insert(
                    id.to_string(),
                    Tracked {
                        info: info.clone(),
                        interval,
                        last_seen: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// Forget `id`, returning its last info.
    pub fn remove(&mut self, id: &str) -> Option<Hash> {
        self.peers.remove(id).map(|t| t.info)
    }

    /// Remove and return peers whose heartbeats stopped.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, Hash)> {
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, t)| now.duration_since(t.last_seen) > t.interval * MISSED_BEATS)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.peers.remove(&id).map(|t| (id, t.info)))
            .collect()
    }

    /// Info of a tracked peer.
    pub fn info(&self, id: &str) -> Option<&Hash> {
        self.peers.get(id).map(|t| &t.info)
    }

    /// True if `id` is tracked.
    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Snapshot of all tracked peers.
    pub fn snapshot(&self) -> Vec<(String, Hash)> {
        self.peers
            .iter()
            .map(|(id, t)| (id.clone(), t.info.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use karabo_core::hash;

    #[test]
    fn expiry_after_three_missed_beats() {
        let mut tracker = InstanceTracker::default();
        assert!(tracker.seen("a", &hash! { "type" => "device" }, Some(1)));
        assert!(!tracker.seen("a", &Hash::new(), Some(1)));
        assert_eq!(tracker.info("a").unwrap().get::<String>("type").unwrap(), "device");

        let now = Instant::now();
        assert!(tracker.expire(now + Duration::from_millis(2900)).is_empty());
        let gone = tracker.expire(now + Duration::from_millis(3100));
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].0, "a");
        assert!(!tracker.contains("a"));
    }

    #[test]
    fn interval_from_info() {
        let mut tracker = InstanceTracker::default();
        tracker.seen("b", &hash! { "heartbeatInterval" => 2i32 }, None);
        let now = Instant::now();
        assert!(tracker.expire(now + Duration::from_secs(5)).is_empty());
        assert_eq!(tracker.expire(now + Duration::from_secs(7)).len(), 1);
    }
}
