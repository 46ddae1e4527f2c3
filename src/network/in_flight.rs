//! `InFlightIndex`: process-wide record of outstanding block requests,
//! used to avoid duplicate fetches and to implement stall timeouts.

use crate::domain::Hash;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct QueuedBlock {
    pub peer_id: String,
    pub block_hash: Hash,
    pub requested_at: Instant,
    pub timeout_at: Instant,
    pub headers_validated: bool,
}

/// Default stalling timeout; configurable via `RelayConfig::stalling_timeout`.
pub const DEFAULT_STALLING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct InFlightIndex {
    by_peer_and_hash: HashMap<(String, Hash), QueuedBlock>,
    by_hash: HashMap<Hash, HashSet<String>>,
}

impl InFlightIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer_id: String, block_hash: Hash, timeout: Duration, headers_validated: bool) {
        let now = Instant::now();
        let queued = QueuedBlock {
            peer_id: peer_id.clone(),
            block_hash,
            requested_at: now,
            timeout_at: now + timeout,
            headers_validated,
        };
        self.by_hash.entry(block_hash).or_default().insert(peer_id.clone());
        self.by_peer_and_hash.insert((peer_id, block_hash), queued);
    }

    pub fn erase(&mut self, peer_id: &str, block_hash: &Hash) {
        self.by_peer_and_hash.remove(&(peer_id.to_string(), *block_hash));
        if let Some(peers) = self.by_hash.get_mut(block_hash) {
            peers.remove(peer_id);
            if peers.is_empty() {
                self.by_hash.remove(block_hash);
            }
        }
    }

    /// Drops every entry for `peer_id` (used on disconnect), returning the
    /// block hashes that were in flight to it.
    pub fn erase_peer(&mut self, peer_id: &str) -> Vec<Hash> {
        let hashes: Vec<Hash> = self
            .by_peer_and_hash
            .keys()
            .filter(|(p, _)| p == peer_id)
            .map(|(_, h)| *h)
            .collect();
        for hash in &hashes {
            self.erase(peer_id, hash);
        }
        hashes
    }

    pub fn is_in_flight(&self, block_hash: &Hash) -> bool {
        self.by_hash.contains_key(block_hash)
    }

    pub fn nodes_with_queued(&self, block_hash: &Hash) -> Vec<String> {
        self.by_hash.get(block_hash).map_or(Vec::new(), |s| s.iter().cloned().collect())
    }

    pub fn queued_for(&self, peer_id: &str, block_hash: &Hash) -> Option<&QueuedBlock> {
        self.by_peer_and_hash.get(&(peer_id.to_string(), *block_hash))
    }

    pub fn peer_in_flight_count(&self, peer_id: &str) -> u32 {
        self.by_peer_and_hash.keys().filter(|(p, _)| p == peer_id).count() as u32
    }

    /// Every queued block whose deadline has passed, as of `now`. The
    /// caller disconnects the slowest peer per stalled block and calls
    /// `erase`/`erase_peer` accordingly.
    pub fn stalled(&self, now: Instant) -> Vec<QueuedBlock> {
        self.by_peer_and_hash
            .values()
            .filter(|q| q.timeout_at <= now)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_erase_clears_in_flight_state() {
        let mut index = InFlightIndex::new();
        let hash = [1u8; 32];
        index.insert("peer-1".into(), hash, Duration::from_secs(2), false);
        assert!(index.is_in_flight(&hash));
        index.erase("peer-1", &hash);
        assert!(!index.is_in_flight(&hash));
    }

    #[test]
    fn multiple_peers_can_queue_the_same_hash() {
        let mut index = InFlightIndex::new();
        let hash = [2u8; 32];
        index.insert("peer-1".into(), hash, Duration::from_secs(2), false);
        index.insert("peer-2".into(), hash, Duration::from_secs(2), false);
        assert_eq!(index.nodes_with_queued(&hash).len(), 2);
        index.erase("peer-1", &hash);
        assert!(index.is_in_flight(&hash));
        index.erase("peer-2", &hash);
        assert!(!index.is_in_flight(&hash));
    }

    #[test]
    fn erase_peer_drops_all_its_entries() {
        let mut index = InFlightIndex::new();
        index.insert("peer-1".into(), [3u8; 32], Duration::from_secs(2), false);
        index.insert("peer-1".into(), [4u8; 32], Duration::from_secs(2), false);
        let dropped = index.erase_peer("peer-1");
        assert_eq!(dropped.len(), 2);
        assert_eq!(index.peer_in_flight_count("peer-1"), 0);
    }

    #[test]
    fn stalled_reports_entries_past_their_deadline() {
        let mut index = InFlightIndex::new();
        index.insert("peer-1".into(), [5u8; 32], Duration::from_millis(0), false);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(index.stalled(Instant::now()).len(), 1);
    }
}
