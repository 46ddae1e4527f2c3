//! Per-peer state.
//!
//! Updates happen under a single process-wide lock; this module only
//! defines the record and its pure derivations, not the locking discipline
//! (that lives in `node::NodeState`).

use crate::domain::{Hash, HeaderRef, NULL_HASH};
use crate::network::peer_worker::{ThinCapability, Worker};
use std::sync::Arc;
use std::time::Instant;

/// Ban threshold is policy (`RelayConfig::ban_threshold`); this module only
/// tracks the running score.
#[derive(Clone)]
pub struct PeerState {
    pub peer_id: String,
    pub misbehavior: i32,
    pub best_known_block: Option<HeaderRef>,
    pub hash_last_unknown_block: Hash,
    pub common_block: Option<HeaderRef>,
    pub best_header_sent: Option<HeaderRef>,
    pub unconnecting_headers: u32,
    pub prefers_headers: bool,
    pub prefers_blocks: bool,
    pub supports_compact_blocks: bool,
    /// What this peer has actually demonstrated it can serve/accept, used
    /// to pick which `Worker` variant `begin_block_fetch` builds. Distinct
    /// from `supports_compact_blocks`, which only drives the outbound
    /// announcement form (`decide_announcement`).
    pub thin_capability: ThinCapability,
    pub thinblock: Option<Arc<Worker>>,
    pub blocks_in_flight: u32,
    pub stalling_since: Option<Instant>,
}

impl PeerState {
    pub fn new(peer_id: impl Into<String>) -> Self {
        PeerState {
            peer_id: peer_id.into(),
            misbehavior: 0,
            best_known_block: None,
            hash_last_unknown_block: NULL_HASH,
            common_block: None,
            best_header_sent: None,
            unconnecting_headers: 0,
            prefers_headers: false,
            prefers_blocks: false,
            supports_compact_blocks: false,
            thin_capability: ThinCapability::None,
            thinblock: None,
            blocks_in_flight: 0,
            stalling_since: None,
        }
    }

    /// Adds `weight` to the running misbehavior score and reports whether
    /// the peer has now crossed `threshold`, triggering disconnect-and-ban.
    pub fn misbehave(&mut self, weight: i32, threshold: i32) -> bool {
        self.misbehavior = self.misbehavior.saturating_add(weight);
        self.misbehavior >= threshold
    }

    /// `UpdateBestFromLast`: resolves `hash_last_unknown_block`
    /// against the block index; if found and carrying more-or-equal chain
    /// work than the current best-known, promote it.
    pub fn update_best_from_last(&mut self, resolved: Option<HeaderRef>) {
        let Some(candidate) = resolved else { return };
        let current_work = self.best_known_block.as_ref().map_or(0, |h| h.chain_work);
        if candidate.chain_work >= current_work {
            self.best_known_block = Some(candidate);
            self.hash_last_unknown_block = NULL_HASH;
        }
    }

    /// Raises `thin_capability` to `capability` if it's an improvement,
    /// never downgrades. Wire evidence of a capability (a peer that sent us
    /// a `cmpctblock` clearly supports compact blocks) can arrive in any
    /// order relative to earlier, weaker evidence.
    pub fn bump_thin_capability(&mut self, capability: ThinCapability) {
        if capability > self.thin_capability {
            self.thin_capability = capability;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn href(work: u128) -> HeaderRef {
        HeaderRef { hash: [1u8; 32], height: 1, chain_work: work }
    }

    #[test]
    fn misbehave_reports_threshold_crossing() {
        let mut peer = PeerState::new("peer-1");
        assert!(!peer.misbehave(60, 100));
        assert!(peer.misbehave(40, 100));
    }

    #[test]
    fn update_best_from_last_promotes_on_equal_or_greater_work() {
        let mut peer = PeerState::new("peer-1");
        peer.best_known_block = Some(href(5));
        peer.hash_last_unknown_block = [2u8; 32];
        peer.update_best_from_last(Some(href(5)));
        assert_eq!(peer.hash_last_unknown_block, NULL_HASH);
    }

    #[test]
    fn update_best_from_last_ignores_lower_work() {
        let mut peer = PeerState::new("peer-1");
        peer.best_known_block = Some(href(10));
        peer.hash_last_unknown_block = [2u8; 32];
        peer.update_best_from_last(Some(href(3)));
        assert_eq!(peer.hash_last_unknown_block, [2u8; 32]);
    }

    #[test]
    fn bump_thin_capability_never_downgrades() {
        let mut peer = PeerState::new("peer-1");
        peer.bump_thin_capability(ThinCapability::Compact);
        assert_eq!(peer.thin_capability, ThinCapability::Compact);
        peer.bump_thin_capability(ThinCapability::BloomMerkle);
        assert_eq!(peer.thin_capability, ThinCapability::Compact);
        peer.bump_thin_capability(ThinCapability::XThin);
        assert_eq!(peer.thin_capability, ThinCapability::XThin);
    }
}
