//! `SyncCoordinator`: drives header-chain catch-up and tip-change
//! announcements on top of a `ChainView`.
//!
//! `header_processor::process` and `announce::find_headers_to_announce` are
//! pure functions over a `ChainView` snapshot; this coordinator is the thin
//! layer of state they need but don't carry themselves — principally "what
//! tip did we last announce to the world".

use crate::domain::{BlockHeader, ChainView, Hash};
use crate::network::announce;
use crate::network::errors::ProtocolError;
use crate::network::header_processor::{self, HeaderProcessResult};

pub struct SyncCoordinator {
    last_announced_tip: Hash,
}

impl SyncCoordinator {
    pub fn new(genesis_hash: Hash) -> Self {
        SyncCoordinator {
            last_announced_tip: genesis_hash,
        }
    }

    /// Validate and accept a header batch from a peer.
    pub fn process_headers(
        &mut self,
        chain: &mut dyn ChainView,
        headers: &[BlockHeader],
        peer_sent_max: bool,
        maybe_announcement: bool,
        already_in_flight: impl Fn(&Hash) -> bool,
    ) -> Result<HeaderProcessResult, ProtocolError> {
        header_processor::process(chain, headers, peer_sent_max, maybe_announcement, already_in_flight)
    }

    /// Checks whether the active tip has moved since the last announcement
    /// and, if so, returns the headers to announce and advances
    /// the bookkeeping. Returns `None` if the tip is unchanged or the old
    /// tip fell off a reorg (handled upstream by falling back to `inv`).
    pub fn headers_to_announce(&mut self, chain: &dyn ChainView) -> Option<Vec<Hash>> {
        let new_tip = chain.tip().hash;
        if new_tip == self.last_announced_tip {
            return None;
        }
        let old_tip = self.last_announced_tip;
        self.last_announced_tip = new_tip;
        announce::find_headers_to_announce(chain, &old_tip, &new_tip)
    }

    pub fn last_announced_tip(&self) -> Hash {
        self.last_announced_tip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MapChainView, NULL_HASH};

    fn header(prev: Hash, nonce: u32) -> BlockHeader {
        BlockHeader { version: 1, prev_block_hash: prev, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce }
    }

    #[test]
    fn announces_new_headers_once_tip_advances() {
        let genesis = header(NULL_HASH, 0);
        let genesis_hash = crate::domain::header_hash(&genesis);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let mut coordinator = SyncCoordinator::new(genesis_hash);

        assert!(coordinator.headers_to_announce(&chain).is_none());

        let h1 = header(genesis_hash, 1);
        let r1 = chain.accept_header(&h1).unwrap();
        let announce = coordinator.headers_to_announce(&chain).unwrap();
        assert_eq!(announce, vec![r1.hash]);

        // Second call with no further change returns None.
        assert!(coordinator.headers_to_announce(&chain).is_none());
    }

    #[test]
    fn process_headers_delegates_to_header_processor() {
        let genesis = header(NULL_HASH, 0);
        let genesis_hash = crate::domain::header_hash(&genesis);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let mut coordinator = SyncCoordinator::new(genesis_hash);
        let h1 = header(genesis_hash, 1);
        let result = coordinator
            .process_headers(&mut chain, &[h1], false, true, |_| false)
            .unwrap();
        assert!(!result.rejected);
        assert_eq!(result.accepted.len(), 1);
    }
}
