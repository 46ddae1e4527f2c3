//! `HeaderProcessor`: validates header batches arriving out-of-band or
//! preceding a block, and arms locator-based catch-up for gaps.

use crate::domain::{BlockHeader, ChainView, Hash, HeaderError, HeaderRef};
use crate::network::errors::ProtocolError;
use tracing::{debug, warn};

/// `MAX_BLOCKS_IN_TRANSIT_PER_PEER=16`, the cap on how many
/// headers `process` will hand to the caller as directly-fetchable.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;

pub struct HeaderProcessResult {
    /// `Some(weight)` if the peer should be misbehavior-scored.
    pub misbehavior: Option<i32>,
    /// The batch was rejected outright (a continuity break or a
    /// consensus-invalid header).
    pub rejected: bool,
    /// The first header's `prev` was unknown; no header was marked bad.
    pub unconnecting: bool,
    /// A follow-up `getheaders` with the active-chain locator should be
    /// sent (either because of an unconnecting batch, or because the peer
    /// sent a full-size batch and may have more).
    pub send_locator: bool,
    /// Headers between the common ancestor and the new tip, not yet
    /// in-flight, capped at `MAX_BLOCKS_IN_TRANSIT_PER_PEER`, in order —
    /// handed to `AnnounceReceiver` for a direct-fetch decision.
    pub to_fetch: Vec<Hash>,
    pub accepted: Vec<HeaderRef>,
}

impl HeaderProcessResult {
    fn rejected(weight: i32) -> Self {
        HeaderProcessResult {
            misbehavior: Some(weight),
            rejected: true,
            unconnecting: false,
            send_locator: false,
            to_fetch: Vec::new(),
            accepted: Vec::new(),
        }
    }

    fn unconnecting() -> Self {
        HeaderProcessResult {
            misbehavior: None,
            rejected: false,
            unconnecting: true,
            send_locator: true,
            to_fetch: Vec::new(),
            accepted: Vec::new(),
        }
    }
}

/// `process(headers, peer_sent_max, maybe_announcement)`.
///
/// `already_in_flight` lets the caller exclude blocks already queued
/// elsewhere from the `to_fetch` list.
pub fn process(
    chain: &mut dyn ChainView,
    headers: &[BlockHeader],
    peer_sent_max: bool,
    maybe_announcement: bool,
    already_in_flight: impl Fn(&Hash) -> bool,
) -> Result<HeaderProcessResult, ProtocolError> {
    if headers.is_empty() {
        return Ok(HeaderProcessResult {
            misbehavior: None,
            rejected: false,
            unconnecting: false,
            send_locator: false,
            to_fetch: Vec::new(),
            accepted: Vec::new(),
        });
    }

    for pair in headers.windows(2) {
        let expected_prev = crate::domain::header_hash(&pair[0]);
        if pair[1].prev_block_hash != expected_prev {
            warn!("header batch has a break in prev linkage");
            return Ok(HeaderProcessResult::rejected(20));
        }
    }

    let old_tip = chain.tip();

    let mut accepted = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        match chain.accept_header(header) {
            Ok(href) => accepted.push(href),
            Err(HeaderError::Unconnecting) if i == 0 => {
                debug!("first header in batch does not connect, requesting locator catch-up");
                return Ok(HeaderProcessResult::unconnecting());
            }
            Err(HeaderError::Unconnecting) => {
                // A continuity break mid-batch past the first header is
                // already caught by the prev-linkage loop above; reaching
                // here means the chain view itself rejected a header we
                // believed connected, which is a bug in the caller's chain
                // view, not peer misbehavior. Treat conservatively as bad.
                return Ok(HeaderProcessResult::rejected(20));
            }
            Err(HeaderError::Invalid(reason)) => {
                warn!(%reason, "consensus-invalid header");
                return Ok(HeaderProcessResult::rejected(20));
            }
        }
    }

    let mut result = HeaderProcessResult {
        misbehavior: None,
        rejected: false,
        unconnecting: false,
        send_locator: peer_sent_max,
        to_fetch: Vec::new(),
        accepted: accepted.clone(),
    };

    if maybe_announcement {
        let new_tip = accepted.last().cloned().unwrap_or(old_tip.clone());
        if new_tip.chain_work >= old_tip.chain_work {
            let path = chain.path_between(&new_tip.hash, &old_tip.hash).unwrap_or_default();
            result.to_fetch = path
                .into_iter()
                .filter(|h| !chain_contains_as_old_tip(h, &old_tip) && !already_in_flight(h))
                .take(MAX_BLOCKS_IN_TRANSIT_PER_PEER)
                .collect();
        }
    }

    Ok(result)
}

fn chain_contains_as_old_tip(hash: &Hash, old_tip: &HeaderRef) -> bool {
    *hash == old_tip.hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MapChainView, NULL_HASH};

    fn header(prev: Hash, nonce: u32) -> BlockHeader {
        BlockHeader { version: 1, prev_block_hash: prev, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce }
    }

    #[test]
    fn rejects_batch_with_broken_prev_linkage() {
        let genesis = header(NULL_HASH, 0);
        let genesis_hash = crate::domain::header_hash(&genesis);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let h1 = header(genesis_hash, 1);
        let h2 = header([0xAA; 32], 2); // does not connect to h1
        let result = process(&mut chain, &[h1, h2], false, false, |_| false).unwrap();
        assert!(result.rejected);
        assert_eq!(result.misbehavior, Some(20));
    }

    #[test]
    fn unconnecting_first_header_requests_locator_without_rejecting() {
        let genesis = header(NULL_HASH, 0);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let orphan = header([0xBB; 32], 5);
        let result = process(&mut chain, &[orphan], false, false, |_| false).unwrap();
        assert!(result.unconnecting);
        assert!(!result.rejected);
        assert!(result.send_locator);
    }

    #[test]
    fn peer_sent_max_requests_follow_up_locator() {
        let genesis = header(NULL_HASH, 0);
        let genesis_hash = crate::domain::header_hash(&genesis);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let h1 = header(genesis_hash, 1);
        let result = process(&mut chain, &[h1], true, false, |_| false).unwrap();
        assert!(result.send_locator);
        assert!(!result.rejected);
    }

    #[test]
    fn empty_batch_is_a_no_op() {
        let genesis = header(NULL_HASH, 0);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let result = process(&mut chain, &[], false, false, |_| false).unwrap();
        assert!(!result.rejected && !result.unconnecting && !result.send_locator);
    }
}
