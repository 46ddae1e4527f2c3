//! Block-announcement policy: deciding what to fetch when a peer tells us
//! about a new block, and what to tell peers when our own tip moves.

use crate::domain::{ChainView, Hash};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// `pow_target_spacing` for the chains this crate targets (Bitcoin Cash
/// lineage, 10-minute blocks); `almost_synced` scales its window off this.
pub const POW_TARGET_SPACING_SECS: u64 = 600;

/// `20 * pow_target_spacing`, the freshness window a tip's timestamp must
/// fall within for the node to consider itself synced enough to chase
/// announcements at all.
pub const ALMOST_SYNCED_WINDOW_SECS: u64 = 20 * POW_TARGET_SPACING_SECS;

pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    DontDownload,
    DownloadThinNow,
    DownloadFullNow,
}

/// Everything `pick_strategy` needs about the announced block and the
/// announcing peer, gathered by the caller under the process-wide lock.
pub struct AnnounceContext {
    pub tip_time: u64,
    pub have_block_data: bool,
    pub peer_supports_thin: bool,
    pub thin_enabled: bool,
    pub workers_for_hash: u32,
    pub thin_max_parallel: u32,
    pub already_in_flight: bool,
    pub peer_blocks_in_flight: u32,
    pub avoid_full_blocks: bool,
}

fn now_adjusted() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

fn almost_synced(tip_time: u64) -> bool {
    let now = now_adjusted();
    tip_time as i64 > now as i64 - ALMOST_SYNCED_WINDOW_SECS as i64
}

/// `pick_strategy`: decides whether and how to fetch an announced
/// block from the peer that announced it.
pub fn pick_strategy(ctx: &AnnounceContext) -> Strategy {
    if !almost_synced(ctx.tip_time) {
        return Strategy::DontDownload;
    }
    if ctx.have_block_data {
        return Strategy::DontDownload;
    }
    if ctx.peer_supports_thin && ctx.thin_enabled {
        if ctx.workers_for_hash >= ctx.thin_max_parallel {
            return Strategy::DontDownload;
        }
        return Strategy::DownloadThinNow;
    }
    if ctx.already_in_flight {
        return Strategy::DontDownload;
    }
    if ctx.peer_blocks_in_flight >= MAX_BLOCKS_IN_TRANSIT_PER_PEER {
        return Strategy::DontDownload;
    }
    if ctx.avoid_full_blocks {
        return Strategy::DontDownload;
    }
    Strategy::DownloadFullNow
}

/// Fetch instruction derived from a `DownloadFullNow`/`DownloadThinNow`
/// strategy: whether a `getheaders` locator must precede the block request
/// because the header chain does not yet lead it.
pub struct FullBlockFetch {
    pub needs_getheaders_first: bool,
}

pub fn full_block_fetch(header_known: bool) -> FullBlockFetch {
    FullBlockFetch { needs_getheaders_first: !header_known }
}

pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;

/// `find_headers_to_announce`: the connected chain of block hashes
/// from just after `old_tip` through `new_tip`, truncated to the 8 most
/// recent. `None` if `old_tip` is not an ancestor of `new_tip` (a reorg),
/// matching the "bail out to inv" rule below.
pub fn find_headers_to_announce(chain: &dyn ChainView, old_tip: &Hash, new_tip: &Hash) -> Option<Vec<Hash>> {
    let mut path = chain.path_between(new_tip, old_tip)?;
    // path_between returns [old_tip, ..., new_tip]; drop old_tip itself and
    // keep only the most recent MAX_BLOCKS_TO_ANNOUNCE.
    if !path.is_empty() {
        path.remove(0);
    }
    if path.len() > MAX_BLOCKS_TO_ANNOUNCE {
        let skip = path.len() - MAX_BLOCKS_TO_ANNOUNCE;
        path.drain(0..skip);
    }
    Some(path)
}

/// What to send a connected peer once `blocks_to_announce` is non-empty.
/// `hash` for `Inv`/`CmpctBlock` is the relevant block; `Headers`
/// carries the whole announce list from the first header the peer lacks.
pub enum AnnounceAction {
    CmpctBlock(Hash),
    FullBlock(Hash),
    Headers(Vec<Hash>),
    Inv(Hash),
}

pub struct PeerAnnouncePrefs {
    pub prefers_block_form: bool,
    pub prefers_headers: bool,
    pub supports_compact_blocks: bool,
}

/// Picks the announcement form for one peer given the pending
/// `blocks_to_announce` list (already filtered to blocks the peer doesn't
/// know about) and whether each sits on the active chain / connects.
///
/// `on_active_chain_and_connects` covers both the single-block "sits on the
/// active chain" check and the header-list "connects" check, since for a
/// pending list built from `find_headers_to_announce` they coincide.
pub fn decide_announcement(
    prefs: &PeerAnnouncePrefs,
    blocks_to_announce: &[Hash],
    on_active_chain_and_connects: bool,
    have_block_data: impl Fn(&Hash) -> bool,
) -> AnnounceAction {
    let Some(tip) = blocks_to_announce.last().copied() else {
        return AnnounceAction::Inv(crate::domain::NULL_HASH);
    };

    if !on_active_chain_and_connects {
        // reorg detected, or the list doesn't connect: always fall back to inv.
        return AnnounceAction::Inv(tip);
    }

    if prefs.prefers_block_form && blocks_to_announce.len() == 1 && have_block_data(&tip) {
        return if prefs.supports_compact_blocks {
            AnnounceAction::CmpctBlock(tip)
        } else {
            AnnounceAction::FullBlock(tip)
        };
    }

    if prefs.prefers_headers {
        return AnnounceAction::Headers(blocks_to_announce.to_vec());
    }

    AnnounceAction::Inv(tip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BlockHeader, MapChainView, NULL_HASH};

    fn header(prev: Hash, nonce: u32) -> BlockHeader {
        BlockHeader { version: 1, prev_block_hash: prev, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce }
    }

    fn base_ctx() -> AnnounceContext {
        AnnounceContext {
            tip_time: now_adjusted(),
            have_block_data: false,
            peer_supports_thin: false,
            thin_enabled: true,
            workers_for_hash: 0,
            thin_max_parallel: 3,
            already_in_flight: false,
            peer_blocks_in_flight: 0,
            avoid_full_blocks: false,
        }
    }

    #[test]
    fn not_synced_never_downloads() {
        let mut ctx = base_ctx();
        ctx.tip_time = 0;
        assert_eq!(pick_strategy(&ctx), Strategy::DontDownload);
    }

    #[test]
    fn already_have_the_block_skips_download() {
        let mut ctx = base_ctx();
        ctx.have_block_data = true;
        assert_eq!(pick_strategy(&ctx), Strategy::DontDownload);
    }

    #[test]
    fn thin_parallel_cap_blocks_further_workers() {
        let mut ctx = base_ctx();
        ctx.peer_supports_thin = true;
        ctx.workers_for_hash = 1;
        ctx.thin_max_parallel = 1;
        assert_eq!(pick_strategy(&ctx), Strategy::DontDownload);
    }

    #[test]
    fn thin_capable_peer_under_cap_downloads_thin_now() {
        let mut ctx = base_ctx();
        ctx.peer_supports_thin = true;
        ctx.workers_for_hash = 0;
        ctx.thin_max_parallel = 3;
        assert_eq!(pick_strategy(&ctx), Strategy::DownloadThinNow);
    }

    #[test]
    fn non_thin_peer_falls_back_to_full_block() {
        let ctx = base_ctx();
        assert_eq!(pick_strategy(&ctx), Strategy::DownloadFullNow);
    }

    #[test]
    fn full_block_peer_respects_in_flight_cap() {
        let mut ctx = base_ctx();
        ctx.peer_blocks_in_flight = 16;
        assert_eq!(pick_strategy(&ctx), Strategy::DontDownload);
    }

    #[test]
    fn find_headers_to_announce_truncates_to_eight() {
        let genesis = header(NULL_HASH, 0);
        let genesis_hash = crate::domain::header_hash(&genesis);
        let mut chain = MapChainView::new_with_genesis(genesis);
        let mut prev = genesis_hash;
        let mut hashes = Vec::new();
        for i in 1..=12u32 {
            let h = header(prev, i);
            let href = chain.accept_header(&h).unwrap();
            prev = href.hash;
            hashes.push(href.hash);
        }
        let announce = find_headers_to_announce(&chain, &genesis_hash, &prev).unwrap();
        assert_eq!(announce.len(), MAX_BLOCKS_TO_ANNOUNCE);
        assert_eq!(announce, &hashes[hashes.len() - MAX_BLOCKS_TO_ANNOUNCE..]);
    }

    #[test]
    fn find_headers_to_announce_none_on_disconnected_tips() {
        let genesis = header(NULL_HASH, 0);
        let chain = MapChainView::new_with_genesis(genesis);
        let unknown_old_tip = [0xFE; 32];
        let unknown_new_tip = [0xFF; 32];
        let result = find_headers_to_announce(&chain, &unknown_old_tip, &unknown_new_tip);
        assert!(result.is_none());
    }

    #[test]
    fn decide_announcement_prefers_cmpctblock_for_single_known_block() {
        let prefs = PeerAnnouncePrefs { prefers_block_form: true, prefers_headers: true, supports_compact_blocks: true };
        let hash = [9u8; 32];
        let action = decide_announcement(&prefs, &[hash], true, |_| true);
        assert!(matches!(action, AnnounceAction::CmpctBlock(h) if h == hash));
    }

    #[test]
    fn decide_announcement_falls_back_to_inv_on_reorg() {
        let prefs = PeerAnnouncePrefs { prefers_block_form: true, prefers_headers: true, supports_compact_blocks: true };
        let hash = [9u8; 32];
        let action = decide_announcement(&prefs, &[hash], false, |_| true);
        assert!(matches!(action, AnnounceAction::Inv(h) if h == hash));
    }

    #[test]
    fn decide_announcement_uses_headers_for_multi_block_lists() {
        let prefs = PeerAnnouncePrefs { prefers_block_form: true, prefers_headers: true, supports_compact_blocks: true };
        let hashes = vec![[1u8; 32], [2u8; 32]];
        let action = decide_announcement(&prefs, &hashes, true, |_| true);
        assert!(matches!(action, AnnounceAction::Headers(h) if h == hashes));
    }
}
