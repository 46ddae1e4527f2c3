//! Node orchestration: the single place that owns peer state, in-flight
//! bookkeeping, the mempool, chain view, and the block-reconstruction
//! registry, and wires the pure `network::*` decision functions together
//! into a coherent control/data flow.
//!
//! Mutable state lives behind one lock, except the reconstruction
//! registry, which gets its own lock so `Worker`'s `Drop` can call back
//! into it (via `Weak<dyn RegistryHandle>`) without re-entering the
//! peer/chain lock.

pub mod mempool;
pub mod sync;

use crate::config::RelayConfig;
use crate::domain::{Block, BlockHeader, ChainView, Hash, Transaction};
use crate::network::announce::{self, AnnounceAction, AnnounceContext, PeerAnnouncePrefs, Strategy};
use crate::network::compact_blocks::{self, CompactBlock, XThinBlock};
use crate::network::errors::ProtocolError;
use crate::network::in_flight::InFlightIndex;
use crate::network::mempool_index::MempoolIndex;
use crate::network::peer_state::PeerState;
use crate::network::peer_worker::{BlockRequest, RegistryHandle, ThinCapability, Worker};
use crate::network::protocol::{
    BlockMessage, BlockTxnMessage, CompactBlockMessage, GetBlockTxnMessage, GetDataMessage,
    GetHeadersMessage, HeadersMessage, InvMessage, InventoryItem, ProtocolMessage, RejectMessage,
    SendCmpctMessage, XBlockTxMessage, MSG_BLOCK, MSG_CMPCT_BLOCK, MSG_XTHINBLOCK,
};
use crate::network::reconstruction::{AddTxOutcome, ReconstructionManager, StubOutcome};
use crate::network::short_id::SaltKeys;
use crate::network::thin_block_builder::TxFinder;
use crate::network::thin_tx::{self, ThinTx};
use crate::node::mempool::MempoolManager;
use crate::node::sync::SyncCoordinator;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// An effect the caller (`network::NetworkManager`) must carry out: send a
/// message to a specific peer, or drop the connection.
pub enum PeerAction {
    SendTo(String, ProtocolMessage),
    Disconnect(String),
}

/// How many recently-completed blocks to keep around, keyed by hash, so
/// re-announcements can re-encode a `cmpctblock` and `headers` replies can
/// carry real `BlockHeader`s rather than just the `HeaderRef` a `ChainView`
/// hands back.
const RECENT_BLOCKS_CAP: usize = 32;

struct Inner<C: ChainView> {
    chain: C,
    peers: HashMap<String, PeerState>,
    in_flight: InFlightIndex,
    mempool: MempoolManager,
    sync: SyncCoordinator,
    recent_blocks: HashMap<Hash, Block>,
    recent_block_order: VecDeque<Hash>,
    /// Headers seen via `on_headers`/completed blocks, kept so inbound
    /// `getheaders` requests can be answered with real `BlockHeader` bodies
    /// rather than just the `HeaderRef` a `ChainView` hands back.
    headers: HashMap<Hash, BlockHeader>,
}

impl<C: ChainView> Inner<C> {
    fn remember_block(&mut self, hash: Hash, block: Block) {
        if self.recent_blocks.insert(hash, block).is_none() {
            self.recent_block_order.push_back(hash);
            if self.recent_block_order.len() > RECENT_BLOCKS_CAP {
                if let Some(oldest) = self.recent_block_order.pop_front() {
                    self.recent_blocks.remove(&oldest);
                }
            }
        }
    }
}

/// Resolves wanted transactions against the local mempool: short-ID wanted
/// entries go through a per-salt `MempoolIndex`, cheap-hash entries
/// (xthin) scan mempool contents directly, full-hash entries are a plain
/// lookup.
struct MempoolFinder<'a> {
    mempool: &'a MempoolManager,
    index: Option<MempoolIndex>,
}

impl<'a> MempoolFinder<'a> {
    fn for_compact(mempool: &'a MempoolManager, keys: SaltKeys) -> Self {
        let index = MempoolIndex::build(keys, mempool.transaction_hashes().iter());
        MempoolFinder { mempool, index: Some(index) }
    }

    fn for_xthin(mempool: &'a MempoolManager) -> Self {
        MempoolFinder { mempool, index: None }
    }
}

impl<'a> TxFinder for MempoolFinder<'a> {
    fn find(&self, wanted: &ThinTx) -> Option<Transaction> {
        if let (Some(id), Some(index)) = (wanted.short_id(), &self.index) {
            if let Some(hash) = index.lookup(id, &|h| self.mempool.contains(h)) {
                return self.mempool.get_transaction(&hash);
            }
        }
        if let Some(full) = wanted.full() {
            if let Some(tx) = self.mempool.get_transaction(&full) {
                return Some(tx);
            }
        }
        if let Some(cheap) = wanted.cheap() {
            for hash in self.mempool.transaction_hashes() {
                if thin_tx::cheap_hash(&hash) == cheap {
                    if let Some(tx) = self.mempool.get_transaction(&hash) {
                        return Some(tx);
                    }
                }
            }
        }
        None
    }
}

pub struct NodeState<C: ChainView + Send + 'static> {
    config: RelayConfig,
    reconstruction: Arc<Mutex<ReconstructionManager>>,
    inner: Mutex<Inner<C>>,
}

impl<C: ChainView + Send + 'static> NodeState<C> {
    pub fn new(config: RelayConfig, chain: C) -> Self {
        let genesis = chain.tip().hash;
        NodeState {
            config,
            reconstruction: Arc::new(Mutex::new(ReconstructionManager::new())),
            inner: Mutex::new(Inner {
                chain,
                peers: HashMap::new(),
                in_flight: InFlightIndex::new(),
                mempool: MempoolManager::new(),
                sync: SyncCoordinator::new(genesis),
                recent_blocks: HashMap::new(),
                recent_block_order: VecDeque::new(),
                headers: HashMap::new(),
            }),
        }
    }

    fn registry_handle(&self) -> Weak<dyn RegistryHandle> {
        Arc::downgrade(&self.reconstruction) as Weak<dyn RegistryHandle>
    }

    pub fn add_peer(&self, peer_id: impl Into<String>) {
        let peer_id = peer_id.into();
        let mut inner = self.inner.lock().unwrap();
        inner.peers.entry(peer_id.clone()).or_insert_with(|| PeerState::new(peer_id));
    }

    /// Drops a disconnected peer. Its `Worker` (if any) is dropped with it,
    /// which unwinds its reconstruction registrations via `Drop` without
    /// needing this lock held.
    pub fn remove_peer(&self, peer_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.erase_peer(peer_id);
        inner.peers.remove(peer_id);
    }

    pub fn set_peer_prefs(&self, peer_id: &str, prefers_headers: bool, supports_compact_blocks: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.prefers_headers = prefers_headers;
            peer.supports_compact_blocks = supports_compact_blocks;
            if supports_compact_blocks {
                peer.bump_thin_capability(ThinCapability::Compact);
            }
        }
    }

    /// Records real thin-fetch capability for a peer (from a version
    /// handshake or other out-of-band negotiation upstream of this crate's
    /// wire protocol). `begin_block_fetch` reads this to pick which
    /// `Worker` variant to build; it never downgrades an already-observed
    /// stronger capability.
    pub fn set_peer_capability(&self, peer_id: &str, capability: ThinCapability) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.bump_thin_capability(capability);
        }
    }

    fn misbehave(peers: &mut HashMap<String, PeerState>, peer_id: &str, weight: i32, threshold: i32) -> bool {
        peers.get_mut(peer_id).map_or(false, |p| p.misbehave(weight, threshold))
    }

    /// `getheaders`/`headers` intake: validates the batch,
    /// arms locator catch-up, and fetches any directly-reachable blocks.
    pub fn on_headers(&self, peer_id: &str, headers: Vec<BlockHeader>, peer_sent_max: bool) -> Vec<PeerAction> {
        let mut actions = Vec::new();
        let mut inner = self.inner.lock().unwrap();

        // A short, non-maxed batch looks like an unsolicited announcement;
        // a full-size batch is catch-up and carries no direct-fetch intent
        // until the follow-up locator response comes back empty.
        let maybe_announcement = !peer_sent_max;
        let result = match inner.sync.process_headers(
            &mut inner.chain,
            &headers,
            peer_sent_max,
            maybe_announcement,
            |h| inner.in_flight.is_in_flight(h),
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!(%peer_id, error = %e, "header batch rejected");
                return actions;
            }
        };

        if let Some(weight) = result.misbehavior {
            if Self::misbehave(&mut inner.peers, peer_id, weight, self.config.ban_threshold) {
                actions.push(PeerAction::Disconnect(peer_id.to_string()));
                return actions;
            }
        }
        if result.rejected {
            return actions;
        }

        for header in &headers {
            inner.headers.insert(crate::domain::header_hash(header), header.clone());
        }

        if let Some(peer) = inner.peers.get_mut(peer_id) {
            if let Some(last) = result.accepted.last() {
                peer.update_best_from_last(Some(last.clone()));
            }
            peer.unconnecting_headers = if result.unconnecting { peer.unconnecting_headers + 1 } else { 0 };
        }

        if result.send_locator {
            actions.push(PeerAction::SendTo(
                peer_id.to_string(),
                ProtocolMessage::GetHeaders(GetHeadersMessage {
                    version: 1,
                    block_locator_hashes: inner.chain.locator_hashes(),
                    hash_stop: crate::domain::NULL_HASH,
                }),
            ));
        }

        for hash in result.to_fetch {
            actions.extend(self.begin_block_fetch(&mut inner, peer_id, hash));
        }

        actions.extend(self.announce_tip_if_moved(&mut inner));
        actions
    }

    /// `inv` carrying a block we don't have: decide whether and
    /// how to fetch it from the announcing peer.
    pub fn on_block_inv(&self, peer_id: &str, hash: Hash) -> Vec<PeerAction> {
        let mut inner = self.inner.lock().unwrap();
        if inner.chain.contains_block(&hash) || inner.in_flight.is_in_flight(&hash) {
            return Vec::new();
        }
        self.begin_block_fetch(&mut inner, peer_id, hash)
    }

    fn begin_block_fetch(&self, inner: &mut Inner<C>, peer_id: &str, hash: Hash) -> Vec<PeerAction> {
        let capability = inner.peers.get(peer_id).map_or(ThinCapability::None, |p| p.thin_capability);
        let peer_supports_thin = capability != ThinCapability::None;
        let peer_blocks_in_flight = inner.in_flight.peer_in_flight_count(peer_id);
        let ctx = AnnounceContext {
            tip_time: now_secs(),
            have_block_data: inner.chain.contains_block(&hash),
            peer_supports_thin,
            thin_enabled: self.config.thin_parallel_max > 0,
            workers_for_hash: self.reconstruction.lock().unwrap().worker_count(&hash) as u32,
            thin_max_parallel: self.config.thin_parallel_max,
            already_in_flight: inner.in_flight.is_in_flight(&hash),
            peer_blocks_in_flight,
            avoid_full_blocks: false,
        };

        let mut actions = Vec::new();
        match announce::pick_strategy(&ctx) {
            Strategy::DontDownload => {}
            Strategy::DownloadThinNow => {
                // Reuse the peer's already-assigned worker if one exists
                // (e.g. left over from a prior fetch) rather than
                // manufacturing a fresh one of possibly the wrong variant.
                let worker = inner
                    .peers
                    .get(peer_id)
                    .and_then(|p| p.thinblock.clone())
                    .unwrap_or_else(|| Arc::new(Worker::new_for_capability(capability, peer_id.to_string(), self.registry_handle())));
                let request = worker.request_block(hash, None);
                if let Some(peer) = inner.peers.get_mut(peer_id) {
                    peer.thinblock = Some(worker);
                    peer.blocks_in_flight += 1;
                }
                inner.in_flight.insert(peer_id.to_string(), hash, self.config.stalling_timeout, true);
                actions.push(PeerAction::SendTo(peer_id.to_string(), block_request_message(request)));
            }
            Strategy::DownloadFullNow => {
                inner.in_flight.insert(peer_id.to_string(), hash, self.config.stalling_timeout, true);
                actions.push(PeerAction::SendTo(
                    peer_id.to_string(),
                    ProtocolMessage::GetData(GetDataMessage { inventory: vec![InventoryItem::block(hash)] }),
                ));
            }
        }
        actions
    }

    /// `block` intake: the full-block counterpart of a completed
    /// compact/xthin reconstruction, answering the `getdata(MSG_BLOCK)`
    /// `DOWNL_FULL_NOW` sends (`begin_block_fetch`). Only
    /// accepted while actually in flight, so an unsolicited push can't be
    /// used to plant a bogus `recent_blocks` entry; the Merkle root is
    /// still checked even though no short-ID reconstruction was involved,
    /// since nothing upstream of this has validated the transactions
    /// against the header.
    pub fn on_block(&self, peer_id: &str, block: Block) -> Vec<PeerAction> {
        let hash = crate::domain::header_hash(&block.header);
        let mut inner = self.inner.lock().unwrap();
        if !inner.in_flight.is_in_flight(&hash) {
            debug!(%peer_id, block_hash = %hex::encode(hash), "unsolicited full block, ignoring");
            return Vec::new();
        }
        let root = crate::domain::merkle_root(&block.transactions);
        if root != block.header.merkle_root {
            inner.in_flight.erase(peer_id, &hash);
            return self.reject(&mut inner, peer_id, hash, &ProtocolError::MerkleMismatch, "block");
        }
        self.complete_block(&mut inner, hash, block, vec![peer_id.to_string()])
    }

    /// `cmpctblock` intake.
    pub fn on_compact_block(&self, peer_id: &str, cb: CompactBlock) -> Vec<PeerAction> {
        let hash = crate::domain::header_hash(&cb.header);
        let mut inner = self.inner.lock().unwrap();

        let stub = match Worker::build_stub_from_compact(&cb, self.config.max_protocol_message_length) {
            Ok(s) => s,
            Err(e) => return self.reject(&mut inner, peer_id, hash, &e, "cmpctblock"),
        };

        let worker = inner
            .peers
            .get(peer_id)
            .and_then(|p| p.thinblock.clone())
            .unwrap_or_else(|| Arc::new(Worker::new_compact(peer_id.to_string(), self.registry_handle())));
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.thinblock = Some(worker.clone());
        }

        let finder = MempoolFinder::for_compact(&inner.mempool, cb.salt_keys());
        let outcome = {
            let mut reg = self.reconstruction.lock().unwrap();
            reg.build_stub(hash, stub, &finder, peer_id.to_string(), Arc::downgrade(&worker))
        };

        match outcome {
            Ok(outcome) => self.handle_stub_outcome(&mut inner, peer_id, hash, outcome),
            Err(e) => self.reject(&mut inner, peer_id, hash, &e, "cmpctblock"),
        }
    }

    /// `xthinblock` intake, same shape as `cmpctblock` but keyed on cheap
    /// hashes instead of salted short-IDs.
    pub fn on_xthin_block(&self, peer_id: &str, xb: XThinBlock) -> Vec<PeerAction> {
        let hash = crate::domain::header_hash(&xb.header);
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.bump_thin_capability(ThinCapability::XThin);
        }

        let stub = match Worker::build_stub_from_xthin(&xb) {
            Ok(s) => s,
            Err(e) => return self.reject(&mut inner, peer_id, hash, &e, "xthinblock"),
        };

        let worker = inner
            .peers
            .get(peer_id)
            .and_then(|p| p.thinblock.clone())
            .unwrap_or_else(|| Arc::new(Worker::new_xthin(peer_id.to_string(), self.registry_handle())));
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.thinblock = Some(worker.clone());
        }

        let finder = MempoolFinder::for_xthin(&inner.mempool);
        let outcome = {
            let mut reg = self.reconstruction.lock().unwrap();
            reg.build_stub(hash, stub, &finder, peer_id.to_string(), Arc::downgrade(&worker))
        };

        match outcome {
            Ok(outcome) => self.handle_stub_outcome(&mut inner, peer_id, hash, outcome),
            Err(e) => self.reject(&mut inner, peer_id, hash, &e, "xthinblock"),
        }
    }

    fn handle_stub_outcome(&self, inner: &mut Inner<C>, peer_id: &str, hash: Hash, outcome: StubOutcome) -> Vec<PeerAction> {
        match outcome {
            StubOutcome::Completed { block, worker_peer_ids } => {
                self.complete_block(inner, hash, block, worker_peer_ids)
            }
            StubOutcome::Pending => {
                let missing = self.reconstruction.lock().unwrap().missing(&hash).unwrap_or_default();
                if missing.is_empty() {
                    return Vec::new();
                }
                let worker = inner.peers.get(peer_id).and_then(|p| p.thinblock.clone());
                if worker.as_ref().is_some_and(|w| w.is_rerequesting(&hash)) {
                    // Already waiting on a getblocktxn/get_xblocktx for this
                    // hash; don't send a second one on every Pending tick.
                    return Vec::new();
                }
                let indices: Vec<u16> = missing.iter().map(|(i, _)| *i as u16).collect();
                inner.in_flight.insert(peer_id.to_string(), hash, self.config.stalling_timeout, true);
                if let Some(worker) = &worker {
                    worker.set_rerequesting(hash, true);
                }
                vec![PeerAction::SendTo(
                    peer_id.to_string(),
                    ProtocolMessage::GetBlockTxn(GetBlockTxnMessage { block_hash: hash, indices }),
                )]
            }
        }
    }

    /// `blocktxn` intake: fills the indices we asked for via `getblocktxn`.
    pub fn on_block_txn(&self, peer_id: &str, msg: BlockTxnMessage) -> Vec<PeerAction> {
        self.feed_reconstruction(peer_id, msg.block_hash, msg.transactions)
    }

    /// `xblocktx` intake: fills cheap-hash-identified slots for an xthin
    /// reconstruction in progress.
    pub fn on_xblock_tx(&self, peer_id: &str, msg: XBlockTxMessage) -> Vec<PeerAction> {
        self.feed_reconstruction(peer_id, msg.block_hash, msg.transactions)
    }

    fn feed_reconstruction(&self, peer_id: &str, hash: Hash, transactions: Vec<Transaction>) -> Vec<PeerAction> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(worker) = inner.peers.get(peer_id).and_then(|p| p.thinblock.clone()) {
            worker.set_rerequesting(hash, false);
        }
        let mut completed = None;
        for tx in transactions {
            let outcome = {
                let mut reg = self.reconstruction.lock().unwrap();
                reg.add_tx(hash, tx)
            };
            match outcome {
                Ok(AddTxOutcome::Added { completed: Some((block, ids)) }) => {
                    completed = Some((block, ids));
                    break;
                }
                Ok(_) => {}
                Err(e) => return self.reject(&mut inner, peer_id, hash, &e, "blocktxn"),
            }
        }
        match completed {
            Some((block, worker_peer_ids)) => self.complete_block(&mut inner, hash, block, worker_peer_ids),
            None => Vec::new(),
        }
    }

    fn complete_block(&self, inner: &mut Inner<C>, hash: Hash, block: Block, worker_peer_ids: Vec<String>) -> Vec<PeerAction> {
        info!(block_hash = %hex::encode(hash), tx_count = block.transactions.len(), "reconstructed block");
        for tx in &block.transactions {
            inner.mempool.remove_transaction(&crate::domain::txid(tx));
        }
        for peer_id in &worker_peer_ids {
            inner.in_flight.erase(peer_id, &hash);
            if let Some(peer) = inner.peers.get_mut(peer_id) {
                peer.thinblock = None;
                peer.blocks_in_flight = peer.blocks_in_flight.saturating_sub(1);
            }
        }
        if let Err(e) = inner.chain.accept_header(&block.header) {
            warn!(error = %e, "completed block's header failed to land in chain view");
        }
        inner.headers.insert(hash, block.header.clone());
        inner.remember_block(hash, block);
        self.announce_tip_if_moved(inner)
    }

    /// `getheaders` intake: answers with up to `max_headers_results` headers
    /// starting just after the first locator hash we recognise, walking
    /// forward to `hash_stop` or the current tip, capped at 2000 headers.
    pub fn on_get_headers(&self, peer_id: &str, locator: Vec<Hash>, hash_stop: Hash) -> Vec<PeerAction> {
        let inner = self.inner.lock().unwrap();
        let start = locator
            .iter()
            .find(|h| inner.chain.contains_block(h))
            .copied()
            .unwrap_or(crate::domain::NULL_HASH);
        let tip = inner.chain.tip().hash;
        let Some(path) = inner.chain.path_between(&tip, &start) else {
            debug!(%peer_id, "getheaders locator shares no ancestor with the active chain");
            return Vec::new();
        };
        let headers: Vec<BlockHeader> = path
            .into_iter()
            .skip(1) // exclude `start` itself, which the peer already has
            .take_while(|h| *h != hash_stop || hash_stop == crate::domain::NULL_HASH)
            .filter_map(|h| inner.headers.get(&h).cloned())
            .take(self.config.max_headers_results as usize)
            .collect();
        if headers.is_empty() {
            return Vec::new();
        }
        vec![PeerAction::SendTo(peer_id.to_string(), ProtocolMessage::Headers(HeadersMessage { headers }))]
    }

    /// `getdata` intake: the responder side of `DOWNL_FULL_NOW`'s
    /// `getdata(MSG_BLOCK)` (`begin_block_fetch`) and of any
    /// peer re-requesting a compact/xthin encoding directly rather than
    /// waiting on an unsolicited announcement. Only
    /// serves bodies this node actually holds, i.e. recently-completed
    /// blocks; anything else is silently dropped, same as an unknown
    /// `getblocktxn`/`getxblocktx` target.
    pub fn on_get_data(&self, peer_id: &str, inventory: Vec<InventoryItem>) -> Vec<PeerAction> {
        let inner = self.inner.lock().unwrap();
        let mut actions = Vec::new();
        for item in inventory {
            let Some(block) = inner.recent_blocks.get(&item.hash) else {
                debug!(%peer_id, block_hash = %hex::encode(item.hash), "getdata for unknown block");
                continue;
            };
            let message = match item.inv_type {
                MSG_BLOCK => ProtocolMessage::Block(BlockMessage { block: block.clone() }),
                MSG_CMPCT_BLOCK => {
                    let nonce = rand::random::<u64>();
                    match compact_blocks::encode_compact_block(block, nonce) {
                        Ok(cb) => ProtocolMessage::CmpctBlock(CompactBlockMessage { compact_block: cb }),
                        Err(e) => {
                            warn!(%peer_id, error = %e, "failed to encode compact block for getdata");
                            continue;
                        }
                    }
                }
                MSG_XTHINBLOCK => {
                    match compact_blocks::encode_xthin_block(block, |h| inner.mempool.contains(h)) {
                        Ok(xb) => ProtocolMessage::XThinBlock(crate::network::protocol::XThinBlockMessage { xthin_block: xb }),
                        Err(e) => {
                            warn!(%peer_id, error = %e, "failed to encode xthin block for getdata, falling back to full block");
                            ProtocolMessage::Block(BlockMessage { block: block.clone() })
                        }
                    }
                }
                other => {
                    debug!(%peer_id, inv_type = other, "getdata inventory type outside block-propagation scope");
                    continue;
                }
            };
            actions.push(PeerAction::SendTo(peer_id.to_string(), message));
        }
        actions
    }

    /// `getblocktxn` intake: we're the announcer a peer's `cmpctblock`
    /// reconstruction came up short against, so answer from whichever
    /// recently-completed block it's asking about (the fetch side of this
    /// exchange is `handle_stub_outcome`).
    pub fn on_get_block_txn(&self, peer_id: &str, block_hash: Hash, indices: Vec<u16>) -> Vec<PeerAction> {
        let inner = self.inner.lock().unwrap();
        let Some(block) = inner.recent_blocks.get(&block_hash) else {
            debug!(%peer_id, block_hash = %hex::encode(block_hash), "getblocktxn for unknown block");
            return Vec::new();
        };
        let transactions: Vec<Transaction> =
            indices.iter().filter_map(|&i| block.transactions.get(i as usize).cloned()).collect();
        if transactions.is_empty() {
            return Vec::new();
        }
        vec![PeerAction::SendTo(
            peer_id.to_string(),
            ProtocolMessage::BlockTxn(BlockTxnMessage { block_hash, transactions }),
        )]
    }

    /// `getxblocktx` intake: the xthin counterpart of `on_get_block_txn`,
    /// keyed on cheap hashes instead of absolute indices.
    pub fn on_get_xblock_tx(&self, peer_id: &str, block_hash: Hash, cheap_hashes: Vec<u64>) -> Vec<PeerAction> {
        let inner = self.inner.lock().unwrap();
        let Some(block) = inner.recent_blocks.get(&block_hash) else {
            debug!(%peer_id, block_hash = %hex::encode(block_hash), "getxblocktx for unknown block");
            return Vec::new();
        };
        let wanted: std::collections::HashSet<u64> = cheap_hashes.into_iter().collect();
        let transactions: Vec<Transaction> = block
            .transactions
            .iter()
            .filter(|tx| wanted.contains(&thin_tx::cheap_hash(&crate::domain::txid(tx))))
            .cloned()
            .collect();
        if transactions.is_empty() {
            return Vec::new();
        }
        vec![PeerAction::SendTo(
            peer_id.to_string(),
            ProtocolMessage::XBlockTx(XBlockTxMessage { block_hash, transactions }),
        )]
    }

    /// `get_xthin` intake: serving the body is out of scope here (this
    /// node only holds bodies for blocks it just reconstructed, covered by
    /// `on_get_data`'s `MSG_XTHINBLOCK` arm), but the request itself is
    /// evidence the peer's node understands the xthin protocol, so it
    /// raises that peer's fetch capability for future `begin_block_fetch`
    /// calls against it.
    pub fn on_get_xthin(&self, peer_id: &str) -> Vec<PeerAction> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.bump_thin_capability(ThinCapability::XThin);
        }
        Vec::new()
    }

    /// `sendcmpct` intake: records the peer's
    /// compact-block support and, for the high-bandwidth variant
    /// (`prefer_cmpct` non-zero), registers it as an unsolicited-announcement
    /// handle. Registration is capped at `MAX_ANNOUNCER_HANDLES`; the peer
    /// evicted to make room gets downgraded back to low-bandwidth so it
    /// falls back to `headers`/`inv`.
    pub fn on_send_cmpct(&self, peer_id: &str, msg: SendCmpctMessage) -> Vec<PeerAction> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(peer) = inner.peers.get_mut(peer_id) {
            peer.supports_compact_blocks = true;
            peer.prefers_blocks = msg.prefers_compact();
            peer.bump_thin_capability(ThinCapability::Compact);
        }
        if !msg.prefers_compact() {
            return Vec::new();
        }
        let evicted = self.reconstruction.lock().unwrap().note_announcer(peer_id.to_string());
        match evicted {
            Some(evicted_id) if evicted_id != peer_id => {
                vec![PeerAction::SendTo(evicted_id, ProtocolMessage::SendCmpct(SendCmpctMessage::new(false)))]
            }
            _ => Vec::new(),
        }
    }

    /// A standalone `tx` relay: stash it in the mempool for future thin
    /// block reconstructions. Does not target any particular builder —
    /// only the mempool snapshot, not in-flight requests, feeds slots
    /// after a stub already exists.
    pub fn on_tx(&self, tx: Transaction) {
        let mut inner = self.inner.lock().unwrap();
        inner.mempool.add_transaction(tx);
    }

    /// Disconnects peers whose queued block download has stalled past
    /// `RelayConfig::stalling_timeout`.
    pub fn check_stalls(&self, now: Instant) -> Vec<PeerAction> {
        let mut inner = self.inner.lock().unwrap();
        let stalled = inner.in_flight.stalled(now);
        let mut actions = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for queued in stalled {
            if !seen.insert(queued.peer_id.clone()) {
                continue;
            }
            warn!(peer_id = %queued.peer_id, block_hash = %hex::encode(queued.block_hash), "block download stalled");
            inner.in_flight.erase_peer(&queued.peer_id);
            inner.peers.remove(&queued.peer_id);
            actions.push(PeerAction::Disconnect(queued.peer_id));
        }
        actions
    }

    /// Re-announces a moved tip to every connected peer per its own
    /// preferences. Called with `inner`'s lock already held.
    fn announce_tip_if_moved(&self, inner: &mut Inner<C>) -> Vec<PeerAction> {
        let Some(blocks) = inner.sync.headers_to_announce(&inner.chain) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        let peer_ids: Vec<String> = inner.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            let Some(peer) = inner.peers.get(&peer_id) else { continue };
            let prefs = PeerAnnouncePrefs {
                prefers_block_form: peer.prefers_blocks,
                prefers_headers: peer.prefers_headers,
                supports_compact_blocks: peer.supports_compact_blocks,
            };
            let action = announce::decide_announcement(&prefs, &blocks, true, |h| inner.recent_blocks.contains_key(h));
            actions.push(PeerAction::SendTo(peer_id.clone(), self.render_announcement(inner, action)));
        }
        actions
    }

    fn render_announcement(&self, inner: &Inner<C>, action: AnnounceAction) -> ProtocolMessage {
        match action {
            AnnounceAction::CmpctBlock(hash) => {
                if let Some(block) = inner.recent_blocks.get(&hash) {
                    let nonce = rand::random::<u64>();
                    if let Ok(cb) = compact_blocks::encode_compact_block(block, nonce) {
                        return ProtocolMessage::CmpctBlock(CompactBlockMessage { compact_block: cb });
                    }
                }
                ProtocolMessage::Inv(InvMessage { inventory: vec![InventoryItem::block(hash)] })
            }
            AnnounceAction::FullBlock(hash) => {
                if let Some(block) = inner.recent_blocks.get(&hash) {
                    return ProtocolMessage::Block(BlockMessage { block: block.clone() });
                }
                ProtocolMessage::Inv(InvMessage { inventory: vec![InventoryItem::block(hash)] })
            }
            AnnounceAction::Inv(hash) => {
                ProtocolMessage::Inv(InvMessage { inventory: vec![InventoryItem::block(hash)] })
            }
            AnnounceAction::Headers(hashes) => {
                let headers: Vec<BlockHeader> =
                    hashes.iter().filter_map(|h| inner.recent_blocks.get(h).map(|b| b.header.clone())).collect();
                if headers.len() == hashes.len() {
                    ProtocolMessage::Headers(HeadersMessage { headers })
                } else {
                    // Don't have every header's body cached (e.g. caught up via
                    // someone else's relay); inv lets the peer getdata what it lacks.
                    let tip = *hashes.last().unwrap_or(&crate::domain::NULL_HASH);
                    ProtocolMessage::Inv(InvMessage { inventory: vec![InventoryItem::block(tip)] })
                }
            }
        }
    }

    /// Tears down a block whose stubs disagreed (`ReconstructionMismatch`:
    /// abort the block, drop its workers). Drops the registry's builder
    /// and worker set for `hash`, then, for every peer that was registered
    /// against it, stops that peer's worker and clears its in-flight/
    /// blocks-in-flight bookkeeping so the hash can be freely re-announced
    /// and re-fetched, without disconnecting either peer or corrupting
    /// shared state.
    fn abandon_reconstruction(&self, inner: &mut Inner<C>, hash: Hash) {
        let peer_ids = self.reconstruction.lock().unwrap().remove_if_exists(hash);
        for peer_id in peer_ids {
            inner.in_flight.erase(&peer_id, &hash);
            if let Some(peer) = inner.peers.get_mut(&peer_id) {
                if let Some(worker) = peer.thinblock.take() {
                    worker.stop_work(hash);
                }
                peer.blocks_in_flight = peer.blocks_in_flight.saturating_sub(1);
            }
        }
    }

    fn reject(&self, inner: &mut Inner<C>, peer_id: &str, hash: Hash, err: &ProtocolError, command: &str) -> Vec<PeerAction> {
        if matches!(err, ProtocolError::ReconstructionMismatch(_)) {
            self.abandon_reconstruction(inner, hash);
        }
        let mut actions = Vec::new();
        if let Some(weight) = err.misbehavior_weight() {
            if Self::misbehave(&mut inner.peers, peer_id, weight, self.config.ban_threshold) {
                actions.push(PeerAction::Disconnect(peer_id.to_string()));
                return actions;
            }
        }
        if err.should_reject() {
            actions.push(PeerAction::SendTo(
                peer_id.to_string(),
                ProtocolMessage::Reject(RejectMessage::new(command, 0x10, &err.to_string(), None)),
            ));
        }
        debug!(%peer_id, %err, "protocol error handling {command}");
        actions
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn block_request_message(request: BlockRequest) -> ProtocolMessage {
    match request {
        BlockRequest::GetData(item) => ProtocolMessage::GetData(GetDataMessage { inventory: vec![item] }),
        BlockRequest::XThin(msg) => ProtocolMessage::GetXThin(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MapChainView, NULL_HASH};

    fn genesis_header() -> BlockHeader {
        BlockHeader { version: 1, prev_block_hash: NULL_HASH, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce: 0 }
    }

    fn node() -> NodeState<MapChainView> {
        let chain = MapChainView::new_with_genesis(genesis_header());
        NodeState::new(RelayConfig::default(), chain)
    }

    #[test]
    fn on_headers_requests_locator_for_unconnecting_batch() {
        let node = node();
        node.add_peer("peer-1");
        let bad = BlockHeader { version: 1, prev_block_hash: [0xAA; 32], merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce: 1 };
        let actions = node.on_headers("peer-1", vec![bad], false);
        assert!(actions.iter().any(|a| matches!(a, PeerAction::SendTo(_, ProtocolMessage::GetHeaders(_)))));
    }

    #[test]
    fn on_headers_fetches_directly_reachable_blocks() {
        let node = node();
        node.add_peer("peer-1");
        let genesis_hash = crate::domain::header_hash(&genesis_header());
        let h1 = BlockHeader { version: 1, prev_block_hash: genesis_hash, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce: 1 };
        let actions = node.on_headers("peer-1", vec![h1], false);
        assert!(actions.iter().any(|a| matches!(a, PeerAction::SendTo(_, ProtocolMessage::GetData(_)))));
    }

    #[test]
    fn remove_peer_clears_peer_state() {
        let node = node();
        node.add_peer("peer-1");
        let genesis_hash = crate::domain::header_hash(&genesis_header());
        let h1 = BlockHeader { version: 1, prev_block_hash: genesis_hash, merkle_root: NULL_HASH, timestamp: 0, bits: 0, nonce: 1 };
        node.on_headers("peer-1", vec![h1], false);
        node.remove_peer("peer-1");
        let inner = node.inner.lock().unwrap();
        assert_eq!(inner.peers.len(), 0);
    }

    #[test]
    fn begin_block_fetch_selects_xthin_worker_for_xthin_capable_peer() {
        let node = node();
        node.add_peer("peer-1");
        node.set_peer_capability("peer-1", ThinCapability::XThin);
        let hash = [7u8; 32];
        node.on_block_inv("peer-1", hash);
        let inner = node.inner.lock().unwrap();
        let worker = inner.peers.get("peer-1").unwrap().thinblock.as_ref().expect("worker assigned");
        assert!(matches!(**worker, Worker::XThin(_)));
    }

    #[test]
    fn begin_block_fetch_selects_compact_worker_for_compact_capable_peer() {
        let node = node();
        node.add_peer("peer-1");
        node.set_peer_prefs("peer-1", false, true);
        let hash = [8u8; 32];
        node.on_block_inv("peer-1", hash);
        let inner = node.inner.lock().unwrap();
        let worker = inner.peers.get("peer-1").unwrap().thinblock.as_ref().expect("worker assigned");
        assert!(matches!(**worker, Worker::Compact(_)));
    }

    #[test]
    fn begin_block_fetch_falls_back_to_full_block_without_capability() {
        let node = node();
        node.add_peer("peer-1");
        let hash = [9u8; 32];
        let actions = node.on_block_inv("peer-1", hash);
        assert!(actions.iter().any(|a| matches!(a, PeerAction::SendTo(_, ProtocolMessage::GetData(_)))));
        let inner = node.inner.lock().unwrap();
        assert!(inner.peers.get("peer-1").unwrap().thinblock.is_none());
    }

    #[test]
    fn begin_block_fetch_reuses_existing_worker_instead_of_replacing_it() {
        let node = node();
        node.add_peer("peer-1");
        node.set_peer_capability("peer-1", ThinCapability::XThin);
        let hash_a = [1u8; 32];
        node.on_block_inv("peer-1", hash_a);
        let worker_ptr = {
            let inner = node.inner.lock().unwrap();
            Arc::as_ptr(inner.peers.get("peer-1").unwrap().thinblock.as_ref().unwrap())
        };
        // A second, unrelated block announced by the same peer while the
        // first is still in flight should reuse the same worker object
        // rather than manufacturing a second one.
        node.set_peer_capability("peer-1", ThinCapability::Compact); // no-op, already XThin
        let hash_b = [2u8; 32];
        node.on_block_inv("peer-1", hash_b);
        let inner = node.inner.lock().unwrap();
        let reused_ptr = Arc::as_ptr(inner.peers.get("peer-1").unwrap().thinblock.as_ref().unwrap());
        assert_eq!(worker_ptr, reused_ptr);
    }

    #[test]
    fn handle_stub_outcome_suppresses_duplicate_rerequest() {
        let node = node();
        node.add_peer("peer-1");
        let hash = [3u8; 32];
        let worker = Arc::new(Worker::new_compact("peer-1".to_string(), node.registry_handle()));
        {
            let mut inner = node.inner.lock().unwrap();
            inner.peers.get_mut("peer-1").unwrap().thinblock = Some(worker.clone());
        }

        // Register a builder with one still-missing slot so `missing(&hash)`
        // comes back non-empty, then pre-mark the worker as already
        // re-requesting that hash.
        let header = genesis_header();
        let wanted = vec![ThinTx::from_cheap(thin_tx::cheap_hash(&[4u8; 32]))];
        let stub = crate::network::thin_block_builder::Stub { header, wanted, provided: vec![] };
        struct EmptyFinder;
        impl TxFinder for EmptyFinder {
            fn find(&self, _wanted: &ThinTx) -> Option<Transaction> {
                None
            }
        }
        {
            let mut reg = node.reconstruction.lock().unwrap();
            reg.build_stub(hash, stub, &EmptyFinder, "peer-1".to_string(), Arc::downgrade(&worker)).unwrap();
        }
        worker.set_rerequesting(hash, true);

        let mut inner = node.inner.lock().unwrap();
        let actions = node.handle_stub_outcome(&mut inner, "peer-1", hash, StubOutcome::Pending);
        assert!(actions.is_empty());
    }

    #[test]
    fn on_get_xthin_raises_peer_capability() {
        let node = node();
        node.add_peer("peer-1");
        node.on_get_xthin("peer-1");
        let inner = node.inner.lock().unwrap();
        assert_eq!(inner.peers.get("peer-1").unwrap().thin_capability, ThinCapability::XThin);
    }

    #[test]
    fn on_tx_feeds_mempool() {
        let node = node();
        let tx = Transaction {
            version: 1,
            inputs: vec![crate::domain::TxIn {
                prevout: crate::domain::OutPoint { hash: [1u8; 32], index: 0 },
                script_sig: vec![],
                sequence: 0,
            }],
            outputs: vec![crate::domain::TxOut { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        };
        node.on_tx(tx.clone());
        let inner = node.inner.lock().unwrap();
        assert!(inner.mempool.contains(&crate::domain::txid(&tx)));
    }
}
