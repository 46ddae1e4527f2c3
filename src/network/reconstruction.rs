//! `ReconstructionManager`: the cross-peer registry mapping block hash to
//! `(builder, workers)`.
//!
//! Guarantees at most one `ThinBlockBuilder` exists per block hash regardless
//! of how many peers announced it; a peer arriving after the builder already
//! exists joins its worker set via `replace_wanted_tx` instead of starting a
//! second reconstruction.

use crate::domain::{Block, Hash, Transaction};
use crate::network::errors::ProtocolError;
use crate::network::peer_worker::{RegistryHandle, Worker};
use crate::network::thin_block_builder::{AddOutcome, Stub, ThinBlockBuilder, TxFinder};
use std::collections::{HashMap, VecDeque};
use std::sync::Weak;

/// Consults a stub's own provided bodies before falling through to the
/// shared mempool-backed finder.
struct WrappedFinder<'a> {
    provided: HashMap<usize, Transaction>,
    wanted_index: HashMap<usize, crate::network::thin_tx::ThinTx>,
    inner: &'a dyn TxFinder,
}

impl<'a> TxFinder for WrappedFinder<'a> {
    fn find(&self, wanted: &crate::network::thin_tx::ThinTx) -> Option<Transaction> {
        for (idx, tx) in &self.provided {
            if self.wanted_index.get(idx) == Some(wanted) {
                return Some(tx.clone());
            }
        }
        self.inner.find(wanted)
    }
}

// `ThinTx` needs `PartialEq` for the lookup above; it already derives it.

struct ActiveBuilder {
    builder: ThinBlockBuilder,
    workers: HashMap<String, Weak<Worker>>,
}

/// Outcome of feeding a stub or a transaction into the registry.
pub enum StubOutcome {
    Completed { block: Block, worker_peer_ids: Vec<String> },
    Pending,
}

pub enum AddTxOutcome {
    Unwanted,
    Added { completed: Option<(Block, Vec<String>)> },
}

#[derive(Default)]
pub struct ReconstructionManager {
    active: HashMap<Hash, ActiveBuilder>,
    /// Up to 3 peers the manager has asked for header-style block
    /// announcements via compact-block `sendcmpct`. Front = most recently
    /// useful.
    announcers: VecDeque<String>,
}

pub const MAX_ANNOUNCER_HANDLES: usize = 3;

impl ReconstructionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_worker(&mut self, hash: Hash, peer_id: String, worker: Weak<Worker>) {
        if let Some(active) = self.active.get_mut(&hash) {
            active.workers.insert(peer_id, worker);
        }
    }

    /// Drops `peer_id`'s membership in `hash`'s worker set. Returns `true`
    /// if the active builder was dropped because it was the last worker.
    pub fn del_worker(&mut self, hash: Hash, peer_id: &str) -> bool {
        let Some(active) = self.active.get_mut(&hash) else { return false };
        active.workers.remove(peer_id);
        if active.workers.is_empty() {
            self.active.remove(&hash);
            true
        } else {
            false
        }
    }

    /// `build_stub`: creates the builder on first arrival,
    /// otherwise merges via `replace_wanted_tx` and feeds provided bodies.
    pub fn build_stub(
        &mut self,
        hash: Hash,
        stub: Stub,
        finder: &dyn TxFinder,
        peer_id: String,
        worker: Weak<Worker>,
    ) -> Result<StubOutcome, ProtocolError> {
        let wanted_index: HashMap<usize, crate::network::thin_tx::ThinTx> =
            stub.wanted.iter().cloned().enumerate().collect();
        let provided: HashMap<usize, Transaction> = stub.provided.iter().cloned().collect();
        let wrapped = WrappedFinder { provided: provided.clone(), wanted_index, inner: finder };

        if let Some(active) = self.active.get_mut(&hash) {
            // `replace_wanted_tx` may mutate some `wanted` slots via `merge`
            // before hitting a disagreeing one; on error the entry is left
            // for the caller to tear down via `remove_if_exists` rather
            // than risk leaving a half-merged builder registered.
            active.builder.replace_wanted_tx(&stub.wanted)?;
            active.workers.insert(peer_id.clone(), worker);
            for (_, tx) in provided {
                active.builder.add_transaction(tx);
            }
        } else {
            let builder = ThinBlockBuilder::new(stub.header.clone(), stub.wanted, &wrapped);
            let mut workers = HashMap::new();
            workers.insert(peer_id.clone(), worker);
            self.active.insert(hash, ActiveBuilder { builder, workers });
        }

        self.maybe_complete(hash)
    }

    /// `add_tx`: routes an arriving transaction to the builder
    /// for `hash`. Returns whether it belonged to the wanted set.
    pub fn add_tx(&mut self, hash: Hash, tx: Transaction) -> Result<AddTxOutcome, ProtocolError> {
        let Some(active) = self.active.get_mut(&hash) else {
            return Ok(AddTxOutcome::Unwanted);
        };
        match active.builder.add_transaction(tx) {
            AddOutcome::Unwanted => Ok(AddTxOutcome::Unwanted),
            AddOutcome::Duplicate => Ok(AddTxOutcome::Added { completed: None }),
            AddOutcome::Added => match self.maybe_complete(hash)? {
                StubOutcome::Completed { block, worker_peer_ids } => {
                    Ok(AddTxOutcome::Added { completed: Some((block, worker_peer_ids)) })
                }
                StubOutcome::Pending => Ok(AddTxOutcome::Added { completed: None }),
            },
        }
    }

    fn maybe_complete(&mut self, hash: Hash) -> Result<StubOutcome, ProtocolError> {
        let is_complete = self.active.get(&hash).map_or(false, |a| a.builder.is_complete());
        if !is_complete {
            return Ok(StubOutcome::Pending);
        }
        let active = self.active.remove(&hash).expect("checked is_complete above");
        let worker_peer_ids: Vec<String> = active.workers.keys().cloned().collect();
        let block = active.builder.finish()?;
        Ok(StubOutcome::Completed { block, worker_peer_ids })
    }

    /// `remove_if_exists`: aborts reconstruction for `hash`,
    /// returning the peer ids whose workers must `stop_work`.
    pub fn remove_if_exists(&mut self, hash: Hash) -> Vec<String> {
        self.active.remove(&hash).map_or(Vec::new(), |a| a.workers.into_keys().collect())
    }

    pub fn missing(&self, hash: &Hash) -> Option<Vec<(usize, crate::network::thin_tx::ThinTx)>> {
        self.active.get(hash).map(|a| a.builder.missing())
    }

    pub fn worker_count(&self, hash: &Hash) -> usize {
        self.active.get(hash).map_or(0, |a| a.workers.len())
    }

    pub fn has_builder(&self, hash: &Hash) -> bool {
        self.active.contains_key(hash)
    }

    /// Thin-block announcer rotation: rotates `peer_id` to
    /// the front if already tracked; otherwise inserts it and evicts the
    /// least-recently-useful handle past `MAX_ANNOUNCER_HANDLES`, returning
    /// the evicted peer (the caller sends it a "disable" instruction).
    pub fn note_announcer(&mut self, peer_id: String) -> Option<String> {
        if let Some(pos) = self.announcers.iter().position(|p| p == &peer_id) {
            self.announcers.remove(pos);
        }
        self.announcers.push_front(peer_id);
        if self.announcers.len() > MAX_ANNOUNCER_HANDLES {
            self.announcers.pop_back()
        } else {
            None
        }
    }
}

impl RegistryHandle for std::sync::Mutex<ReconstructionManager> {
    fn del_worker(&self, hash: Hash, peer_id: &str) {
        self.lock().unwrap().del_worker(hash, peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{self, BlockHeader, NULL_HASH, OutPoint, TxIn, TxOut};
    use crate::network::thin_tx::ThinTx;

    fn tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn { prevout: OutPoint { hash: [tag; 32], index: 0 }, script_sig: vec![], sequence: 0 }],
            outputs: vec![TxOut { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        }
    }

    fn header(root: Hash) -> BlockHeader {
        BlockHeader { version: 1, prev_block_hash: NULL_HASH, merkle_root: root, timestamp: 0, bits: 0, nonce: 0 }
    }

    struct EmptyFinder;
    impl TxFinder for EmptyFinder {
        fn find(&self, _wanted: &ThinTx) -> Option<Transaction> {
            None
        }
    }

    #[test]
    fn two_peers_announcing_same_block_share_one_builder() {
        let mut mgr = ReconstructionManager::new();
        let txs = vec![tx(1), tx(2)];
        let root = domain::merkle_root(&txs);
        let wanted: Vec<ThinTx> = txs.iter().map(|t| ThinTx::from_full(domain::txid(t))).collect();
        let hash = [0xAB; 32];

        let stub1 = Stub { header: header(root), wanted: wanted.clone(), provided: vec![] };
        mgr.build_stub(hash, stub1, &EmptyFinder, "peer-a".into(), Weak::new()).unwrap();
        assert_eq!(mgr.worker_count(&hash), 1);

        let stub2 = Stub { header: header(root), wanted, provided: vec![] };
        mgr.build_stub(hash, stub2, &EmptyFinder, "peer-b".into(), Weak::new()).unwrap();
        assert_eq!(mgr.worker_count(&hash), 2);
        assert!(mgr.has_builder(&hash));
    }

    #[test]
    fn completing_the_block_removes_the_active_entry() {
        let mut mgr = ReconstructionManager::new();
        let txs = vec![tx(1)];
        let root = domain::merkle_root(&txs);
        let wanted = vec![ThinTx::from_full(domain::txid(&txs[0]))];
        let hash = [0xCD; 32];
        let stub = Stub { header: header(root), wanted, provided: vec![(0, txs[0].clone())] };
        let outcome = mgr.build_stub(hash, stub, &EmptyFinder, "peer-a".into(), Weak::new()).unwrap();
        assert!(matches!(outcome, StubOutcome::Completed { .. }));
        assert!(!mgr.has_builder(&hash));
    }

    #[test]
    fn remove_if_exists_returns_worker_peer_ids() {
        let mut mgr = ReconstructionManager::new();
        let wanted = vec![ThinTx::from_full(domain::txid(&tx(1)))];
        let hash = [0xEF; 32];
        let stub = Stub { header: header(NULL_HASH), wanted, provided: vec![] };
        mgr.build_stub(hash, stub, &EmptyFinder, "peer-a".into(), Weak::new()).unwrap();
        let evicted = mgr.remove_if_exists(hash);
        assert_eq!(evicted, vec!["peer-a".to_string()]);
        assert!(!mgr.has_builder(&hash));
    }

    #[test]
    fn announcer_rotation_evicts_least_recently_useful() {
        let mut mgr = ReconstructionManager::new();
        assert_eq!(mgr.note_announcer("p1".into()), None);
        assert_eq!(mgr.note_announcer("p2".into()), None);
        assert_eq!(mgr.note_announcer("p3".into()), None);
        assert_eq!(mgr.note_announcer("p4".into()), Some("p1".into()));
        assert_eq!(mgr.note_announcer("p2".into()), None); // rotates to front, no eviction
    }
}
