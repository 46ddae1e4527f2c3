//! `ThinBlockBuilder`: the per-block accumulator that fills an ordered slot
//! vector from the mempool, re-requested transactions, or prefilled bodies,
//! and finalises by checking the Merkle root.

use crate::domain::{self, BlockHeader, Hash, Transaction};
use crate::network::errors::ProtocolError;
use crate::network::short_id::{SaltKeys, ShortId};
use crate::network::thin_tx::ThinTx;
use std::collections::HashMap;

/// Looks up a transaction by its best-known identity. Implemented by the
/// mempool-backed index and wrapped by the reconstruction
/// manager to additionally consult a stub's own provided transactions.
pub trait TxFinder {
    fn find(&self, wanted: &ThinTx) -> Option<Transaction>;
}

impl<F: Fn(&ThinTx) -> Option<Transaction>> TxFinder for F {
    fn find(&self, wanted: &ThinTx) -> Option<Transaction> {
        self(wanted)
    }
}

/// The header + wanted-transaction list of a block, without the bodies of
/// transactions the receiver is expected to already hold (glossary "Stub").
/// `provided` carries bodies the sender sent inline (prefilled/missing
/// transactions) that should be consulted before the shared finder.
pub struct Stub {
    pub header: BlockHeader,
    pub wanted: Vec<ThinTx>,
    pub provided: Vec<(usize, Transaction)>,
}

impl Stub {
    /// All transactions this stub can supply without any external lookup:
    /// the `provided` list, keyed by slot index.
    pub fn all_transactions(&self) -> HashMap<usize, Transaction> {
        self.provided.iter().cloned().collect()
    }

    /// `wanted` entries with no matching `provided` body (the wrapping
    /// finder consults these before falling through to the shared finder).
    pub fn missing_provided(&self) -> Vec<usize> {
        let provided: std::collections::HashSet<usize> =
            self.provided.iter().map(|(i, _)| *i).collect();
        (0..self.wanted.len()).filter(|i| !provided.contains(i)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
    Unwanted,
}

/// Per-block accumulator. `slots[0]` is always the coinbase when
/// filled and is reserved for a full-hash/prefilled match, never matched by
/// short-ID alone.
pub struct ThinBlockBuilder {
    header: BlockHeader,
    wanted: Vec<ThinTx>,
    slots: Vec<Option<Transaction>>,
    /// `(short-ID, salt)` -> ascending list of candidate slot indices, used
    /// when transactions arrive identified only by short-ID.
    short_id_index: HashMap<(ShortId, SaltKeys), Vec<usize>>,
}

impl ThinBlockBuilder {
    pub fn new(header: BlockHeader, wanted: Vec<ThinTx>, finder: &dyn TxFinder) -> Self {
        let slots: Vec<Option<Transaction>> = wanted.iter().map(|w| finder.find(w)).collect();
        let mut builder = ThinBlockBuilder {
            header,
            wanted,
            slots,
            short_id_index: HashMap::new(),
        };
        builder.rebuild_short_id_index();
        builder
    }

    fn rebuild_short_id_index(&mut self) {
        self.short_id_index.clear();
        for (i, w) in self.wanted.iter().enumerate() {
            if i == 0 {
                continue; // coinbase is never matched by short-ID alone.
            }
            if let (Some(id), Some(keys)) = (w.short_id(), w.short_id_keys()) {
                self.short_id_index.entry((id, keys)).or_default().push(i);
            }
        }
    }

    /// Feed a transaction in from any source (mempool match, `blocktxn`,
    /// `xblocktx`). Matches by short-ID first (any salt present in
    /// `wanted`), then by full hash, then by cheap hash; fills the lowest
    /// empty matching slot.
    pub fn add_transaction(&mut self, tx: Transaction) -> AddOutcome {
        let hash = domain::txid(&tx);
        let candidate = ThinTx::from_full(hash);

        let mut by_short_id: Option<usize> = None;
        for (&(_, keys), indices) in self.short_id_index.iter() {
            let id = crate::network::short_id::short_id(keys, &hash);
            if let Some(&idx) = indices
                .iter()
                .find(|&&i| self.slots[i].is_none() && self.wanted[i].short_id() == Some(id))
            {
                by_short_id = Some(by_short_id.map_or(idx, |best| best.min(idx)));
            }
        }
        if let Some(idx) = by_short_id {
            return self.fill_slot(idx, tx);
        }

        for (i, w) in self.wanted.iter().enumerate() {
            if self.slots[i].is_some() {
                continue;
            }
            if w.equals(&candidate) {
                return self.fill_slot(i, tx);
            }
        }

        AddOutcome::Unwanted
    }

    fn fill_slot(&mut self, idx: usize, tx: Transaction) -> AddOutcome {
        if self.slots[idx].is_some() {
            return AddOutcome::Duplicate;
        }
        self.slots[idx] = Some(tx);
        AddOutcome::Added
    }

    /// Replace the wanted-transaction list with a second peer's stub for the
    /// same block. Lengths must match and every `cheap` facet present on
    /// both sides must agree; the merge preserves whichever facet is
    /// already known per slot.
    pub fn replace_wanted_tx(&mut self, new_wanted: &[ThinTx]) -> Result<(), ProtocolError> {
        if new_wanted.len() != self.wanted.len() {
            return Err(ProtocolError::ReconstructionMismatch(format!(
                "wanted length mismatch: {} vs {}",
                self.wanted.len(),
                new_wanted.len()
            )));
        }
        for (existing, incoming) in self.wanted.iter_mut().zip(new_wanted.iter()) {
            existing.merge(incoming)?;
        }
        self.rebuild_short_id_index();
        Ok(())
    }

    /// Empty slots, in ascending index order.
    pub fn missing(&self) -> Vec<(usize, ThinTx)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| if s.is_none() { Some((i, self.wanted[i])) } else { None })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Finalises the block, checking the Merkle root against the header.
    pub fn finish(self) -> Result<domain::Block, ProtocolError> {
        let mut transactions = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.into_iter().enumerate() {
            transactions.push(slot.ok_or_else(|| {
                ProtocolError::BadEncoding(format!("builder slot {i} is still empty"))
            })?);
        }
        let root = domain::merkle_root(&transactions);
        if root != self.header.merkle_root {
            return Err(ProtocolError::MerkleMismatch);
        }
        Ok(domain::Block { header: self.header, transactions })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NULL_HASH, OutPoint, TxIn, TxOut};

    fn header(root: Hash) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: NULL_HASH,
            merkle_root: root,
            timestamp: 0,
            bits: 0,
            nonce: 0,
        }
    }

    fn tx(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint { hash: [tag; 32], index: 0 },
                script_sig: vec![],
                sequence: 0,
            }],
            outputs: vec![TxOut { value: 1, script_pubkey: vec![] }],
            lock_time: 0,
        }
    }

    struct NoopFinder;
    impl TxFinder for NoopFinder {
        fn find(&self, _wanted: &ThinTx) -> Option<Transaction> {
            None
        }
    }

    #[test]
    fn finish_succeeds_when_merkle_root_matches() {
        let txs = vec![tx(1), tx(2)];
        let root = domain::merkle_root(&txs);
        let wanted: Vec<ThinTx> = txs.iter().map(|t| ThinTx::from_full(domain::txid(t))).collect();
        let mut builder = ThinBlockBuilder::new(header(root), wanted, &NoopFinder);
        assert_eq!(builder.add_transaction(txs[0].clone()), AddOutcome::Added);
        assert_eq!(builder.add_transaction(txs[1].clone()), AddOutcome::Added);
        assert!(builder.is_complete());
        let block = builder.finish().unwrap();
        assert_eq!(block.transactions.len(), 2);
    }

    #[test]
    fn finish_rejects_merkle_mismatch() {
        let txs = vec![tx(1), tx(2)];
        let wanted: Vec<ThinTx> = txs.iter().map(|t| ThinTx::from_full(domain::txid(t))).collect();
        let mut builder = ThinBlockBuilder::new(header(NULL_HASH), wanted, &NoopFinder);
        builder.add_transaction(txs[0].clone());
        builder.add_transaction(txs[1].clone());
        assert!(matches!(builder.finish(), Err(ProtocolError::MerkleMismatch)));
    }

    #[test]
    fn add_transaction_reports_unwanted() {
        let wanted = vec![ThinTx::from_full(domain::txid(&tx(1)))];
        let mut builder = ThinBlockBuilder::new(header(NULL_HASH), wanted, &NoopFinder);
        assert_eq!(builder.add_transaction(tx(9)), AddOutcome::Unwanted);
    }

    #[test]
    fn add_transaction_reports_duplicate() {
        let wanted = vec![ThinTx::from_full(domain::txid(&tx(1)))];
        let mut builder = ThinBlockBuilder::new(header(NULL_HASH), wanted, &NoopFinder);
        assert_eq!(builder.add_transaction(tx(1)), AddOutcome::Added);
        assert_eq!(builder.add_transaction(tx(1)), AddOutcome::Duplicate);
    }

    #[test]
    fn replace_wanted_tx_rejects_length_mismatch() {
        let wanted = vec![ThinTx::from_full(domain::txid(&tx(1)))];
        let mut builder = ThinBlockBuilder::new(header(NULL_HASH), wanted, &NoopFinder);
        let other = vec![ThinTx::from_full(domain::txid(&tx(1))), ThinTx::from_full(domain::txid(&tx(2)))];
        assert!(builder.replace_wanted_tx(&other).is_err());
    }

    #[test]
    fn missing_lists_empty_slots_in_order() {
        let wanted = vec![
            ThinTx::from_full(domain::txid(&tx(1))),
            ThinTx::from_full(domain::txid(&tx(2))),
        ];
        let builder = ThinBlockBuilder::new(header(NULL_HASH), wanted, &NoopFinder);
        assert_eq!(builder.missing().iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1]);
    }
}
