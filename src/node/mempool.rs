//! Mempool manager
//!
//! Stores full transactions by hash so the relay layer can build
//! [`crate::network::mempool_index::MempoolIndex`] and satisfy stub
//! reconstruction lookups. Fee prioritization, conflict
//! resolution against a UTXO set and mining-candidate selection are the
//! consensus/mining collaborators' job, not relay's — this manager only
//! tracks "transactions we've seen and can serve back out".

use crate::domain::{Hash, Transaction};
use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

/// Transaction mempool.
pub struct MempoolManager {
    transactions: HashMap<Hash, Transaction>,
}

impl Default for MempoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MempoolManager {
    pub fn new() -> Self {
        Self {
            transactions: HashMap::new(),
        }
    }

    /// Insert a transaction, keyed by its relay-computed hash. Returns
    /// `false` if it was already present.
    pub fn add_transaction(&mut self, tx: Transaction) -> bool {
        let hash = crate::domain::txid(&tx);
        if self.transactions.contains_key(&hash) {
            return false;
        }
        debug!("added transaction {} to mempool", hex::encode(hash));
        self.transactions.insert(hash, tx);
        true
    }

    pub fn remove_transaction(&mut self, hash: &Hash) -> bool {
        self.transactions.remove(hash).is_some()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.transactions.contains_key(hash)
    }

    pub fn get_transaction(&self, hash: &Hash) -> Option<Transaction> {
        self.transactions.get(hash).cloned()
    }

    pub fn size(&self) -> usize {
        self.transactions.len()
    }

    /// Hashes of everything currently held, the input
    /// [`crate::network::mempool_index::MempoolIndex::build`] salts into a
    /// per-peer short-id lookup table.
    pub fn transaction_hashes(&self) -> Vec<Hash> {
        self.transactions.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    /// Persist the mempool to disk across restarts. Format: a `u32`
    /// transaction count followed by length-prefixed bincode transactions.
    pub fn save_to_disk<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        use std::fs::File;
        use std::io::Write;

        let mut file = File::create(path)?;
        file.write_all(&(self.transactions.len() as u32).to_le_bytes())?;
        for tx in self.transactions.values() {
            let serialized = bincode::serialize(tx)?;
            file.write_all(&(serialized.len() as u32).to_le_bytes())?;
            file.write_all(&serialized)?;
        }
        file.sync_all()?;
        Ok(())
    }

    pub fn load_from_disk<P: AsRef<std::path::Path>>(&mut self, path: P) -> Result<()> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(path)?;
        let mut count_bytes = [0u8; 4];
        file.read_exact(&mut count_bytes)?;
        let count = u32::from_le_bytes(count_bytes) as usize;

        for _ in 0..count {
            let mut len_bytes = [0u8; 4];
            file.read_exact(&mut len_bytes)?;
            let len = u32::from_le_bytes(len_bytes) as usize;

            let mut tx_bytes = vec![0u8; len];
            file.read_exact(&mut tx_bytes)?;

            let tx: Transaction = bincode::deserialize(&tx_bytes)?;
            self.add_transaction(tx);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutPoint, TxIn, TxOut};

    fn sample_tx(seq: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint {
                    hash: [seq as u8; 32],
                    index: 0,
                },
                script_sig: vec![],
                sequence: seq,
            }],
            outputs: vec![TxOut {
                value: 1000,
                script_pubkey: vec![],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn add_and_remove_round_trip() {
        let mut mempool = MempoolManager::new();
        let tx = sample_tx(1);
        let hash = crate::domain::txid(&tx);
        assert!(mempool.add_transaction(tx.clone()));
        assert!(!mempool.add_transaction(tx));
        assert_eq!(mempool.size(), 1);
        assert!(mempool.remove_transaction(&hash));
        assert_eq!(mempool.size(), 0);
    }

    #[test]
    fn transaction_hashes_feeds_mempool_index() {
        let mut mempool = MempoolManager::new();
        mempool.add_transaction(sample_tx(1));
        mempool.add_transaction(sample_tx(2));
        assert_eq!(mempool.transaction_hashes().len(), 2);
    }
}
