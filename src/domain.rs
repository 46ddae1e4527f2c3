//! Domain types shared with the consensus/storage collaborators.
//!
//! The block-propagation core never validates scripts, signatures, or the
//! UTXO set — that is the consensus engine's job, reached only through the
//! `ChainView` contract. This module only defines the wire shape of blocks,
//! transactions and headers, plus the minimal `ChainView` contract this
//! crate needs from whatever owns chainstate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte double-SHA256 digest (transaction id or block hash).
pub type Hash = [u8; 32];

pub const NULL_HASH: Hash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Minimum serialized transaction size miners must pad coinbase to
    ///, so that
    /// `current_max_block_size / min_tx_size` stays a meaningful bound.
    pub const MIN_TRANSACTION_SIZE: usize = 60;

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prevout.hash == NULL_HASH
            && self.inputs[0].prevout.index == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Mirrors Bitcoin's `CBlockHeader::IsNull` (checked via `bits == 0`,
    /// since a valid header always carries a non-zero difficulty target).
    pub fn is_null(&self) -> bool {
        self.bits == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Best-effort, non-consensus txid: double-SHA256 of the bincode
/// serialization. Good enough for relay bookkeeping; the consensus
/// collaborator computes the authoritative txid from the wire serialization.
pub fn txid(tx: &Transaction) -> Hash {
    double_sha256(&bincode::serialize(tx).unwrap_or_default())
}

pub fn header_hash(header: &BlockHeader) -> Hash {
    double_sha256(&bincode::serialize(header).unwrap_or_default())
}

fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Merkle root over an ordered list of transactions (double-SHA256 tree,
/// duplicating the last element of an odd-sized level — the historical
/// Bitcoin behaviour; CVE-2012-2459 duplication attacks are the consensus
/// collaborator's concern, not relay's).
pub fn merkle_root(txs: &[Transaction]) -> Hash {
    if txs.is_empty() {
        return NULL_HASH;
    }
    let mut level: Vec<Hash> = txs.iter().map(txid).collect();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = Vec::with_capacity(64);
                buf.extend_from_slice(&pair[0]);
                buf.extend_from_slice(&pair[1]);
                double_sha256(&buf)
            })
            .collect();
    }
    level[0]
}

/// A reference to a header the local chain knows about, used by
/// `PeerState` to track per-peer best-known/best-header-sent/common-ancestor
/// pointers without cloning the full header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRef {
    pub hash: Hash,
    pub height: u64,
    pub chain_work: u128,
}

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header is consensus-invalid: {0}")]
    Invalid(String),
    #[error("header does not connect to a known previous block")]
    Unconnecting,
}

/// The contract this crate needs from the consensus/chainstate collaborator.
///
/// Production deployments back this with a real chainstate database; this
/// crate ships `MapChainView`, an in-memory implementation used by tests and
/// as a reference for wiring a real one.
pub trait ChainView: Send + Sync {
    fn tip(&self) -> HeaderRef;
    fn contains_block(&self, hash: &Hash) -> bool;
    fn get_header(&self, hash: &Hash) -> Option<HeaderRef>;
    /// Accept a header into the index. Returns the new HeaderRef on success.
    fn accept_header(&mut self, header: &BlockHeader) -> Result<HeaderRef, HeaderError>;
    /// Locator hashes for the active chain, most-recent first (BIP-style
    /// exponential backoff), terminated by the genesis hash.
    fn locator_hashes(&self) -> Vec<Hash>;
    /// Chain-work ordered ancestry walk from `from` back to (and including)
    /// `to`, used to find headers to (re-)announce. `None` if `to` is not an
    /// ancestor of `from`.
    fn path_between(&self, from: &Hash, to: &Hash) -> Option<Vec<Hash>>;
}

/// In-memory `ChainView` keyed purely on header linkage and chain work;
/// enough to drive the propagation logic's tests without a real UTXO/script
/// engine behind it.
#[derive(Default)]
pub struct MapChainView {
    headers: std::collections::HashMap<Hash, (HeaderRef, Hash)>, // hash -> (ref, prev)
    tip: Option<Hash>,
}

impl MapChainView {
    pub fn new_with_genesis(genesis: BlockHeader) -> Self {
        let mut view = Self::default();
        let hash = header_hash(&genesis);
        let href = HeaderRef {
            hash,
            height: 0,
            chain_work: 1,
        };
        view.headers.insert(hash, (href, NULL_HASH));
        view.tip = Some(hash);
        view
    }
}

impl ChainView for MapChainView {
    fn tip(&self) -> HeaderRef {
        self.tip
            .and_then(|h| self.headers.get(&h).map(|(r, _)| r.clone()))
            .unwrap_or(HeaderRef {
                hash: NULL_HASH,
                height: 0,
                chain_work: 0,
            })
    }

    fn contains_block(&self, hash: &Hash) -> bool {
        self.headers.contains_key(hash)
    }

    fn get_header(&self, hash: &Hash) -> Option<HeaderRef> {
        self.headers.get(hash).map(|(r, _)| r.clone())
    }

    fn accept_header(&mut self, header: &BlockHeader) -> Result<HeaderRef, HeaderError> {
        let hash = header_hash(header);
        if let Some((existing, _)) = self.headers.get(&hash) {
            return Ok(existing.clone());
        }
        let (parent, _) = self
            .headers
            .get(&header.prev_block_hash)
            .cloned()
            .ok_or(HeaderError::Unconnecting)?;
        let href = HeaderRef {
            hash,
            height: parent.height + 1,
            chain_work: parent.chain_work + 1,
        };
        self.headers.insert(hash, (href.clone(), header.prev_block_hash));
        let tip_work = self.tip().chain_work;
        if href.chain_work >= tip_work {
            self.tip = Some(hash);
        }
        Ok(href)
    }

    fn locator_hashes(&self) -> Vec<Hash> {
        let mut out = Vec::new();
        let mut cur = self.tip;
        let mut step = 1usize;
        let mut count = 0usize;
        while let Some(h) = cur {
            out.push(h);
            if count >= 10 {
                step *= 2;
            }
            for _ in 0..step {
                cur = self.headers.get(&cur.unwrap()).and_then(|(_, prev)| {
                    if *prev == NULL_HASH {
                        None
                    } else {
                        Some(*prev)
                    }
                });
                if cur.is_none() {
                    break;
                }
            }
            count += 1;
            if out.len() > 64 {
                break;
            }
        }
        out
    }

    fn path_between(&self, from: &Hash, to: &Hash) -> Option<Vec<Hash>> {
        let mut path = vec![*from];
        let mut cur = *from;
        loop {
            if cur == *to {
                path.reverse();
                return Some(path);
            }
            let (_, prev) = self.headers.get(&cur)?;
            if *prev == NULL_HASH {
                return None;
            }
            cur = *prev;
            path.push(cur);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: NULL_HASH,
            timestamp: 0,
            bits: 0,
            nonce,
        }
    }

    #[test]
    fn chain_view_tracks_chain_work() {
        let genesis = header(NULL_HASH, 0);
        let genesis_hash = header_hash(&genesis);
        let mut view = MapChainView::new_with_genesis(genesis);
        let h1 = header(genesis_hash, 1);
        let r1 = view.accept_header(&h1).unwrap();
        assert_eq!(r1.height, 1);
        assert_eq!(view.tip().hash, r1.hash);
    }

    #[test]
    fn unconnecting_header_is_rejected() {
        let genesis = header(NULL_HASH, 0);
        let mut view = MapChainView::new_with_genesis(genesis);
        let orphan = header([0xAAu8; 32], 5);
        assert!(matches!(
            view.accept_header(&orphan),
            Err(HeaderError::Unconnecting)
        ));
    }

    #[test]
    fn merkle_root_of_single_tx_is_its_txid() {
        let tx = Transaction {
            version: 1,
            inputs: vec![],
            outputs: vec![],
            lock_time: 0,
        };
        assert_eq!(merkle_root(std::slice::from_ref(&tx)), txid(&tx));
    }
}
