//! Lightweight hashing utilities (non-consensus) for relay features
//!
//! Thin aliases over [`crate::domain::txid`]/[`crate::domain::header_hash`] so
//! call sites that think in "relay hashing" terms don't need to know the
//! domain module owns the canonical definition. Networking/relay purposes
//! only; the consensus collaborator computes the authoritative hash.

use crate::domain::{self, BlockHeader, Hash, Transaction};

pub fn calculate_txid(tx: &Transaction) -> Hash {
    domain::txid(tx)
}

pub fn calculate_block_header_hash(header: &BlockHeader) -> Hash {
    domain::header_hash(header)
}
