//! Short transaction IDs (BIP152-style).
//!
//! `shortid(k0, k1, h) = SipHash-2-4(k0, k1, h) mod 2^48`, with `(k0, k1)`
//! derived from `SHA256(header || nonce)`. This must be byte-identical
//! across implementations, so the derivation and wire layout below are
//! exact rather than a simplification that derives keys directly from the
//! nonce (a shortcut unsuitable for interop testing).

use crate::domain::{BlockHeader, Hash};
use sha2::{Digest, Sha256};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

/// 48-bit short transaction ID.
pub type ShortId = u64;

pub const SHORT_ID_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// SipHash keys salted per block (header + nonce).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SaltKeys {
    pub k0: u64,
    pub k1: u64,
}

impl SaltKeys {
    /// Derive `(k0, k1)` from `SHA256(serialized_header || LE_u64(nonce))`.
    pub fn derive(header: &BlockHeader, nonce: u64) -> Self {
        let mut data = bincode::serialize(header).unwrap_or_default();
        data.extend_from_slice(&nonce.to_le_bytes());
        let digest = Sha256::digest(&data);
        let k0 = u64::from_le_bytes(digest[0..8].try_into().unwrap());
        let k1 = u64::from_le_bytes(digest[8..16].try_into().unwrap());
        SaltKeys { k0, k1 }
    }
}

/// Compute the 48-bit short ID of `tx_hash` under `keys`.
pub fn short_id(keys: SaltKeys, tx_hash: &Hash) -> ShortId {
    let mut hasher = SipHasher24::new_with_keys(keys.k0, keys.k1);
    hasher.write(tx_hash);
    hasher.finish() & SHORT_ID_MASK
}

/// Wire layout: 4-byte LSB u32 followed by 2-byte MSB u16.
pub fn encode_wire(id: ShortId) -> [u8; 6] {
    let bytes = id.to_le_bytes();
    let mut out = [0u8; 6];
    out.copy_from_slice(&bytes[0..6]);
    out
}

pub fn decode_wire(bytes: [u8; 6]) -> ShortId {
    let mut buf = [0u8; 8];
    buf[0..6].copy_from_slice(&bytes);
    u64::from_le_bytes(buf) & SHORT_ID_MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NULL_HASH;

    fn header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: NULL_HASH,
            merkle_root: NULL_HASH,
            timestamp: 1_600_000_000,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        }
    }

    #[test]
    fn wire_round_trip_preserves_48_bits() {
        let keys = SaltKeys::derive(&header(), 42);
        let id = short_id(keys, &[7u8; 32]);
        assert_eq!(id & !SHORT_ID_MASK, 0);
        assert_eq!(decode_wire(encode_wire(id)), id);
    }

    #[test]
    fn different_salts_give_different_ids_almost_always() {
        let h = header();
        let keys1 = SaltKeys::derive(&h, 1);
        let keys2 = SaltKeys::derive(&h, 2);
        assert_ne!(keys1, keys2);
        let tx_hash = [9u8; 32];
        assert_ne!(short_id(keys1, &tx_hash), short_id(keys2, &tx_hash));
    }

    #[test]
    fn is_pure_and_deterministic() {
        let keys = SaltKeys { k0: 1, k1: 2 };
        let tx_hash = [3u8; 32];
        assert_eq!(short_id(keys, &tx_hash), short_id(keys, &tx_hash));
    }
}
