//! `ThinTx`: a transaction identity that may carry a full hash, a cheap
//! prefix, and/or a salted short-ID. `cheap` is computed eagerly alongside
//! `full` rather than lazily, since deriving it is one copy of eight bytes.

use crate::network::errors::ProtocolError;
use crate::network::short_id::{self, SaltKeys, ShortId};
use crate::domain::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShortIdFacet {
    id: ShortId,
    keys: SaltKeys,
}

/// A transaction identity carrying zero or more of {full hash, cheap
/// 8-byte prefix, salted short-ID}. `full` and `cheap` are kept in sync:
/// whenever `full` is populated, `cheap` is derived immediately (no
/// interior mutability needed, unlike the C++ original's `mutable cheap_`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinTx {
    full: Option<Hash>,
    cheap: Option<u64>,
    shortid: Option<ShortIdFacet>,
}

impl ThinTx {
    pub fn null() -> Self {
        ThinTx {
            full: None,
            cheap: None,
            shortid: None,
        }
    }

    pub fn from_full(hash: Hash) -> Self {
        ThinTx {
            full: Some(hash),
            cheap: Some(cheap_hash(&hash)),
            shortid: None,
        }
    }

    pub fn from_cheap(cheap: u64) -> Self {
        ThinTx {
            full: None,
            cheap: Some(cheap),
            shortid: None,
        }
    }

    pub fn from_short_id(id: ShortId, keys: SaltKeys) -> Self {
        ThinTx {
            full: None,
            cheap: None,
            shortid: Some(ShortIdFacet { id, keys }),
        }
    }

    pub fn from_full_and_short_id(hash: Hash, id: ShortId, keys: SaltKeys) -> Self {
        ThinTx {
            full: Some(hash),
            cheap: Some(cheap_hash(&hash)),
            shortid: Some(ShortIdFacet { id, keys }),
        }
    }

    pub fn is_null(&self) -> bool {
        self.full.is_none() && self.cheap.is_none() && self.shortid.is_none()
    }

    pub fn has_full(&self) -> bool {
        self.full.is_some()
    }

    pub fn full(&self) -> Option<Hash> {
        self.full
    }

    pub fn has_cheap(&self) -> bool {
        self.cheap.is_some()
    }

    pub fn cheap(&self) -> Option<u64> {
        self.cheap
    }

    pub fn has_short_id(&self) -> bool {
        self.shortid.is_some()
    }

    pub fn short_id(&self) -> Option<ShortId> {
        self.shortid.map(|s| s.id)
    }

    pub fn short_id_keys(&self) -> Option<SaltKeys> {
        self.shortid.map(|s| s.keys)
    }

    /// Best-effort equality across forms: same-salt short-IDs compare
    /// directly; otherwise recompute one
    /// side's short-ID under the other's salt if a full hash is known;
    /// otherwise fall back to full==full or cheap==cheap.
    pub fn equals(&self, other: &ThinTx) -> bool {
        if let (Some(a), Some(b)) = (self.shortid, other.shortid) {
            if a.keys == b.keys {
                return a.id == b.id;
            }
        }
        if let Some(full) = self.full {
            if let Some(b) = other.shortid {
                return short_id::short_id(b.keys, &full) == b.id;
            }
        }
        if let Some(full) = other.full {
            if let Some(a) = self.shortid {
                return short_id::short_id(a.keys, &full) == a.id;
            }
        }
        if let (Some(a), Some(b)) = (self.full, other.full) {
            return a == b;
        }
        if let (Some(a), Some(b)) = (self.cheap, other.cheap) {
            return a == b;
        }
        false
    }

    /// Merge another identity's facets into this one, keeping whichever
    /// facet is already known and adopting new ones. Raises
    /// `ReconstructionMismatch` if both sides carry a `cheap` facet and
    /// they disagree.
    pub fn merge(&mut self, other: &ThinTx) -> Result<(), ProtocolError> {
        if let (Some(a), Some(b)) = (self.cheap, other.cheap) {
            if a != b {
                return Err(ProtocolError::ReconstructionMismatch(
                    "cheap hash mismatch on merge".into(),
                ));
            }
        }
        if self.full.is_none() {
            if let Some(full) = other.full {
                self.full = Some(full);
                self.cheap = Some(cheap_hash(&full));
            }
        }
        if self.cheap.is_none() {
            self.cheap = other.cheap;
        }
        if self.shortid.is_none() {
            self.shortid = other.shortid;
        }
        Ok(())
    }
}

/// First 8 bytes of the full hash, as a little-endian u64 ("cheap hash").
pub fn cheap_hash(full: &Hash) -> u64 {
    u64::from_le_bytes(full[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> Hash {
        [byte; 32]
    }

    #[test]
    fn is_null_iff_no_facet_populated() {
        assert!(ThinTx::null().is_null());
        assert!(!ThinTx::from_full(hash(1)).is_null());
        assert!(!ThinTx::from_cheap(5).is_null());
    }

    #[test]
    fn full_populates_cheap_eagerly() {
        let tx = ThinTx::from_full(hash(9));
        assert!(tx.has_cheap());
        assert_eq!(tx.cheap().unwrap(), cheap_hash(&hash(9)));
    }

    #[test]
    fn equals_same_salt_short_ids() {
        let keys = SaltKeys { k0: 1, k1: 2 };
        let id = short_id::short_id(keys, &hash(3));
        let a = ThinTx::from_short_id(id, keys);
        let b = ThinTx::from_short_id(id, keys);
        assert!(a.equals(&b));
    }

    #[test]
    fn equals_cross_salt_recomputes_from_full() {
        let keys = SaltKeys { k0: 1, k1: 2 };
        let full = hash(4);
        let id = short_id::short_id(keys, &full);
        let a = ThinTx::from_full(full);
        let b = ThinTx::from_short_id(id, keys);
        assert!(a.equals(&b));
        assert!(b.equals(&a));
    }

    #[test]
    fn merge_raises_on_cheap_mismatch() {
        let mut a = ThinTx::from_cheap(1);
        let b = ThinTx::from_cheap(2);
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn merge_preserves_best_known_facet() {
        let mut a = ThinTx::from_cheap(cheap_hash(&hash(5)));
        let b = ThinTx::from_full(hash(5));
        a.merge(&b).unwrap();
        assert!(a.has_full());
        assert_eq!(a.full().unwrap(), hash(5));
    }
}
