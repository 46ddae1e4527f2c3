//! `PeerWorker` variants.
//!
//! `XThinWorker`/`CompactWorker`/`BloomMerkleWorker` could be expressed as
//! a class hierarchy; here they are a sum type `Worker` over a shared
//! `WorkerCore` (in-flight-per-hash bookkeeping, re-request state, the
//! outbound queue, and a weak back-reference into the reconstruction
//! registry) so the registry never needs a `dyn Worker` vtable to do the
//! bookkeeping all three variants share.

use crate::domain::Hash;
use crate::network::compact_blocks::{self, CompactBlock, XThinBlock};
use crate::network::protocol::{GetXThinMessage, InventoryItem, MSG_BLOCK, MSG_CMPCT_BLOCK, MSG_FILTERED_BLOCK};
use crate::network::thin_block_builder::Stub;
use std::collections::HashSet;
use std::sync::{Mutex, Weak};

/// What a worker needs from the reconstruction registry without depending on
/// its concrete type (`node::NodeState` implements this), breaking the
/// worker↔registry cycle.
pub trait RegistryHandle: Send + Sync {
    fn del_worker(&self, hash: Hash, peer_id: &str);
}

/// A Bloom filter over up to 10,000 mempool hashes the peer does *not* want
/// re-sent, fpr 0.0001, random tweak. Construction
/// of the filter bitset itself is the caller's concern (mempool snapshot);
/// this just carries the negotiated parameters onto the wire.
#[derive(Debug, Clone)]
pub struct DontWantFilter {
    pub bytes: Vec<u8>,
    pub hash_funcs: u32,
    pub tweak: u32,
}

pub const XTHIN_FILTER_MAX_ELEMENTS: usize = 10_000;
pub const XTHIN_FILTER_FALSE_POSITIVE_RATE: f64 = 0.0001;

struct WorkerCore {
    peer_id: String,
    registry: Weak<dyn RegistryHandle>,
    working_on: Mutex<HashSet<Hash>>,
    rerequesting: Mutex<HashSet<Hash>>,
}

impl WorkerCore {
    fn new(peer_id: String, registry: Weak<dyn RegistryHandle>) -> Self {
        WorkerCore {
            peer_id,
            registry,
            working_on: Mutex::new(HashSet::new()),
            rerequesting: Mutex::new(HashSet::new()),
        }
    }

    fn add_work(&self, hash: Hash) {
        self.working_on.lock().unwrap().insert(hash);
    }

    fn stop_work(&self, hash: Hash) {
        self.working_on.lock().unwrap().remove(&hash);
        self.rerequesting.lock().unwrap().remove(&hash);
        if let Some(registry) = self.registry.upgrade() {
            registry.del_worker(hash, &self.peer_id);
        }
    }

    fn stop_all_work(&self) {
        let hashes: Vec<Hash> = self.working_on.lock().unwrap().iter().copied().collect();
        for hash in hashes {
            self.stop_work(hash);
        }
    }

    fn is_working_on(&self, hash: &Hash) -> bool {
        self.working_on.lock().unwrap().contains(hash)
    }

    fn is_rerequesting(&self, hash: &Hash) -> bool {
        self.rerequesting.lock().unwrap().contains(hash)
    }

    fn set_rerequesting(&self, hash: Hash, value: bool) {
        let mut guard = self.rerequesting.lock().unwrap();
        if value {
            guard.insert(hash);
        } else {
            guard.remove(&hash);
        }
    }
}

impl Drop for WorkerCore {
    fn drop(&mut self) {
        self.stop_all_work();
    }
}

pub struct XThinWorker {
    core: WorkerCore,
}

pub struct CompactWorker {
    core: WorkerCore,
}

pub struct BloomMerkleWorker {
    core: WorkerCore,
}

/// A sum type with a shared behaviour surface instead of a class hierarchy.
pub enum Worker {
    XThin(XThinWorker),
    Compact(CompactWorker),
    BloomMerkle(BloomMerkleWorker),
}

/// What a peer has demonstrated it can do, in ascending order of
/// preference: `XThin` is tried first when available, `Compact` next,
/// `BloomMerkle` is the fallback for peers that only declared generic thin
/// support, and `None` means fetches fall back to a plain `getdata(MSG_BLOCK)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ThinCapability {
    #[default]
    None,
    BloomMerkle,
    Compact,
    XThin,
}

impl Worker {
    pub fn new_xthin(peer_id: String, registry: Weak<dyn RegistryHandle>) -> Self {
        Worker::XThin(XThinWorker { core: WorkerCore::new(peer_id, registry) })
    }

    pub fn new_compact(peer_id: String, registry: Weak<dyn RegistryHandle>) -> Self {
        Worker::Compact(CompactWorker { core: WorkerCore::new(peer_id, registry) })
    }

    pub fn new_bloom_merkle(peer_id: String, registry: Weak<dyn RegistryHandle>) -> Self {
        Worker::BloomMerkle(BloomMerkleWorker { core: WorkerCore::new(peer_id, registry) })
    }

    /// Picks the concrete variant matching `capability`. `ThinCapability::None`
    /// still needs a worker shape for callers that already decided to fetch
    /// thin (e.g. a capability learned after `pick_strategy` ran); it falls
    /// back to `Compact` rather than panicking, since `Compact` is the
    /// narrowest encoding that works against the widest range of peers.
    pub fn new_for_capability(capability: ThinCapability, peer_id: String, registry: Weak<dyn RegistryHandle>) -> Self {
        match capability {
            ThinCapability::XThin => Worker::new_xthin(peer_id, registry),
            ThinCapability::BloomMerkle => Worker::new_bloom_merkle(peer_id, registry),
            ThinCapability::Compact | ThinCapability::None => Worker::new_compact(peer_id, registry),
        }
    }

    fn core(&self) -> &WorkerCore {
        match self {
            Worker::XThin(w) => &w.core,
            Worker::Compact(w) => &w.core,
            Worker::BloomMerkle(w) => &w.core,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.core().peer_id
    }

    pub fn add_work(&self, hash: Hash) {
        self.core().add_work(hash);
    }

    pub fn stop_work(&self, hash: Hash) {
        self.core().stop_work(hash);
    }

    pub fn stop_all_work(&self) {
        self.core().stop_all_work();
    }

    pub fn is_working_on(&self, hash: &Hash) -> bool {
        self.core().is_working_on(hash)
    }

    pub fn is_rerequesting(&self, hash: &Hash) -> bool {
        self.core().is_rerequesting(hash)
    }

    pub fn set_rerequesting(&self, hash: Hash, value: bool) {
        self.core().set_rerequesting(hash, value);
    }

    /// The `getdata`/`get_xthin` request this variant issues to fetch
    /// `hash`. Returns the inventory item / request payload;
    /// the caller serializes into the matching `ProtocolMessage`.
    pub fn request_block(&self, hash: Hash, dont_want: Option<DontWantFilter>) -> BlockRequest {
        self.add_work(hash);
        match self {
            Worker::XThin(_) => {
                let filter = dont_want.unwrap_or(DontWantFilter { bytes: vec![], hash_funcs: 0, tweak: 0 });
                BlockRequest::XThin(GetXThinMessage {
                    inventory: InventoryItem::block(hash),
                    bloom_filter: filter.bytes,
                    bloom_hash_funcs: filter.hash_funcs,
                    bloom_tweak: filter.tweak,
                })
            }
            Worker::Compact(_) => BlockRequest::GetData(InventoryItem { inv_type: MSG_CMPCT_BLOCK, hash }),
            Worker::BloomMerkle(_) => {
                BlockRequest::GetData(InventoryItem { inv_type: MSG_FILTERED_BLOCK, hash })
            }
        }
    }

    /// Builds the `Stub` (header + wanted list + provided bodies) this
    /// variant's wire encoding carries, validating it first.
    pub fn build_stub_from_compact(cb: &CompactBlock, max_block_size: usize) -> Result<Stub, crate::network::errors::ProtocolError> {
        cb.validate(max_block_size)?;
        let (wanted, provided) = cb.to_stub_parts()?;
        Ok(Stub { header: cb.header.clone(), wanted, provided })
    }

    pub fn build_stub_from_xthin(xb: &XThinBlock) -> Result<Stub, crate::network::errors::ProtocolError> {
        xb.validate()?;
        let (wanted, provided) = xb.to_stub_parts();
        Ok(Stub { header: xb.header.clone(), wanted, provided })
    }
}

/// What to send on the wire to fetch a block; wrapped into the
/// appropriate `ProtocolMessage` by the caller since `GetData` also covers
/// the full-block and Merkle-block paths.
pub enum BlockRequest {
    GetData(InventoryItem),
    XThin(GetXThinMessage),
}

impl BlockRequest {
    pub fn inventory_type(&self) -> u32 {
        match self {
            BlockRequest::GetData(item) => item.inv_type,
            BlockRequest::XThin(_) => MSG_BLOCK,
        }
    }
}
