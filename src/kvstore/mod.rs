//! Pluggable persistence layer.
//!
//! The engine treats the on-disk store as a capability set: a sink for
//! flushed mutations and deletions, a source of documents for warm-up,
//! background fetches and DCP backfills, plus the persisted per-partition
//! state blob. Two implementations are provided: an in-memory store for
//! tests and ephemeral buckets, and an append-only file store.

pub mod file;
pub mod memory;

pub use file::FileKVStore;
pub use memory::MemoryKVStore;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::item::{Datatype, DocKey, Item, Operation, QueuedItem, Vbid};
use crate::vbstate::VBucketState;

/// A document as the persistence layer sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedDoc {
    pub key: DocKey,
    pub value: Vec<u8>,
    pub flags: u32,
    pub datatype: u8,
    pub expiry: u32,
    pub cas: u64,
    pub seqno: u64,
    pub rev_seqno: u64,
    pub deleted: bool,
}

impl PersistedDoc {
    pub fn from_item(item: &QueuedItem) -> Self {
        Self {
            key: item.key().clone(),
            value: item.value().to_vec(),
            flags: item.flags(),
            datatype: item.datatype().0,
            expiry: item.expiry(),
            cas: item.cas(),
            seqno: item.seqno(),
            rev_seqno: item.rev_seqno(),
            deleted: item.is_deleted(),
        }
    }

    /// Rehydrates an Item for warm-up, backfill or background fetch.
    pub fn to_item(&self) -> Result<Item> {
        let op = if self.deleted {
            Operation::Deletion
        } else {
            Operation::Mutation
        };
        let mut item = if self.deleted {
            Item::deleted(self.key.clone(), self.cas, op, self.rev_seqno)?
        } else {
            Item::new(
                self.key.clone(),
                self.value.clone(),
                self.flags,
                Datatype(self.datatype),
                self.expiry,
                self.cas,
                op,
                None,
            )?
        };
        item.set_rev_seqno(self.rev_seqno);
        item.set_seqno(self.seqno);
        Ok(item)
    }
}

/// Capability set of the pluggable store. Implementations are selected by
/// configuration and shared behind `Arc<dyn KVStore>`.
pub trait KVStore: Send + Sync {
    /// Persists a mutation. Replaces any previous version of the key.
    fn set(&self, vbid: Vbid, doc: PersistedDoc) -> Result<()>;

    /// Persists a deletion tombstone.
    fn del(&self, vbid: Vbid, doc: PersistedDoc) -> Result<()>;

    fn get(&self, vbid: Vbid, key: &DocKey) -> Result<Option<PersistedDoc>>;

    /// Batched point lookups for the background fetcher.
    fn get_multi(
        &self,
        vbid: Vbid,
        keys: &[DocKey],
    ) -> Result<Vec<(DocKey, Option<PersistedDoc>)>>;

    /// Documents with `start <= seqno <= end` in seqno order, tombstones
    /// included. Backfill source.
    fn scan_seqnos(&self, vbid: Vbid, start: u64, end: u64) -> Result<Vec<PersistedDoc>>;

    /// Highest persisted seqno for the partition (0 when empty/unknown).
    fn high_seqno(&self, vbid: Vbid) -> u64;

    /// Live (non-tombstone) document count.
    fn item_count(&self, vbid: Vbid) -> usize;

    fn snapshot_vb_state(&self, vbid: Vbid, state: &VBucketState) -> Result<()>;

    fn load_vb_state(&self, vbid: Vbid) -> Result<Option<VBucketState>>;

    fn list_persisted_vbuckets(&self) -> Result<Vec<Vbid>>;

    /// Discards everything above `target` and returns the seqno the
    /// partition now ends at.
    fn rewind(&self, vbid: Vbid, target: u64) -> Result<u64>;

    fn delete_vbucket(&self, vbid: Vbid) -> Result<()>;

    /// Drops tombstones with `seqno < purge_before`. Returns how many were
    /// purged and the highest purged seqno (zero when none).
    fn compact(&self, vbid: Vbid, purge_before: u64) -> Result<(usize, u64)>;

    /// Named operational counters ("sets", "dels", "fetches").
    fn get_stat(&self, name: &str) -> Option<u64>;

    /// Makes everything written so far durable.
    fn sync(&self) -> Result<()>;
}
