//! Sharded in-memory index for one partition.
//!
//! Each shard holds an independent mutex over a plain map; callers take the
//! shard lock once and perform the whole read-modify-write under it, which
//! is what keeps the single-writer-per-key invariant. Entries may be
//! resident (value in memory) or ejected (metadata only); in full-eviction
//! mode temporary entries record keys whose absence was proven by a disk
//! fetch so the fetch is not repeated.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::Result;
use crate::errlogic;
use crate::item::{CommittedState, Datatype, DocKey, Item, Operation, QueuedItem};

/// Reference-bit ceiling; entries at the ceiling are eviction candidates.
pub const MAX_NRU: u8 = 3;

/// Reference bits given to a freshly inserted entry.
pub const INITIAL_NRU: u8 = 2;

/// Marker for entries that exist only to coordinate disk fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempState {
    /// A background fetch for this key is in flight.
    Initial,
    /// A disk fetch proved the key absent; suppresses repeat fetches.
    NonExistent,
}

/// One hash-table entry. At most one committed StoredValue exists per key;
/// a pending sync-write may coexist and replaces the committed entry
/// atomically on commit.
#[derive(Debug, Clone)]
pub struct StoredValue {
    pub cas: u64,
    pub seqno: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiry: u32,
    pub datatype: Datatype,
    /// None when the value has been ejected to disk.
    pub value: Option<Vec<u8>>,
    pub deleted: bool,
    pub committed: CommittedState,
    pub locked_until: Option<Instant>,
    pub temp: Option<TempState>,
    /// Set on mutation, cleared once the flusher has persisted the seqno.
    pub dirty: bool,
    /// Not-recently-used counter for the item pager.
    pub nru: u8,
}

impl StoredValue {
    fn from_item(item: &Item) -> StoredValue {
        StoredValue {
            cas: item.cas(),
            seqno: item.seqno(),
            rev_seqno: item.rev_seqno(),
            flags: item.flags(),
            expiry: item.expiry(),
            datatype: item.datatype(),
            value: Some(item.value().to_vec()),
            deleted: item.is_deleted(),
            committed: item.committed(),
            locked_until: None,
            temp: None,
            dirty: true,
            nru: INITIAL_NRU,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn is_temp(&self) -> bool {
        self.temp.is_some()
    }

    pub fn is_locked(&self, now: Instant) -> bool {
        matches!(self.locked_until, Some(until) if until > now)
    }

    pub fn is_expired(&self, now_unix: u32) -> bool {
        self.expiry != 0 && self.expiry <= now_unix && !self.deleted && !self.is_temp()
    }

    fn mem_size(&self, key: &DocKey) -> usize {
        std::mem::size_of::<StoredValue>()
            + key.len()
            + self.value.as_ref().map_or(0, |v| v.len())
    }
}

#[derive(Debug, Default)]
struct KeyEntry {
    committed: Option<StoredValue>,
    pending: Option<StoredValue>,
}

impl KeyEntry {
    fn is_empty(&self) -> bool {
        self.committed.is_none() && self.pending.is_none()
    }
}

#[derive(Debug, Default)]
pub struct Shard {
    map: HashMap<DocKey, KeyEntry>,
}

/// Counters shared with the owning bucket's quota accounting.
#[derive(Debug, Default)]
pub struct MemCounter {
    bytes: AtomicUsize,
}

impl MemCounter {
    pub fn new() -> Arc<MemCounter> {
        Arc::new(MemCounter::default())
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::SeqCst)
    }

    fn add(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    fn sub(&self, n: usize) {
        self.bytes.fetch_sub(n, Ordering::SeqCst);
    }
}

/// Sharded in-memory index for one partition.
#[derive(Debug)]
pub struct HashTable {
    shards: Vec<Mutex<Shard>>,
    num_items: AtomicUsize,
    num_temp_items: AtomicUsize,
    num_non_resident: AtomicUsize,
    num_pending: AtomicUsize,
    mem_used: AtomicUsize,
    bucket_mem: Arc<MemCounter>,
}

/// Snapshot of hash-table counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashTableStats {
    pub num_items: usize,
    pub num_temp_items: usize,
    pub num_non_resident: usize,
    pub num_pending: usize,
    pub mem_used: usize,
}

impl HashTable {
    pub fn new(num_shards: usize, initial_capacity: usize, bucket_mem: Arc<MemCounter>) -> Self {
        let num_shards = num_shards.max(1);
        let per_shard = (initial_capacity / num_shards).max(1);
        let shards = (0..num_shards)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::with_capacity(per_shard),
                })
            })
            .collect();
        Self {
            shards,
            num_items: AtomicUsize::new(0),
            num_temp_items: AtomicUsize::new(0),
            num_non_resident: AtomicUsize::new(0),
            num_pending: AtomicUsize::new(0),
            mem_used: AtomicUsize::new(0),
            bucket_mem,
        }
    }

    fn shard_idx(&self, key: &DocKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Takes the shard lock for the key. The guard must be held across the
    /// whole read-modify-write; it is never held across I/O.
    pub fn lock_shard(&self, key: &DocKey) -> LockedShard<'_> {
        let idx = self.shard_idx(key);
        LockedShard {
            guard: self.shards[idx].lock().unwrap_or_else(|e| e.into_inner()),
            ht: self,
        }
    }

    /// Locks shard `idx` directly, for visitors that walk every shard.
    pub fn lock_shard_idx(&self, idx: usize) -> LockedShard<'_> {
        LockedShard {
            guard: self.shards[idx].lock().unwrap_or_else(|e| e.into_inner()),
            ht: self,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn stats(&self) -> HashTableStats {
        HashTableStats {
            num_items: self.num_items.load(Ordering::SeqCst),
            num_temp_items: self.num_temp_items.load(Ordering::SeqCst),
            num_non_resident: self.num_non_resident.load(Ordering::SeqCst),
            num_pending: self.num_pending.load(Ordering::SeqCst),
            mem_used: self.mem_used.load(Ordering::SeqCst),
        }
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used.load(Ordering::SeqCst)
    }

    /// The bucket-wide counter this table feeds.
    pub fn bucket_mem(&self) -> &Arc<MemCounter> {
        &self.bucket_mem
    }

    /// Drops every entry. Used by partition reset and rollback-to-zero.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            shard.map.clear();
        }
        self.bucket_mem.sub(self.mem_used.swap(0, Ordering::SeqCst));
        self.num_items.store(0, Ordering::SeqCst);
        self.num_temp_items.store(0, Ordering::SeqCst);
        self.num_non_resident.store(0, Ordering::SeqCst);
        self.num_pending.store(0, Ordering::SeqCst);
    }

    /// Returns an arbitrary committed, resident, live key, scanning shards
    /// from a caller-supplied offset.
    pub fn random_key(&self, start_shard: usize) -> Option<DocKey> {
        let n = self.shards.len();
        for i in 0..n {
            let shard = self.shards[(start_shard + i) % n]
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (key, entry) in shard.map.iter() {
                if let Some(sv) = &entry.committed {
                    if !sv.deleted && !sv.is_temp() && sv.is_resident() {
                        return Some(key.clone());
                    }
                }
            }
        }
        None
    }

    fn account_add(&self, n: usize) {
        self.mem_used.fetch_add(n, Ordering::SeqCst);
        self.bucket_mem.add(n);
    }

    fn account_sub(&self, n: usize) {
        self.mem_used.fetch_sub(n, Ordering::SeqCst);
        self.bucket_mem.sub(n);
    }
}

/// What a shard visitor wants done with the entry it was shown.
pub enum VisitOutcome {
    Keep,
    /// Drop the value, keep the metadata (value eviction).
    EjectValue,
    /// Remove the whole entry.
    Remove,
}

/// A held shard lock plus the entry operations that maintain the table's
/// counters. All mutation of stored values goes through this guard.
pub struct LockedShard<'a> {
    guard: MutexGuard<'a, Shard>,
    ht: &'a HashTable,
}

impl<'a> LockedShard<'a> {
    /// The committed entry for the key, bumping its reference bits.
    pub fn find_for_read(&mut self, key: &DocKey) -> Option<&StoredValue> {
        let entry = self.guard.map.get_mut(key)?;
        let sv = entry.committed.as_mut()?;
        sv.nru = 0;
        Some(&*sv)
    }

    /// The entry a mutation should act on: the pending sync-write when one
    /// is in flight, otherwise the committed entry.
    pub fn find_for_write(&mut self, key: &DocKey) -> Option<&StoredValue> {
        let entry = self.guard.map.get(key)?;
        entry.pending.as_ref().or(entry.committed.as_ref())
    }

    pub fn has_pending(&self, key: &DocKey) -> bool {
        self.guard
            .map
            .get(key)
            .is_some_and(|e| e.pending.is_some())
    }

    pub fn committed(&self, key: &DocKey) -> Option<&StoredValue> {
        self.guard.map.get(key)?.committed.as_ref()
    }

    pub fn pending(&self, key: &DocKey) -> Option<&StoredValue> {
        self.guard.map.get(key)?.pending.as_ref()
    }

    pub fn committed_mut(&mut self, key: &DocKey) -> Option<&mut StoredValue> {
        self.guard.map.get_mut(key)?.committed.as_mut()
    }

    /// Applies a queued item to the table: mutations and deletions replace
    /// the committed entry, prepares occupy the pending slot, commits move
    /// pending to committed, aborts drop the pending slot.
    pub fn apply(&mut self, item: &QueuedItem) -> Result<()> {
        match item.operation() {
            Operation::Mutation | Operation::Deletion | Operation::Expiration => {
                self.upsert_committed(item);
                Ok(())
            }
            Operation::PendingSyncWrite => self.insert_pending(item),
            Operation::CommitSyncWrite => self.commit_pending(item.key()),
            Operation::AbortSyncWrite => {
                self.remove_pending(item.key());
                Ok(())
            }
            op => Err(errlogic!("operation {op:?} cannot be applied to the hash table")),
        }
    }

    fn upsert_committed(&mut self, item: &QueuedItem) {
        let sv = StoredValue::from_item(item);
        let size = sv.mem_size(item.key());
        let entry = self.guard.map.entry(item.key().clone()).or_default();
        match entry.committed.replace(sv) {
            Some(old) => {
                let old_size = old.mem_size(item.key());
                if old.is_temp() {
                    self.ht.num_temp_items.fetch_sub(1, Ordering::SeqCst);
                    self.ht.num_items.fetch_add(1, Ordering::SeqCst);
                }
                if !old.is_resident() {
                    self.ht.num_non_resident.fetch_sub(1, Ordering::SeqCst);
                }
                self.ht.account_sub(old_size);
            }
            None => {
                self.ht.num_items.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.ht.account_add(size);
    }

    fn insert_pending(&mut self, item: &QueuedItem) -> Result<()> {
        let sv = StoredValue::from_item(item);
        let size = sv.mem_size(item.key());
        let entry = self.guard.map.entry(item.key().clone()).or_default();
        if entry.pending.is_some() {
            return Err(errlogic!(
                "duplicate prepare for key {:?}",
                String::from_utf8_lossy(&item.key().key)
            ));
        }
        entry.pending = Some(sv);
        self.ht.num_pending.fetch_add(1, Ordering::SeqCst);
        self.ht.account_add(size);
        Ok(())
    }

    /// Replaces the committed entry with the pending one, atomically under
    /// the shard lock.
    pub fn commit_pending(&mut self, key: &DocKey) -> Result<()> {
        let entry = self
            .guard
            .map
            .get_mut(key)
            .ok_or_else(|| errlogic!("commit for unknown key"))?;
        let mut sv = entry
            .pending
            .take()
            .ok_or_else(|| errlogic!("commit without matching prepare"))?;
        sv.committed = CommittedState::CommittedViaPrepare;
        self.ht.num_pending.fetch_sub(1, Ordering::SeqCst);
        match entry.committed.replace(sv) {
            Some(old) => {
                let old_size = old.mem_size(key);
                if !old.is_resident() {
                    self.ht.num_non_resident.fetch_sub(1, Ordering::SeqCst);
                }
                if old.is_temp() {
                    self.ht.num_temp_items.fetch_sub(1, Ordering::SeqCst);
                    self.ht.num_items.fetch_add(1, Ordering::SeqCst);
                }
                self.ht.account_sub(old_size);
            }
            None => {
                self.ht.num_items.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    pub fn remove_pending(&mut self, key: &DocKey) {
        if let Some(entry) = self.guard.map.get_mut(key) {
            if let Some(old) = entry.pending.take() {
                self.ht.num_pending.fetch_sub(1, Ordering::SeqCst);
                self.ht.account_sub(old.mem_size(key));
            }
            if entry.is_empty() {
                self.guard.map.remove(key);
            }
        }
    }

    /// Removes the whole entry for the key.
    pub fn remove(&mut self, key: &DocKey) {
        if let Some(entry) = self.guard.map.remove(key) {
            if let Some(sv) = entry.committed {
                if sv.is_temp() {
                    self.ht.num_temp_items.fetch_sub(1, Ordering::SeqCst);
                } else {
                    self.ht.num_items.fetch_sub(1, Ordering::SeqCst);
                }
                if !sv.is_resident() {
                    self.ht.num_non_resident.fetch_sub(1, Ordering::SeqCst);
                }
                self.ht.account_sub(sv.mem_size(key));
            }
            if let Some(sv) = entry.pending {
                self.ht.num_pending.fetch_sub(1, Ordering::SeqCst);
                self.ht.account_sub(sv.mem_size(key));
            }
        }
    }

    /// Inserts a temporary entry coordinating a background fetch. Fails
    /// quietly if any entry already exists.
    pub fn insert_temp(&mut self, key: &DocKey, state: TempState) -> bool {
        let entry = self.guard.map.entry(key.clone()).or_default();
        if entry.committed.is_some() {
            return false;
        }
        let sv = StoredValue {
            cas: 1,
            seqno: 0,
            rev_seqno: 0,
            flags: 0,
            expiry: 0,
            datatype: Datatype::RAW,
            value: None,
            deleted: false,
            committed: CommittedState::CommittedViaMutation,
            locked_until: None,
            temp: Some(state),
            dirty: false,
            nru: MAX_NRU,
        };
        let size = sv.mem_size(key);
        entry.committed = Some(sv);
        self.ht.num_temp_items.fetch_add(1, Ordering::SeqCst);
        self.ht.num_non_resident.fetch_add(1, Ordering::SeqCst);
        self.ht.account_add(size);
        true
    }

    /// Replaces a temp entry with the fetched document, marking it clean
    /// (it came from disk).
    pub fn restore_from_fetch(&mut self, item: &QueuedItem) {
        self.upsert_committed(item);
        if let Some(sv) = self.committed_mut(item.key()) {
            sv.dirty = false;
        }
    }

    /// Converts a temp-initial entry into proven-absent.
    pub fn temp_fetch_missed(&mut self, key: &DocKey) {
        if let Some(entry) = self.guard.map.get_mut(key) {
            if let Some(sv) = entry.committed.as_mut() {
                if sv.temp == Some(TempState::Initial) {
                    sv.temp = Some(TempState::NonExistent);
                }
            }
        }
    }

    /// Ejects the value of a clean committed entry, leaving metadata.
    pub fn eject_value(&mut self, key: &DocKey) -> bool {
        let Some(entry) = self.guard.map.get_mut(key) else {
            return false;
        };
        let Some(sv) = entry.committed.as_mut() else {
            return false;
        };
        if sv.dirty || sv.deleted || sv.is_temp() || !sv.is_resident() {
            return false;
        }
        let Some(value) = sv.value.take() else {
            return false;
        };
        self.ht.num_non_resident.fetch_add(1, Ordering::SeqCst);
        self.ht.account_sub(value.len());
        true
    }

    /// Clears the dirty flag on entries at or below the persisted seqno.
    pub fn mark_clean_upto(&mut self, key: &DocKey, seqno: u64) {
        if let Some(entry) = self.guard.map.get_mut(key) {
            for sv in [entry.committed.as_mut(), entry.pending.as_mut()]
                .into_iter()
                .flatten()
            {
                if sv.seqno <= seqno {
                    sv.dirty = false;
                }
            }
        }
    }

    /// Walks every committed entry in this shard, applying the visitor's
    /// verdict. Used by the expiry and item pagers.
    pub fn visit(&mut self, mut f: impl FnMut(&DocKey, &mut StoredValue) -> VisitOutcome) {
        let mut eject: Vec<DocKey> = Vec::new();
        let mut remove: Vec<DocKey> = Vec::new();
        for (key, entry) in self.guard.map.iter_mut() {
            if let Some(sv) = entry.committed.as_mut() {
                match f(key, sv) {
                    VisitOutcome::Keep => {}
                    VisitOutcome::EjectValue => eject.push(key.clone()),
                    VisitOutcome::Remove => remove.push(key.clone()),
                }
            }
        }
        for key in eject {
            self.eject_value(&key);
        }
        for key in remove {
            self.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::DurabilityRequirement;
    use std::sync::Arc;

    fn table() -> HashTable {
        HashTable::new(4, 16, MemCounter::new())
    }

    fn mutation(key: &[u8], value: &[u8], cas: u64, seqno: u64) -> QueuedItem {
        let item = Item::new(
            DocKey::plain(key),
            value.to_vec(),
            0,
            Datatype::RAW,
            0,
            cas,
            Operation::Mutation,
            None,
        )
        .unwrap();
        item.set_seqno(seqno);
        Arc::new(item)
    }

    fn prepare(key: &[u8], value: &[u8], cas: u64, seqno: u64) -> QueuedItem {
        let item = Item::new(
            DocKey::plain(key),
            value.to_vec(),
            0,
            Datatype::RAW,
            0,
            cas,
            Operation::PendingSyncWrite,
            Some(DurabilityRequirement::majority()),
        )
        .unwrap();
        item.set_seqno(seqno);
        Arc::new(item)
    }

    fn commit_item(key: &[u8], cas: u64, seqno: u64) -> QueuedItem {
        let item = Item::new(
            DocKey::plain(key),
            Vec::new(),
            0,
            Datatype::RAW,
            0,
            cas,
            Operation::CommitSyncWrite,
            None,
        )
        .unwrap();
        item.set_seqno(seqno);
        Arc::new(item)
    }

    #[test]
    fn test_apply_and_read() {
        let ht = table();
        let key = DocKey::plain(b"k1");

        let mut shard = ht.lock_shard(&key);
        shard.apply(&mutation(b"k1", b"v1", 10, 1)).unwrap();
        let sv = shard.find_for_read(&key).unwrap();
        assert_eq!(sv.value.as_deref(), Some(b"v1".as_ref()));
        assert_eq!(sv.cas, 10);
        assert_eq!(sv.seqno, 1);
        drop(shard);

        assert_eq!(ht.stats().num_items, 1);
        assert!(ht.mem_used() > 0);
    }

    #[test]
    fn test_update_replaces_committed() {
        let ht = table();
        let key = DocKey::plain(b"k1");

        let mut shard = ht.lock_shard(&key);
        shard.apply(&mutation(b"k1", b"v1", 10, 1)).unwrap();
        shard.apply(&mutation(b"k1", b"v2-longer", 11, 2)).unwrap();
        let sv = shard.find_for_read(&key).unwrap();
        assert_eq!(sv.value.as_deref(), Some(b"v2-longer".as_ref()));
        assert_eq!(sv.seqno, 2);
        drop(shard);

        assert_eq!(ht.stats().num_items, 1);
    }

    #[test]
    fn test_pending_coexists_until_commit() {
        let ht = table();
        let key = DocKey::plain(b"k1");

        let mut shard = ht.lock_shard(&key);
        shard.apply(&mutation(b"k1", b"old", 10, 1)).unwrap();
        shard.apply(&prepare(b"k1", b"new", 11, 2)).unwrap();

        // Reads still see the committed entry
        assert_eq!(
            shard.find_for_read(&key).unwrap().value.as_deref(),
            Some(b"old".as_ref())
        );
        // Writes see the pending entry
        assert_eq!(
            shard.find_for_write(&key).unwrap().value.as_deref(),
            Some(b"new".as_ref())
        );
        assert_eq!(ht.num_pending.load(Ordering::SeqCst), 1);

        shard.apply(&commit_item(b"k1", 12, 3)).unwrap();
        let sv = shard.find_for_read(&key).unwrap();
        assert_eq!(sv.value.as_deref(), Some(b"new".as_ref()));
        assert_eq!(sv.committed, CommittedState::CommittedViaPrepare);
        drop(shard);

        assert_eq!(ht.stats().num_pending, 0);
        assert_eq!(ht.stats().num_items, 1);
    }

    #[test]
    fn test_duplicate_prepare_is_logic_error() {
        let ht = table();
        let key = DocKey::plain(b"k1");
        let mut shard = ht.lock_shard(&key);
        shard.apply(&prepare(b"k1", b"a", 10, 1)).unwrap();
        let err = shard.apply(&prepare(b"k1", b"b", 11, 2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_commit_without_prepare_is_logic_error() {
        let ht = table();
        let key = DocKey::plain(b"k1");
        let mut shard = ht.lock_shard(&key);
        shard.apply(&mutation(b"k1", b"v", 10, 1)).unwrap();
        let err = shard.apply(&commit_item(b"k1", 11, 2)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_eject_value_keeps_metadata() {
        let ht = table();
        let key = DocKey::plain(b"k1");

        let mut shard = ht.lock_shard(&key);
        shard.apply(&mutation(b"k1", b"value-bytes", 10, 1)).unwrap();
        // Dirty entries cannot be ejected
        assert!(!shard.eject_value(&key));
        shard.mark_clean_upto(&key, 1);
        assert!(shard.eject_value(&key));

        let sv = shard.find_for_read(&key).unwrap();
        assert!(!sv.is_resident());
        assert_eq!(sv.cas, 10);
        drop(shard);

        assert_eq!(ht.stats().num_non_resident, 1);
    }

    #[test]
    fn test_temp_entries() {
        let ht = table();
        let key = DocKey::plain(b"k1");

        let mut shard = ht.lock_shard(&key);
        assert!(shard.insert_temp(&key, TempState::Initial));
        // Second insert is suppressed
        assert!(!shard.insert_temp(&key, TempState::Initial));
        shard.temp_fetch_missed(&key);
        assert_eq!(
            shard.committed(&key).unwrap().temp,
            Some(TempState::NonExistent)
        );
        drop(shard);

        assert_eq!(ht.stats().num_temp_items, 1);
        assert_eq!(ht.stats().num_items, 0);

        // A real mutation converts the temp entry
        let mut shard = ht.lock_shard(&key);
        shard.apply(&mutation(b"k1", b"v", 10, 1)).unwrap();
        drop(shard);
        assert_eq!(ht.stats().num_temp_items, 0);
        assert_eq!(ht.stats().num_items, 1);
    }

    #[test]
    fn test_clear_resets_counters() {
        let ht = table();
        for i in 0..20u32 {
            let key_bytes = format!("key{i}");
            let item = mutation(key_bytes.as_bytes(), b"v", 10 + i as u64, 1 + i as u64);
            let mut shard = ht.lock_shard(item.key());
            shard.apply(&item).unwrap();
        }
        assert_eq!(ht.stats().num_items, 20);
        ht.clear();
        assert_eq!(ht.stats().num_items, 0);
        assert_eq!(ht.mem_used(), 0);
    }

    #[test]
    fn test_bucket_counter_shared() {
        let counter = MemCounter::new();
        let ht1 = HashTable::new(2, 8, Arc::clone(&counter));
        let ht2 = HashTable::new(2, 8, Arc::clone(&counter));

        let item = mutation(b"a", b"1", 5, 1);
        ht1.lock_shard(item.key()).apply(&item).unwrap();
        let item = mutation(b"b", b"2", 6, 1);
        ht2.lock_shard(item.key()).apply(&item).unwrap();

        assert_eq!(counter.bytes(), ht1.mem_used() + ht2.mem_used());
    }

    #[test]
    fn test_random_key_skips_deleted_and_temp() {
        let ht = table();
        let live = mutation(b"live", b"v", 5, 1);
        ht.lock_shard(live.key()).apply(&live).unwrap();

        let key = DocKey::plain(b"absent");
        ht.lock_shard(&key).insert_temp(&key, TempState::NonExistent);

        let found = ht.random_key(3).unwrap();
        assert_eq!(found, DocKey::plain(b"live"));
    }

    #[test]
    fn test_visit_outcomes() {
        let ht = table();
        for (k, v) in [(b"a".as_ref(), b"1".as_ref()), (b"b".as_ref(), b"2".as_ref())] {
            let item = mutation(k, v, 5, 1);
            let mut shard = ht.lock_shard(item.key());
            shard.apply(&item).unwrap();
            shard.mark_clean_upto(item.key(), 1);
        }

        for idx in 0..ht.num_shards() {
            let mut shard = ht.lock_shard_idx(idx);
            shard.visit(|key, _| {
                if key.key == b"a" {
                    VisitOutcome::Remove
                } else {
                    VisitOutcome::EjectValue
                }
            });
        }

        assert_eq!(ht.stats().num_items, 1);
        assert_eq!(ht.stats().num_non_resident, 1);
        let key_b = DocKey::plain(b"b");
        let mut shard = ht.lock_shard(&key_b);
        assert!(!shard.find_for_read(&key_b).unwrap().is_resident());
    }
}
