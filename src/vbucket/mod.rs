//! A partition (vBucket): the unit of replication and failover.
//!
//! Composes the hash table, checkpoint manager, failover table and
//! durability monitor, and drives the admission pipeline for client
//! operations. State transitions take the state lock for writing; every
//! mutator and getter takes it for reading, so an in-progress transition
//! blocks them. Within one partition at most one writer advances the seqno:
//! the checkpoint lock is acquired first, then the hash-table shard lock,
//! and both are held across the read-modify-write (never across I/O).

pub mod bloom;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;

use crate::checkpoint::{CheckpointManager, CheckpointWriter};
use crate::collections::CollectionsManifest;
use crate::config::{EngineConfig, EvictionPolicy};
use crate::cookie::Cookie;
use crate::durability::{DurabilityMonitor, SyncWrite};
use crate::errinval;
use crate::errlogic;
use crate::error::{Error, Result};
use crate::failover::{FailoverTable, StreamHistory};
use crate::hashtable::{HashTable, MemCounter, VisitOutcome};
use crate::item::{
    now_unix, expiry_from_ttl, Datatype, DocKey, DurabilityRequirement, HybridClock, Item,
    Operation, QueuedItem, Vbid,
};
use crate::kvstore::PersistedDoc;
use crate::vbstate::{VBucketState, VbState};

use bloom::BloomFilter;

/// Default lock duration for get-with-lock when the client passes zero.
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(15);

/// Options for set/add/replace.
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// 0 means "don't check".
    pub cas: u64,
    pub flags: u32,
    pub ttl: Duration,
    pub datatype: Datatype,
    pub durability: Option<DurabilityRequirement>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            cas: 0,
            flags: 0,
            ttl: Duration::ZERO,
            datatype: Datatype::RAW,
            durability: None,
        }
    }
}

/// Options for delete.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    pub cas: u64,
    pub durability: Option<DurabilityRequirement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub cas: u64,
    pub seqno: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOutcome {
    pub value: Vec<u8>,
    pub cas: u64,
    pub flags: u32,
    pub datatype: Datatype,
    pub seqno: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Set,
    Add,
    Replace,
}

/// Snapshot of a committed entry taken under the shard lock.
#[derive(Debug, Clone, Copy)]
struct CurrentMeta {
    cas: u64,
    rev_seqno: u64,
    live: bool,
    locked: bool,
    resident: bool,
}

pub struct VBucket {
    id: Vbid,
    config: Arc<EngineConfig>,
    state: RwLock<VbState>,
    pub(crate) ht: HashTable,
    pub(crate) checkpoint: CheckpointManager,
    failover: Mutex<FailoverTable>,
    durability: DurabilityMonitor,
    hlc: HybridClock,
    manifest: RwLock<Arc<CollectionsManifest>>,
    bloom: Mutex<BloomFilter>,
    pending_ops: Mutex<Vec<Cookie>>,
    pending_fetches: Mutex<HashMap<DocKey, Vec<Cookie>>>,
    max_deleted_seqno: AtomicU64,
    persisted_seqno: AtomicU64,
    purge_seqno: AtomicU64,
    might_contain_xattrs: AtomicBool,
    takeover_backed_up: AtomicBool,
    seqno_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for VBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VBucket").field("id", &self.id).finish()
    }
}

impl VBucket {
    /// A fresh partition with no persisted history.
    pub fn new(
        id: Vbid,
        state: VbState,
        config: Arc<EngineConfig>,
        bucket_mem: Arc<MemCounter>,
    ) -> Arc<VBucket> {
        let failover = FailoverTable::new(config.max_failover_entries, &mut rand::thread_rng());
        Self::build(id, state, config, bucket_mem, failover, 0, None)
    }

    /// Rebuilds a partition from its persisted state blob at warm-up.
    pub fn from_persisted(
        id: Vbid,
        persisted: &VBucketState,
        high_seqno: u64,
        config: Arc<EngineConfig>,
        bucket_mem: Arc<MemCounter>,
    ) -> Arc<VBucket> {
        let failover = if persisted.failover_table.is_empty() {
            FailoverTable::new(config.max_failover_entries, &mut rand::thread_rng())
        } else {
            FailoverTable::from_entries(
                persisted.failover_table.clone(),
                config.max_failover_entries,
            )
        };
        Self::build(
            id,
            persisted.state,
            config,
            bucket_mem,
            failover,
            high_seqno,
            Some(persisted),
        )
    }

    fn build(
        id: Vbid,
        state: VbState,
        config: Arc<EngineConfig>,
        bucket_mem: Arc<MemCounter>,
        failover: FailoverTable,
        high_seqno: u64,
        persisted: Option<&VBucketState>,
    ) -> Arc<VBucket> {
        let ht = HashTable::new(config.ht_locks, config.ht_size, bucket_mem);
        let checkpoint = CheckpointManager::new(
            id,
            config.chk_max_items,
            config.chk_max_age,
            high_seqno,
        );
        let hlc = HybridClock::new();
        let (seqno_tx, _) = watch::channel(high_seqno);
        let vb = VBucket {
            id,
            state: RwLock::new(state),
            ht,
            checkpoint,
            failover: Mutex::new(failover),
            durability: DurabilityMonitor::new(id),
            hlc,
            manifest: RwLock::new(Arc::new(CollectionsManifest::epoch())),
            bloom: Mutex::new(BloomFilter::with_default_size()),
            pending_ops: Mutex::new(Vec::new()),
            pending_fetches: Mutex::new(HashMap::new()),
            max_deleted_seqno: AtomicU64::new(0),
            persisted_seqno: AtomicU64::new(high_seqno),
            purge_seqno: AtomicU64::new(0),
            might_contain_xattrs: AtomicBool::new(false),
            takeover_backed_up: AtomicBool::new(false),
            seqno_tx,
            config,
        };
        if let Some(p) = persisted {
            vb.hlc.observe_cas(p.max_cas);
            vb.max_deleted_seqno.store(p.max_deleted_seqno, Ordering::SeqCst);
            vb.might_contain_xattrs
                .store(p.might_contain_xattrs, Ordering::SeqCst);
        }
        tracing::info!(vbid = %id, state = %state, high_seqno, "created vbucket");
        Arc::new(vb)
    }

    pub fn id(&self) -> Vbid {
        self.id
    }

    pub fn state(&self) -> VbState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn high_seqno(&self) -> u64 {
        self.checkpoint.high_seqno()
    }

    pub fn persisted_seqno(&self) -> u64 {
        self.persisted_seqno.load(Ordering::SeqCst)
    }

    pub fn purge_seqno(&self) -> u64 {
        self.purge_seqno.load(Ordering::SeqCst)
    }

    /// Advances the purge horizon after the store compacted tombstones.
    /// Streams asked to resume from below it must rollback to zero.
    pub fn note_purged_upto(&self, seqno: u64) {
        self.purge_seqno.fetch_max(seqno, Ordering::SeqCst);
    }

    /// True while bucket memory is too high to admit backfill buffers.
    pub fn backfills_deferred(&self) -> bool {
        let cap = (self.config.max_size as f64 * self.config.backfill_mem_threshold) as usize;
        self.ht.bucket_mem().bytes() >= cap
    }

    pub fn durability_monitor(&self) -> &DurabilityMonitor {
        &self.durability
    }

    pub fn hashtable_stats(&self) -> crate::hashtable::HashTableStats {
        self.ht.stats()
    }

    pub fn checkpoint_stats(&self) -> crate::checkpoint::CheckpointStats {
        self.checkpoint.stats()
    }

    pub fn failover_entries(&self) -> Vec<crate::failover::FailoverEntry> {
        self.failover
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries()
            .to_vec()
    }

    /// Wakes whenever the high seqno moves or the state changes.
    pub fn subscribe_seqno(&self) -> watch::Receiver<u64> {
        self.seqno_tx.subscribe()
    }

    pub fn set_takeover_backed_up(&self, backed_up: bool) {
        self.takeover_backed_up.store(backed_up, Ordering::SeqCst);
    }

    pub fn register_replication_chain(&self, nodes: Vec<String>) -> Result<()> {
        self.durability.register_replication_chain(nodes)
    }

    /// Swaps the manifest in without queueing anything. Used at warm-up
    /// and partition creation, where the event history already exists or
    /// is not wanted.
    pub fn install_manifest(&self, manifest: Arc<CollectionsManifest>) {
        *self.manifest.write().unwrap_or_else(|e| e.into_inner()) = manifest;
    }

    pub fn update_manifest(&self, manifest: Arc<CollectionsManifest>) -> Result<()> {
        if self.state() == VbState::Dead {
            return Err(Error::CannotApplyCollectionsManifest);
        }
        let uid = manifest.uid;
        self.install_manifest(manifest);
        // Stream consumers learn about the manifest change in seqno order.
        let event = Item::new(
            DocKey::plain(format!("_manifest:{uid}")),
            uid.to_be_bytes().to_vec(),
            0,
            Datatype::RAW,
            0,
            self.hlc.next_cas(),
            Operation::SystemEvent,
            None,
        )?;
        let qi = QueuedItem::new(event);
        self.checkpoint.lock().queue_dirty(&qi)?;
        self.notify_seqno();
        Ok(())
    }

    fn notify_seqno(&self) {
        let _ = self.seqno_tx.send(self.checkpoint.high_seqno());
    }

    fn check_collection(&self, key: &DocKey) -> Result<()> {
        let manifest = self.manifest.read().unwrap_or_else(|e| e.into_inner());
        if manifest.contains(key.collection) {
            Ok(())
        } else {
            Err(Error::UnknownCollection)
        }
    }

    /// Front-half of client admission: state, pending parking, takeover
    /// backpressure.
    fn check_client_access(&self, state: VbState, cookie: Option<&Cookie>) -> Result<()> {
        match state {
            VbState::Dead | VbState::Replica => Err(Error::NotMyVbucket),
            VbState::Pending => {
                if let Some(cookie) = cookie {
                    self.pending_ops
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(cookie.clone());
                }
                Err(Error::WouldBlock)
            }
            VbState::Active => {
                if self.takeover_backed_up.load(Ordering::SeqCst) {
                    Err(Error::TempFailure)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn validate_key_value(&self, key: &DocKey, value_len: usize) -> Result<()> {
        if key.is_empty() || key.len() > self.config.max_key_len {
            return Err(errinval!(
                "key length {} outside 1..={}",
                key.len(),
                self.config.max_key_len
            ));
        }
        if value_len > self.config.max_item_size {
            return Err(Error::TooBig);
        }
        Ok(())
    }

    pub fn set(&self, key: DocKey, value: Vec<u8>, opts: SetOptions, cookie: &Cookie) -> Result<MutationOutcome> {
        self.store(StoreMode::Set, key, value, opts, cookie)
    }

    pub fn add(&self, key: DocKey, value: Vec<u8>, opts: SetOptions, cookie: &Cookie) -> Result<MutationOutcome> {
        self.store(StoreMode::Add, key, value, opts, cookie)
    }

    pub fn replace(&self, key: DocKey, value: Vec<u8>, opts: SetOptions, cookie: &Cookie) -> Result<MutationOutcome> {
        self.store(StoreMode::Replace, key, value, opts, cookie)
    }

    fn store(
        &self,
        mode: StoreMode,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
        cookie: &Cookie,
    ) -> Result<MutationOutcome> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        self.check_client_access(*state, Some(cookie))?;
        self.validate_key_value(&key, value.len())?;
        if opts.cas == u64::MAX {
            return Err(errinval!("reserved cas value"));
        }
        self.check_collection(&key)?;
        if opts.durability.is_some() && !self.durability.has_chain() {
            return Err(Error::DurabilityImpossible);
        }

        let expiry = expiry_from_ttl(opts.ttl, self.config.max_ttl, now_unix());

        let mut ckpt = self.checkpoint.lock();
        let mut shard = self.ht.lock_shard(&key);

        if shard.has_pending(&key) {
            return Err(Error::SyncWriteInProgress);
        }
        let now = Instant::now();
        let now_u = now_unix();
        let current = shard.committed(&key).map(|sv| CurrentMeta {
            cas: sv.cas,
            rev_seqno: sv.rev_seqno,
            live: !sv.deleted && !sv.is_temp() && !sv.is_expired(now_u),
            locked: sv.is_locked(now),
            resident: sv.is_resident(),
        });
        let live = current.filter(|c| c.live);

        if let Some(c) = live {
            // A matching CAS releases the lock; anything else bounces.
            if c.locked && opts.cas != c.cas {
                return Err(Error::Locked);
            }
        }
        if opts.cas != 0 {
            match live {
                None => return Err(Error::KeyMissing),
                Some(c) if c.cas != opts.cas => return Err(Error::KeyExists),
                Some(_) => {}
            }
        }
        match mode {
            StoreMode::Add if live.is_some() => return Err(Error::KeyExists),
            StoreMode::Replace if live.is_none() => return Err(Error::KeyMissing),
            _ => {}
        }
        // Full-eviction caveat: without metadata we cannot prove absence
        // for add; a clean bloom filter can.
        if mode == StoreMode::Add
            && live.is_none()
            && current.is_none()
            && self.config.item_eviction_policy == EvictionPolicy::FullEviction
            && self.config.bfilter_enabled
        {
            let bloom = self.bloom.lock().unwrap_or_else(|e| e.into_inner());
            if bloom.maybe_contains(&key) {
                drop(bloom);
                drop(shard);
                drop(ckpt);
                self.enqueue_fetch(key, cookie.clone());
                return Err(Error::WouldBlock);
            }
        }

        let rev_seqno = current.map(|c| c.rev_seqno).unwrap_or(0) + 1;
        let cas = self.hlc.next_cas();
        let op = if opts.durability.is_some() {
            Operation::PendingSyncWrite
        } else {
            Operation::Mutation
        };
        if opts.datatype.contains(Datatype::XATTR) {
            self.might_contain_xattrs.store(true, Ordering::SeqCst);
        }
        let mut item = Item::new(
            key.clone(),
            value,
            opts.flags,
            opts.datatype,
            expiry,
            cas,
            op,
            opts.durability,
        )?;
        item.set_rev_seqno(rev_seqno);
        let qi = QueuedItem::new(item);
        let queued = ckpt.queue_dirty(&qi)?;
        shard.apply(&qi)?;

        if let Some(req) = opts.durability {
            let committable = self.durability.add_sync_write(
                Some(cookie.clone()),
                key.clone(),
                queued.seqno,
                req,
                self.config.sync_write_timeout,
            )?;
            drop(shard);
            self.complete_commits(&mut ckpt, committable)?;
            drop(ckpt);
            self.bloom_add(&key);
            self.notify_seqno();
            // The caller blocks on the cookie until commit or abort.
            return Err(Error::WouldBlock);
        }

        drop(shard);
        drop(ckpt);
        self.bloom_add(&key);
        self.notify_seqno();
        Ok(MutationOutcome {
            cas,
            seqno: queued.seqno,
        })
    }

    pub fn delete(&self, key: DocKey, opts: DeleteOptions, cookie: &Cookie) -> Result<MutationOutcome> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        self.check_client_access(*state, Some(cookie))?;
        self.validate_key_value(&key, 0)?;
        if opts.cas == u64::MAX {
            return Err(errinval!("reserved cas value"));
        }
        self.check_collection(&key)?;
        if opts.durability.is_some() && !self.durability.has_chain() {
            return Err(Error::DurabilityImpossible);
        }

        let mut ckpt = self.checkpoint.lock();
        let mut shard = self.ht.lock_shard(&key);

        if shard.has_pending(&key) {
            return Err(Error::SyncWriteInProgress);
        }
        let now = Instant::now();
        let now_u = now_unix();
        let current = shard.committed(&key).map(|sv| CurrentMeta {
            cas: sv.cas,
            rev_seqno: sv.rev_seqno,
            live: !sv.deleted && !sv.is_temp() && !sv.is_expired(now_u),
            locked: sv.is_locked(now),
            resident: sv.is_resident(),
        });
        let Some(c) = current.filter(|c| c.live) else {
            return Err(Error::KeyMissing);
        };
        if c.locked && opts.cas != c.cas {
            return Err(Error::Locked);
        }
        if opts.cas != 0 && c.cas != opts.cas {
            return Err(Error::KeyExists);
        }

        let rev_seqno = c.rev_seqno + 1;
        let cas = self.hlc.next_cas();
        let item = match opts.durability {
            Some(req) => Item::pending_delete(key.clone(), cas, rev_seqno, req)?,
            None => Item::deleted(key.clone(), cas, Operation::Deletion, rev_seqno)?,
        };
        let qi = QueuedItem::new(item);
        let queued = ckpt.queue_dirty(&qi)?;
        shard.apply(&qi)?;
        self.max_deleted_seqno.fetch_max(queued.seqno, Ordering::SeqCst);

        if let Some(req) = opts.durability {
            let committable = self.durability.add_sync_write(
                Some(cookie.clone()),
                key.clone(),
                queued.seqno,
                req,
                self.config.sync_write_timeout,
            )?;
            drop(shard);
            self.complete_commits(&mut ckpt, committable)?;
            drop(ckpt);
            self.notify_seqno();
            return Err(Error::WouldBlock);
        }

        drop(shard);
        drop(ckpt);
        self.notify_seqno();
        Ok(MutationOutcome {
            cas,
            seqno: queued.seqno,
        })
    }

    pub fn get(&self, key: &DocKey, cookie: &Cookie) -> Result<GetOutcome> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        self.check_client_access(*state, Some(cookie))?;
        self.check_collection(key)?;

        enum Verdict {
            Hit(GetOutcome),
            Missing,
            FetchInFlight,
            Expired,
            NonResident,
            Absent,
        }

        let now_u = now_unix();
        let mut shard = self.ht.lock_shard(key);
        let verdict = match shard.find_for_read(key) {
            None => Verdict::Absent,
            Some(sv) if sv.temp == Some(crate::hashtable::TempState::NonExistent) => {
                Verdict::Missing
            }
            Some(sv) if sv.is_temp() => Verdict::FetchInFlight,
            Some(sv) if sv.deleted => Verdict::Missing,
            Some(sv) if sv.is_expired(now_u) => Verdict::Expired,
            Some(sv) if !sv.is_resident() => Verdict::NonResident,
            Some(sv) => Verdict::Hit(GetOutcome {
                value: sv.value.clone().unwrap_or_default(),
                cas: sv.cas,
                flags: sv.flags,
                datatype: sv.datatype,
                seqno: sv.seqno,
            }),
        };

        match verdict {
            Verdict::Hit(outcome) => Ok(outcome),
            Verdict::Missing => Err(Error::KeyMissing),
            Verdict::FetchInFlight | Verdict::NonResident => {
                drop(shard);
                self.enqueue_fetch(key.clone(), cookie.clone());
                Err(Error::WouldBlock)
            }
            Verdict::Expired => {
                drop(shard);
                // Release the state lock before re-entering through the
                // expiry path, which takes its own read lock.
                drop(state);
                let _ = self.process_expiry(key, now_u);
                Err(Error::KeyMissing)
            }
            Verdict::Absent => match self.config.item_eviction_policy {
                EvictionPolicy::ValueOnly => Err(Error::KeyMissing),
                EvictionPolicy::FullEviction => {
                    if self.config.bfilter_enabled {
                        let bloom = self.bloom.lock().unwrap_or_else(|e| e.into_inner());
                        if !bloom.maybe_contains(key) {
                            return Err(Error::KeyMissing);
                        }
                    }
                    shard.insert_temp(key, crate::hashtable::TempState::Initial);
                    drop(shard);
                    self.enqueue_fetch(key.clone(), cookie.clone());
                    Err(Error::WouldBlock)
                }
            },
        }
    }

    /// Get-with-lock: the document is locked for `duration` (default 15s)
    /// and the returned CAS is the unlock token.
    pub fn get_locked(
        &self,
        key: &DocKey,
        duration: Duration,
        cookie: &Cookie,
    ) -> Result<GetOutcome> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        self.check_client_access(*state, Some(cookie))?;
        self.check_collection(key)?;

        let duration = if duration.is_zero() {
            DEFAULT_LOCK_DURATION
        } else {
            duration
        };
        let now = Instant::now();
        let now_u = now_unix();
        let mut shard = self.ht.lock_shard(key);
        if shard.committed(key).is_none() {
            return match self.config.item_eviction_policy {
                EvictionPolicy::ValueOnly => Err(Error::KeyMissing),
                EvictionPolicy::FullEviction => {
                    shard.insert_temp(key, crate::hashtable::TempState::Initial);
                    drop(shard);
                    self.enqueue_fetch(key.clone(), cookie.clone());
                    Err(Error::WouldBlock)
                }
            };
        }
        {
            let sv = shard.committed(key).expect("checked above");
            if sv.is_temp() || sv.deleted || sv.is_expired(now_u) {
                return Err(Error::KeyMissing);
            }
            if sv.is_locked(now) {
                return Err(Error::LockedTempFailure);
            }
            if !sv.is_resident() {
                drop(shard);
                self.enqueue_fetch(key.clone(), cookie.clone());
                return Err(Error::WouldBlock);
            }
        }
        // The lock token is a fresh CAS, changed in the hash table only;
        // nothing is streamed for a lock.
        let token = self.hlc.next_cas();
        let sv = shard.committed_mut(key).expect("checked above");
        sv.cas = token;
        sv.locked_until = Some(now + duration);
        Ok(GetOutcome {
            value: sv.value.clone().unwrap_or_default(),
            cas: token,
            flags: sv.flags,
            datatype: sv.datatype,
            seqno: sv.seqno,
        })
    }

    pub fn unlock(&self, key: &DocKey, cas: u64, cookie: &Cookie) -> Result<()> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        self.check_client_access(*state, Some(cookie))?;
        let now = Instant::now();
        let now_u = now_unix();
        let mut shard = self.ht.lock_shard(key);
        let Some(sv) = shard.committed_mut(key) else {
            return Err(Error::KeyMissing);
        };
        if sv.is_temp() || sv.deleted || sv.is_expired(now_u) {
            return Err(Error::KeyMissing);
        }
        if !sv.is_locked(now) {
            return Err(Error::TempFailure);
        }
        if sv.cas != cas {
            return Err(Error::Locked);
        }
        sv.locked_until = None;
        Ok(())
    }

    /// Replaces an expired document with an expiration record. Runs the
    /// pre-expiry hook (value and xattrs are scrubbed). Driven by the
    /// expiry pager and by access-triggered expiry.
    pub fn process_expiry(&self, key: &DocKey, now_u: u32) -> Result<bool> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if *state != VbState::Active {
            return Ok(false);
        }
        let mut ckpt = self.checkpoint.lock();
        let mut shard = self.ht.lock_shard(key);
        if shard.has_pending(key) {
            return Ok(false);
        }
        let Some(sv) = shard.committed(key) else {
            return Ok(false);
        };
        if !sv.is_expired(now_u) {
            return Ok(false);
        }
        let rev_seqno = sv.rev_seqno + 1;
        // Pre-expiry hook point: the expiration record carries no value.
        let item = Item::deleted(
            key.clone(),
            self.hlc.next_cas(),
            Operation::Expiration,
            rev_seqno,
        )?;
        let qi = QueuedItem::new(item);
        let queued = ckpt.queue_dirty(&qi)?;
        shard.apply(&qi)?;
        self.max_deleted_seqno.fetch_max(queued.seqno, Ordering::SeqCst);
        drop(shard);
        drop(ckpt);
        self.notify_seqno();
        Ok(true)
    }

    /// One expiry-pager pass: scan every shard for expired documents and
    /// queue expirations. Returns how many documents expired.
    pub fn expire_due_items(&self, now_u: u32) -> usize {
        let mut candidates = Vec::new();
        for idx in 0..self.ht.num_shards() {
            let mut shard = self.ht.lock_shard_idx(idx);
            shard.visit(|key, sv| {
                if sv.is_expired(now_u) {
                    candidates.push(key.clone());
                }
                VisitOutcome::Keep
            });
        }
        let mut expired = 0;
        for key in candidates {
            if self.process_expiry(&key, now_u).unwrap_or(false) {
                expired += 1;
            }
        }
        expired
    }

    fn bloom_add(&self, key: &DocKey) {
        if self.config.bfilter_enabled {
            self.bloom
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .add(key);
        }
    }

    fn enqueue_fetch(&self, key: DocKey, cookie: Cookie) {
        self.pending_fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key)
            .or_default()
            .push(cookie);
    }

    pub fn has_pending_fetches(&self) -> bool {
        !self
            .pending_fetches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Hands the queued background fetches to the fetcher.
    pub fn drain_pending_fetches(&self) -> HashMap<DocKey, Vec<Cookie>> {
        std::mem::take(
            &mut *self
                .pending_fetches
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }

    /// Applies a completed background fetch and notifies the waiting
    /// cookies. A hit restores residency; a miss proves absence.
    pub fn complete_fetch(&self, key: &DocKey, doc: Option<PersistedDoc>, cookies: Vec<Cookie>) {
        let status = match doc {
            Some(doc) if !doc.deleted => {
                let restored = doc.to_item().map(QueuedItem::new);
                match restored {
                    Ok(item) => {
                        let mut shard = self.ht.lock_shard(key);
                        let stale = shard
                            .committed(key)
                            .is_some_and(|sv| !sv.is_temp() && sv.seqno > item.seqno());
                        if !stale {
                            shard.restore_from_fetch(&item);
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            _ => {
                let mut shard = self.ht.lock_shard(key);
                shard.temp_fetch_missed(key);
                Err(Error::KeyMissing)
            }
        };
        for cookie in cookies {
            cookie.notify(status.clone());
        }
    }

    /// Restores a document during warm-up or post-rollback reload; the
    /// entry arrives clean.
    pub fn restore_doc(&self, doc: &PersistedDoc) -> Result<()> {
        let item = QueuedItem::new(doc.to_item()?);
        let mut shard = self.ht.lock_shard(item.key());
        if !item.is_deleted() {
            shard.restore_from_fetch(&item);
        }
        drop(shard);
        self.bloom_add(&doc.key);
        self.hlc.observe_cas(doc.cas);
        Ok(())
    }

    /// State transition. Takes the state write lock, so it waits for all
    /// in-flight mutators. Promotions to active mint a failover entry;
    /// demotions from active abort every in-flight sync write.
    pub fn set_state(&self, new: VbState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let old = *state;
        if old == new {
            return Ok(());
        }
        *state = new;
        tracing::info!(vbid = %self.id, from = %old, to = %new, "vbucket state change");

        if new == VbState::Active {
            let high = self.checkpoint.high_seqno();
            let entry = self
                .failover
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .create_entry(high, &mut rand::thread_rng());
            tracing::info!(vbid = %self.id, uuid = entry.uuid, seqno = entry.seqno,
                "minted failover entry");
        }
        if old == VbState::Active {
            let aborted = self.durability.abort_all();
            if !aborted.is_empty() {
                self.complete_aborts(aborted, Error::SyncWriteAmbiguous)?;
            }
        }

        // Resume operations parked while the partition was pending; the
        // front-end retries them against the new state.
        let parked: Vec<Cookie> = self
            .pending_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for cookie in parked {
            cookie.notify(Ok(()));
        }
        drop(state);
        self.notify_seqno();
        Ok(())
    }

    /// Marks the partition dead after an unrecoverable invariant violation.
    pub fn mark_dead(&self) {
        let _ = self.set_state(VbState::Dead);
    }

    /// Processes a replica acknowledgement (active only). Returns the
    /// number of sync writes committed by this ack.
    pub fn seqno_ack(&self, node: &str, mem_seqno: u64, disk_seqno: u64) -> Result<usize> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if *state != VbState::Active {
            return Err(Error::NotMyVbucket);
        }
        let committable = self.durability.seqno_ack_received(node, mem_seqno, disk_seqno)?;
        let n = committable.len();
        if n > 0 {
            let mut ckpt = self.checkpoint.lock();
            self.complete_commits(&mut ckpt, committable)?;
            drop(ckpt);
            self.notify_seqno();
        }
        Ok(n)
    }

    /// Flusher callback: the store has persisted everything up to `seqno`.
    pub fn notify_persistence(&self, seqno: u64) -> Result<()> {
        self.persisted_seqno.fetch_max(seqno, Ordering::SeqCst);
        let committable = self.durability.notify_local_persistence(seqno);
        if !committable.is_empty() {
            let mut ckpt = self.checkpoint.lock();
            self.complete_commits(&mut ckpt, committable)?;
            drop(ckpt);
            self.notify_seqno();
        }
        Ok(())
    }

    /// Aborts sync writes whose durability timeout has passed.
    pub fn process_durability_timeouts(&self, now: Instant) -> Result<usize> {
        let expired = self.durability.expired_writes(now);
        let n = expired.len();
        if n > 0 {
            self.complete_aborts(expired, Error::SyncWriteAmbiguous)?;
            self.notify_seqno();
        }
        Ok(n)
    }

    fn complete_commits(
        &self,
        ckpt: &mut CheckpointWriter<'_>,
        writes: Vec<SyncWrite>,
    ) -> Result<()> {
        for write in writes {
            let mut shard = self.ht.lock_shard(&write.key);
            let Some(pending) = shard.pending(&write.key) else {
                return Err(errlogic!(
                    "commit for key without pending entry at seqno {}",
                    write.seqno
                ));
            };
            let (value, flags, datatype, expiry, rev_seqno, deleted) = (
                pending.value.clone().unwrap_or_default(),
                pending.flags,
                pending.datatype,
                pending.expiry,
                pending.rev_seqno,
                pending.deleted,
            );
            let commit = Item::commit_of(
                write.key.clone(),
                value,
                flags,
                datatype,
                expiry,
                self.hlc.next_cas(),
                rev_seqno,
                deleted,
                write.seqno,
            )?;
            let qi = QueuedItem::new(commit);
            ckpt.queue_dirty(&qi)?;
            shard.apply(&qi)?;
            drop(shard);
            tracing::debug!(vbid = %self.id, prepared_seqno = write.seqno,
                commit_seqno = qi.seqno(), "committed sync write");
            if let Some(cookie) = write.cookie {
                cookie.notify(Ok(()));
            }
        }
        Ok(())
    }

    fn complete_aborts(&self, writes: Vec<SyncWrite>, reason: Error) -> Result<()> {
        let mut ckpt = self.checkpoint.lock();
        for write in writes {
            let mut shard = self.ht.lock_shard(&write.key);
            let rev_seqno = shard
                .pending(&write.key)
                .map(|sv| sv.rev_seqno)
                .unwrap_or(1);
            let abort =
                Item::abort_of(write.key.clone(), self.hlc.next_cas(), rev_seqno, write.seqno)?;
            let qi = QueuedItem::new(abort);
            ckpt.queue_dirty(&qi)?;
            shard.apply(&qi)?;
            drop(shard);
            tracing::debug!(vbid = %self.id, prepared_seqno = write.seqno,
                abort_seqno = qi.seqno(), "aborted sync write");
            if let Some(cookie) = write.cookie {
                cookie.notify(Err(reason.clone()));
            }
        }
        Ok(())
    }

    /// Applies a replicated item carrying its origin seqno. Replica only.
    pub fn apply_replica_item(&self, item: Item, seqno: u64) -> Result<()> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if *state != VbState::Replica {
            return Err(Error::NotMyVbucket);
        }
        self.hlc.observe_cas(item.cas());
        let qi = QueuedItem::new(item);
        let mut ckpt = self.checkpoint.lock();
        ckpt.queue_with_seqno(&qi, seqno)?;
        if !qi.operation().is_meta() && qi.operation() != Operation::SystemEvent {
            let mut shard = self.ht.lock_shard(qi.key());
            shard.apply(&qi)?;
        }
        drop(ckpt);
        self.bloom_add(qi.key());
        self.notify_seqno();
        Ok(())
    }

    /// Failover-table verdict for a DCP stream request.
    pub fn check_stream_history(&self, uuid: u64, start_seqno: u64) -> StreamHistory {
        let failover = self.failover.lock().unwrap_or_else(|e| e.into_inner());
        failover.check_stream_request(uuid, start_seqno, self.checkpoint.high_seqno())
    }

    /// Resets in-memory structures to `reached` after the store rewound.
    /// The bucket reloads surviving documents afterwards.
    pub fn rollback_to(&self, reached: u64) {
        self.ht.clear();
        self.bloom
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.checkpoint.reset(reached);
        let mut failover = self.failover.lock().unwrap_or_else(|e| e.into_inner());
        failover.prune_above(reached);
        if failover.is_empty() {
            failover.create_entry(reached, &mut rand::thread_rng());
        }
        drop(failover);
        self.persisted_seqno.store(reached, Ordering::SeqCst);
        self.notify_seqno();
        tracing::info!(vbid = %self.id, reached, "rolled back");
    }

    /// Full reset to an empty partition.
    pub fn reset(&self) {
        self.rollback_to(0);
        self.max_deleted_seqno.store(0, Ordering::SeqCst);
        self.purge_seqno.store(0, Ordering::SeqCst);
    }

    /// Builds the persisted state blob; the flusher supplies the snapshot
    /// window it just made durable.
    pub fn snapshot_state(&self, snap_start: u64, snap_end: u64) -> VBucketState {
        VBucketState {
            state: self.state(),
            checkpoint_id: self.checkpoint.open_checkpoint_id(),
            max_deleted_seqno: self.max_deleted_seqno.load(Ordering::SeqCst),
            failover_table: self.failover_entries(),
            snap_start,
            snap_end,
            max_cas: self.hlc.max_cas(),
            might_contain_xattrs: self.might_contain_xattrs.load(Ordering::SeqCst),
            supports_collections: true,
        }
    }

    /// Random committed resident key, for working-set sampling.
    pub fn random_key(&self) -> Result<DocKey> {
        let start = rand::thread_rng().gen_range(0..self.ht.num_shards());
        self.ht.random_key(start).ok_or(Error::KeyMissing)
    }

    /// Drops pending contexts owned by a disconnected cookie.
    pub fn forget_cookie(&self, cookie: &Cookie) {
        self.pending_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|c| !c.same_as(cookie));
        let mut fetches = self.pending_fetches.lock().unwrap_or_else(|e| e.into_inner());
        for waiters in fetches.values_mut() {
            waiters.retain(|c| !c.same_as(cookie));
        }
        fetches.retain(|_, waiters| !waiters.is_empty());
    }
}
