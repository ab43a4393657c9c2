//! The bucket: aggregate over all partitions.
//!
//! Routes client operations to partitions, accounts memory against the
//! quota, and owns the shared machinery: the KVStore, the collections
//! manager, DCP producers, the background scheduler and its tasks
//! (flusher, checkpoint remover, expiry pager, item pager, durability
//! timeouts, background fetcher). Until warm-up completes, client
//! operations park on their cookie and are resumed when the hash tables
//! have been rehydrated.

pub mod bgfetch;
pub mod flusher;
pub mod pager;
pub mod warmup;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::collections::{CollectionsManager, CollectionsManifest};
use crate::config::EngineConfig;
use crate::cookie::Cookie;
use crate::dcp::message::StreamEndReason;
use crate::dcp::producer::{DcpProducer, StreamRequest};
use crate::dcp::stream::ActiveStream;
use crate::error::{Error, Result};
use crate::failover::FailoverEntry;
use crate::hashtable::MemCounter;
use crate::item::{now_unix, DocKey, Vbid};
use crate::kvstore::KVStore;
use crate::scheduler::Scheduler;
use crate::vbmap::VbMap;
use crate::vbstate::{VBucketState, VbState};
use crate::vbucket::{DeleteOptions, GetOutcome, MutationOutcome, SetOptions, VBucket};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketStats {
    pub mem_used: usize,
    pub max_size: usize,
    pub num_active: usize,
    pub num_replica: usize,
    pub num_pending: usize,
    pub num_dead: usize,
    pub warmup_complete: bool,
}

pub struct Bucket {
    name: String,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) vbmap: VbMap,
    pub(crate) store: Arc<dyn KVStore>,
    pub(crate) mem: Arc<MemCounter>,
    collections: CollectionsManager,
    scheduler: Scheduler,
    warmup_complete: AtomicBool,
    warmup_waiters: Mutex<Vec<Cookie>>,
    producers: Mutex<HashMap<String, Arc<DcpProducer>>>,
    /// Last state blob written per partition, for the
    /// rewrite-only-on-change rule.
    pub(crate) last_persisted: Mutex<HashMap<Vbid, VBucketState>>,
}

impl Bucket {
    /// A bucket that still needs warm-up. Use [`Bucket::open`] unless the
    /// warm-up is to be scheduled in the background.
    pub fn new(
        name: impl Into<String>,
        config: EngineConfig,
        store: Arc<dyn KVStore>,
    ) -> Arc<Bucket> {
        let config = Arc::new(config);
        Arc::new(Bucket {
            name: name.into(),
            vbmap: VbMap::new(config.max_vbuckets),
            store,
            mem: MemCounter::new(),
            collections: CollectionsManager::new(),
            scheduler: Scheduler::new(),
            warmup_complete: AtomicBool::new(false),
            warmup_waiters: Mutex::new(Vec::new()),
            producers: Mutex::new(HashMap::new()),
            last_persisted: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Creates the bucket and runs warm-up to completion.
    pub fn open(
        name: impl Into<String>,
        config: EngineConfig,
        store: Arc<dyn KVStore>,
    ) -> Result<Arc<Bucket>> {
        let bucket = Self::new(name, config, store);
        warmup::run(&bucket)?;
        Ok(bucket)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mem_used(&self) -> usize {
        self.mem.bytes()
    }

    pub fn is_warmed_up(&self) -> bool {
        self.warmup_complete.load(Ordering::SeqCst)
    }

    pub(crate) fn finish_warmup(&self) {
        self.warmup_complete.store(true, Ordering::SeqCst);
        let waiters: Vec<Cookie> = self
            .warmup_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for cookie in waiters {
            cookie.notify(Ok(()));
        }
        tracing::info!(bucket = %self.name, "warmup complete");
    }

    /// Registers the engine's background tasks on the shared scheduler.
    pub fn start_background_tasks(self: &Arc<Self>) {
        crate::tasks::register_all(self, &self.scheduler);
    }

    /// Stops background tasks, then makes everything durable.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.shutdown().await?;
        for producer in self
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            producer.close_all(StreamEndReason::Disconnected);
        }
        self.flush_all()?;
        self.store.sync()?;
        tracing::info!(bucket = %self.name, "shutdown complete");
        Ok(())
    }

    fn check_warmup(&self, cookie: &Cookie) -> Result<()> {
        if self.is_warmed_up() {
            return Ok(());
        }
        self.warmup_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cookie.clone());
        Err(Error::WouldBlock)
    }

    /// Memory admission: mutations are rejected once the projected usage
    /// crosses the mutation threshold; the item pager brings usage back
    /// under the watermarks in the background.
    fn check_memory(&self, incoming: usize) -> Result<()> {
        let projected = self.mem.bytes() + incoming;
        if projected > self.config.mutation_threshold_bytes() {
            tracing::warn!(
                bucket = %self.name,
                mem_used = self.mem.bytes(),
                incoming,
                "mutation rejected: over memory threshold"
            );
            return Err(Error::NoMemory);
        }
        Ok(())
    }

    fn vb(&self, vbid: Vbid) -> Result<Arc<VBucket>> {
        self.vbmap.get_or_nmvb(vbid)
    }

    /// Direct handle to a partition, for embedders and tooling.
    pub fn vbucket(&self, vbid: Vbid) -> Result<Arc<VBucket>> {
        self.vb(vbid)
    }

    // ---- client operations -------------------------------------------

    pub fn set(
        &self,
        vbid: Vbid,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
        cookie: &Cookie,
    ) -> Result<MutationOutcome> {
        self.check_warmup(cookie)?;
        self.check_memory(key.len() + value.len())?;
        self.vb(vbid)?.set(key, value, opts, cookie)
    }

    pub fn add(
        &self,
        vbid: Vbid,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
        cookie: &Cookie,
    ) -> Result<MutationOutcome> {
        self.check_warmup(cookie)?;
        self.check_memory(key.len() + value.len())?;
        self.vb(vbid)?.add(key, value, opts, cookie)
    }

    pub fn replace(
        &self,
        vbid: Vbid,
        key: DocKey,
        value: Vec<u8>,
        opts: SetOptions,
        cookie: &Cookie,
    ) -> Result<MutationOutcome> {
        self.check_warmup(cookie)?;
        self.check_memory(key.len() + value.len())?;
        self.vb(vbid)?.replace(key, value, opts, cookie)
    }

    pub fn delete(
        &self,
        vbid: Vbid,
        key: DocKey,
        opts: DeleteOptions,
        cookie: &Cookie,
    ) -> Result<MutationOutcome> {
        self.check_warmup(cookie)?;
        self.vb(vbid)?.delete(key, opts, cookie)
    }

    pub fn get(&self, vbid: Vbid, key: &DocKey, cookie: &Cookie) -> Result<GetOutcome> {
        self.check_warmup(cookie)?;
        self.vb(vbid)?.get(key, cookie)
    }

    pub fn get_locked(
        &self,
        vbid: Vbid,
        key: &DocKey,
        duration: Duration,
        cookie: &Cookie,
    ) -> Result<GetOutcome> {
        self.check_warmup(cookie)?;
        self.vb(vbid)?.get_locked(key, duration, cookie)
    }

    pub fn unlock(&self, vbid: Vbid, key: &DocKey, cas: u64, cookie: &Cookie) -> Result<()> {
        self.check_warmup(cookie)?;
        self.vb(vbid)?.unlock(key, cas, cookie)
    }

    /// A random resident key from a random active partition.
    pub fn random_key(&self) -> Result<(Vbid, DocKey)> {
        let actives = self.vbmap.in_state(VbState::Active);
        if actives.is_empty() {
            return Err(Error::KeyMissing);
        }
        let start = rand::thread_rng().gen_range(0..actives.len());
        for i in 0..actives.len() {
            let vb = &actives[(start + i) % actives.len()];
            if let Ok(key) = vb.random_key() {
                return Ok((vb.id(), key));
            }
        }
        Err(Error::KeyMissing)
    }

    // ---- topology ----------------------------------------------------

    /// Creates the partition or transitions its state; optionally installs
    /// the replication chain (active node first).
    pub fn set_vbucket_state(
        &self,
        vbid: Vbid,
        state: VbState,
        topology: Option<Vec<String>>,
    ) -> Result<()> {
        let slot = self.vbmap.lock_slot(vbid)?;
        let vb = match &slot.vb {
            Some(vb) => {
                let old = vb.state();
                vb.set_state(state)?;
                self.vbmap.note_state_change(old, state);
                Arc::clone(vb)
            }
            None => {
                let vb = VBucket::new(
                    vbid,
                    state,
                    Arc::clone(&self.config),
                    Arc::clone(&self.mem),
                );
                vb.install_manifest(self.collections.current());
                self.vbmap.insert(Arc::clone(&vb))?;
                vb
            }
        };
        if let Some(nodes) = topology {
            vb.register_replication_chain(nodes)?;
        }
        // State and failover changes must reach disk promptly.
        flusher::persist_vb_state(self, &vb)?;
        Ok(())
    }

    /// Removes the partition; resource teardown is deferred to the last
    /// handle. All attached streams end.
    pub fn delete_vbucket(&self, vbid: Vbid) -> Result<()> {
        let _slot = self.vbmap.lock_slot(vbid)?;
        let Some(vb) = self.vbmap.remove(vbid)? else {
            return Err(Error::NotMyVbucket);
        };
        vb.set_state(VbState::Dead)?;
        self.close_streams_for(vbid, StreamEndReason::StateChanged);
        self.store.delete_vbucket(vbid)?;
        self.last_persisted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&vbid);
        tracing::info!(bucket = %self.name, vbid = %vbid, "vbucket deleted");
        Ok(())
    }

    /// Rewinds a demoted partition. A zero target resets it outright;
    /// otherwise the store discards history above the target and the
    /// surviving documents are reloaded. All streams for the partition are
    /// terminated.
    pub fn rollback(&self, vbid: Vbid, target: u64) -> Result<u64> {
        let slot = self.vbmap.lock_slot(vbid)?;
        let vb = slot.vb.as_ref().ok_or(Error::NotMyVbucket)?;
        if vb.state() == VbState::Active {
            return Err(Error::NotSupported);
        }

        let reached = if target == 0 {
            self.store.rewind(vbid, 0)?;
            vb.reset();
            0
        } else {
            let reached = self.store.rewind(vbid, target)?;
            vb.rollback_to(reached);
            for doc in self.store.scan_seqnos(vbid, 0, u64::MAX)? {
                if !doc.deleted {
                    vb.restore_doc(&doc)?;
                }
            }
            reached
        };
        self.close_streams_for(vbid, StreamEndReason::Rollback);
        flusher::persist_vb_state(self, vb)?;
        tracing::info!(bucket = %self.name, vbid = %vbid, target, reached, "rollback");
        Ok(reached)
    }

    /// Replica acknowledgement for synchronous writes. Invariant
    /// violations mark the partition dead.
    pub fn seqno_ack(&self, vbid: Vbid, node: &str, mem_seqno: u64, disk_seqno: u64) -> Result<usize> {
        let vb = self.vb(vbid)?;
        match vb.seqno_ack(node, mem_seqno, disk_seqno) {
            Err(e) if e.is_fatal() => {
                tracing::error!(bucket = %self.name, vbid = %vbid, error = %e,
                    "fatal durability error, marking vbucket dead");
                let old = vb.state();
                vb.mark_dead();
                self.vbmap.note_state_change(old, VbState::Dead);
                Err(e)
            }
            other => other,
        }
    }

    // ---- collections -------------------------------------------------

    pub fn collections_manifest(&self) -> Arc<CollectionsManifest> {
        self.collections.current()
    }

    /// Applies a manifest to every active partition, rolling back
    /// best-effort when any rejects it.
    pub fn update_collections(&self, manifest: CollectionsManifest) -> Result<()> {
        let vbs = self.vbmap.in_state(VbState::Active);
        self.collections.update(manifest, |m| {
            for vb in &vbs {
                vb.update_manifest(Arc::clone(m))?;
            }
            Ok(())
        })
    }

    // ---- DCP ---------------------------------------------------------

    pub fn create_producer(&self, name: impl Into<String>) -> Arc<DcpProducer> {
        let producer = DcpProducer::new(name, self.config.dcp_conn_buffer_size);
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.name().to_string(), Arc::clone(&producer));
        producer
    }

    pub fn dcp_stream_request(
        &self,
        producer: &DcpProducer,
        vbid: Vbid,
        req: StreamRequest,
    ) -> Result<(Arc<ActiveStream>, Vec<FailoverEntry>)> {
        let vb = self.vb(vbid)?;
        producer.stream_request(vb, Arc::clone(&self.store), req)
    }

    fn close_streams_for(&self, vbid: Vbid, reason: StreamEndReason) {
        for producer in self
            .producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
        {
            producer.close_streams_for(vbid, reason);
        }
    }

    // ---- background work (driven by tasks) ---------------------------

    pub fn flush_vbucket(&self, vbid: Vbid) -> Result<usize> {
        let vb = self.vb(vbid)?;
        flusher::flush_vbucket(self, &vb)
    }

    pub fn flush_all(&self) -> Result<usize> {
        let mut total = 0;
        for vb in self.vbmap.all() {
            total += flusher::flush_vbucket(self, &vb)?;
        }
        Ok(total)
    }

    pub fn run_checkpoint_remover(&self) -> usize {
        let mut freed = 0;
        for vb in self.vbmap.all() {
            freed += vb.checkpoint.remove_closed_unreferenced();
        }
        freed
    }

    pub fn run_expiry_pager(&self) -> usize {
        pager::run_expiry_pager(self, now_unix())
    }

    pub fn run_item_pager(&self) -> usize {
        pager::run_item_pager(self)
    }

    pub fn run_durability_timeouts(&self) -> Result<usize> {
        let now = Instant::now();
        let mut aborted = 0;
        for vb in self.vbmap.in_state(VbState::Active) {
            aborted += vb.process_durability_timeouts(now)?;
        }
        Ok(aborted)
    }

    pub fn run_bgfetcher(&self) -> Result<usize> {
        bgfetch::run(self)
    }

    /// Compacts persisted tombstones that every consumer has had a chance
    /// to observe (everything the flusher has already made durable).
    pub fn run_compactor(&self) -> Result<usize> {
        let mut purged = 0;
        for vb in self.vbmap.all() {
            let horizon = vb.persisted_seqno();
            if horizon == 0 {
                continue;
            }
            let (n, highest) = self.store.compact(vb.id(), horizon)?;
            if n > 0 {
                vb.note_purged_upto(highest);
                purged += n;
            }
        }
        Ok(purged)
    }

    // ---- misc --------------------------------------------------------

    /// Disconnect callback: drops every pending context owned by the
    /// cookie across all partitions.
    pub fn disconnect(&self, cookie: &Cookie) {
        cookie.disconnect();
        for vb in self.vbmap.all() {
            vb.forget_cookie(cookie);
        }
        self.warmup_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|c| !c.same_as(cookie));
    }

    pub fn stats(&self) -> BucketStats {
        BucketStats {
            mem_used: self.mem.bytes(),
            max_size: self.config.max_size,
            num_active: self.vbmap.count_in_state(VbState::Active),
            num_replica: self.vbmap.count_in_state(VbState::Replica),
            num_pending: self.vbmap.count_in_state(VbState::Pending),
            num_dead: self.vbmap.count_in_state(VbState::Dead),
            warmup_complete: self.is_warmed_up(),
        }
    }
}
