//! Fixed-size array of partition handles.
//!
//! Slot reads are cheap and concurrent; partition creation, deletion and
//! rollback serialize through a bucketed vector of mutexes (a lock per
//! partition would be wasteful at 1024 partitions). Per-state counters are
//! maintained atomically as partitions change state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::item::Vbid;
use crate::vbstate::VbState;
use crate::vbucket::VBucket;

/// How many partitions share one creation mutex.
const LOCK_BUCKETING: usize = 16;

pub struct VbMap {
    slots: Vec<RwLock<Option<Arc<VBucket>>>>,
    creation_locks: Vec<Mutex<()>>,
    state_counts: [AtomicUsize; 4],
}

/// Exclusive hold over a partition slot for create/delete/rollback.
pub struct LockedSlot<'a> {
    _guard: MutexGuard<'a, ()>,
    pub vb: Option<Arc<VBucket>>,
}

fn state_idx(state: VbState) -> usize {
    match state {
        VbState::Active => 0,
        VbState::Replica => 1,
        VbState::Pending => 2,
        VbState::Dead => 3,
    }
}

impl VbMap {
    pub fn new(num_vbuckets: u16) -> Self {
        let n = num_vbuckets as usize;
        Self {
            slots: (0..n).map(|_| RwLock::new(None)).collect(),
            creation_locks: (0..n.div_ceil(LOCK_BUCKETING).max(1))
                .map(|_| Mutex::new(()))
                .collect(),
            state_counts: Default::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn check_id(&self, vbid: Vbid) -> Result<usize> {
        let idx = vbid.0 as usize;
        if idx >= self.slots.len() {
            return Err(Error::NotMyVbucket);
        }
        Ok(idx)
    }

    pub fn get(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        let idx = self.check_id(vbid).ok()?;
        self.slots[idx]
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Routes to the partition or fails NotMyVbucket.
    pub fn get_or_nmvb(&self, vbid: Vbid) -> Result<Arc<VBucket>> {
        self.get(vbid).ok_or(Error::NotMyVbucket)
    }

    /// Takes the creation lock for the slot, excluding concurrent
    /// create/delete/rollback of the same partition.
    pub fn lock_slot(&self, vbid: Vbid) -> Result<LockedSlot<'_>> {
        let idx = self.check_id(vbid)?;
        let guard = self.creation_locks[idx % self.creation_locks.len()]
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let vb = self.slots[idx]
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Ok(LockedSlot { _guard: guard, vb })
    }

    /// Installs a partition. The caller holds the slot lock.
    pub fn insert(&self, vb: Arc<VBucket>) -> Result<()> {
        let idx = self.check_id(vb.id())?;
        let state = vb.state();
        let old = self.slots[idx]
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(vb);
        if let Some(old) = old {
            self.state_counts[state_idx(old.state())].fetch_sub(1, Ordering::SeqCst);
        }
        self.state_counts[state_idx(state)].fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Removes the partition handle; deletion of its resources is deferred
    /// to the last holder of the Arc.
    pub fn remove(&self, vbid: Vbid) -> Result<Option<Arc<VBucket>>> {
        let idx = self.check_id(vbid)?;
        let old = self.slots[idx]
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(old) = &old {
            self.state_counts[state_idx(old.state())].fetch_sub(1, Ordering::SeqCst);
        }
        Ok(old)
    }

    /// Adjusts the per-state counters after a partition transitioned.
    pub fn note_state_change(&self, from: VbState, to: VbState) {
        if from != to {
            self.state_counts[state_idx(from)].fetch_sub(1, Ordering::SeqCst);
            self.state_counts[state_idx(to)].fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count_in_state(&self, state: VbState) -> usize {
        self.state_counts[state_idx(state)].load(Ordering::SeqCst)
    }

    /// Every live partition, for visitors.
    pub fn all(&self) -> Vec<Arc<VBucket>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.read().unwrap_or_else(|e| e.into_inner()).clone())
            .collect()
    }

    /// Live partitions currently in `state`.
    pub fn in_state(&self, state: VbState) -> Vec<Arc<VBucket>> {
        self.all()
            .into_iter()
            .filter(|vb| vb.state() == state)
            .collect()
    }
}
