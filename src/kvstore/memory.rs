//! In-memory store implementation.
//!
//! Documents are indexed twice: a lock-free skiplist ordered by seqno (the
//! backfill/scan path reads it while the flusher appends) and a by-key map
//! for point lookups. Used by tests and ephemeral buckets; also embedded in
//! [`super::FileKVStore`] as its resident index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crossbeam_skiplist::SkipMap;

use crate::error::Result;
use crate::item::{DocKey, Vbid};
use crate::vbstate::VBucketState;

use super::{KVStore, PersistedDoc};

#[derive(Default)]
struct VbData {
    by_seqno: SkipMap<u64, PersistedDoc>,
    by_key: Mutex<HashMap<DocKey, u64>>,
    state: Mutex<Option<VBucketState>>,
}

impl VbData {
    fn upsert(&self, doc: PersistedDoc) {
        let mut by_key = self.by_key.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old_seqno) = by_key.insert(doc.key.clone(), doc.seqno) {
            self.by_seqno.remove(&old_seqno);
        }
        self.by_seqno.insert(doc.seqno, doc);
    }
}

#[derive(Default)]
pub struct MemoryKVStore {
    vbs: RwLock<HashMap<Vbid, Arc<VbData>>>,
    sets: AtomicU64,
    dels: AtomicU64,
    fetches: AtomicU64,
}

impl MemoryKVStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn vb(&self, vbid: Vbid) -> Option<Arc<VbData>> {
        self.vbs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&vbid)
            .cloned()
    }

    fn vb_or_create(&self, vbid: Vbid) -> Arc<VbData> {
        if let Some(vb) = self.vb(vbid) {
            return vb;
        }
        let mut vbs = self.vbs.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(vbs.entry(vbid).or_default())
    }
}

impl KVStore for MemoryKVStore {
    fn set(&self, vbid: Vbid, doc: PersistedDoc) -> Result<()> {
        self.sets.fetch_add(1, Ordering::Relaxed);
        self.vb_or_create(vbid).upsert(doc);
        Ok(())
    }

    fn del(&self, vbid: Vbid, doc: PersistedDoc) -> Result<()> {
        self.dels.fetch_add(1, Ordering::Relaxed);
        debug_assert!(doc.deleted);
        self.vb_or_create(vbid).upsert(doc);
        Ok(())
    }

    fn get(&self, vbid: Vbid, key: &DocKey) -> Result<Option<PersistedDoc>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let Some(vb) = self.vb(vbid) else {
            return Ok(None);
        };
        let seqno = {
            let by_key = vb.by_key.lock().unwrap_or_else(|e| e.into_inner());
            by_key.get(key).copied()
        };
        Ok(seqno
            .and_then(|s| vb.by_seqno.get(&s))
            .map(|entry| entry.value().clone()))
    }

    fn get_multi(
        &self,
        vbid: Vbid,
        keys: &[DocKey],
    ) -> Result<Vec<(DocKey, Option<PersistedDoc>)>> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.get(vbid, key)?)))
            .collect()
    }

    fn scan_seqnos(&self, vbid: Vbid, start: u64, end: u64) -> Result<Vec<PersistedDoc>> {
        let Some(vb) = self.vb(vbid) else {
            return Ok(Vec::new());
        };
        Ok(vb
            .by_seqno
            .range(start..=end)
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn high_seqno(&self, vbid: Vbid) -> u64 {
        self.vb(vbid)
            .and_then(|vb| vb.by_seqno.back().map(|e| *e.key()))
            .unwrap_or(0)
    }

    fn item_count(&self, vbid: Vbid) -> usize {
        self.vb(vbid).map_or(0, |vb| {
            vb.by_seqno.iter().filter(|e| !e.value().deleted).count()
        })
    }

    fn snapshot_vb_state(&self, vbid: Vbid, state: &VBucketState) -> Result<()> {
        let vb = self.vb_or_create(vbid);
        *vb.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }

    fn load_vb_state(&self, vbid: Vbid) -> Result<Option<VBucketState>> {
        Ok(self
            .vb(vbid)
            .and_then(|vb| vb.state.lock().unwrap_or_else(|e| e.into_inner()).clone()))
    }

    fn list_persisted_vbuckets(&self) -> Result<Vec<Vbid>> {
        let vbs = self.vbs.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<Vbid> = vbs
            .iter()
            .filter(|(_, vb)| {
                vb.state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some()
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn rewind(&self, vbid: Vbid, target: u64) -> Result<u64> {
        let Some(vb) = self.vb(vbid) else {
            return Ok(0);
        };
        let doomed: Vec<(u64, DocKey)> = vb
            .by_seqno
            .range(target + 1..)
            .map(|e| (*e.key(), e.value().key.clone()))
            .collect();
        let mut by_key = vb.by_key.lock().unwrap_or_else(|e| e.into_inner());
        for (seqno, key) in doomed {
            vb.by_seqno.remove(&seqno);
            if by_key.get(&key) == Some(&seqno) {
                by_key.remove(&key);
            }
        }
        Ok(vb.by_seqno.back().map(|e| *e.key()).unwrap_or(0).min(target))
    }

    fn delete_vbucket(&self, vbid: Vbid) -> Result<()> {
        self.vbs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&vbid);
        Ok(())
    }

    fn compact(&self, vbid: Vbid, purge_before: u64) -> Result<(usize, u64)> {
        let Some(vb) = self.vb(vbid) else {
            return Ok((0, 0));
        };
        let doomed: Vec<(u64, DocKey)> = vb
            .by_seqno
            .iter()
            .filter(|e| e.value().deleted && *e.key() < purge_before)
            .map(|e| (*e.key(), e.value().key.clone()))
            .collect();
        let mut by_key = vb.by_key.lock().unwrap_or_else(|e| e.into_inner());
        let mut highest = 0;
        for (seqno, key) in &doomed {
            vb.by_seqno.remove(seqno);
            if by_key.get(key) == Some(seqno) {
                by_key.remove(key);
            }
            highest = highest.max(*seqno);
        }
        Ok((doomed.len(), highest))
    }

    fn get_stat(&self, name: &str) -> Option<u64> {
        match name {
            "sets" => Some(self.sets.load(Ordering::Relaxed)),
            "dels" => Some(self.dels.load(Ordering::Relaxed)),
            "fetches" => Some(self.fetches.load(Ordering::Relaxed)),
            _ => None,
        }
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
