//! The flusher: drains each partition's persistence cursor into the
//! KVStore.
//!
//! Mutations and committed sync writes persist as documents, deletions and
//! expirations as tombstones. Prepares and aborts are not persisted: a
//! crash before commit leaves the write unresolved, which surfaces as
//! SyncWriteAmbiguous — within contract. After a durable batch the
//! partition is told how far persistence reached (feeding the durability
//! monitor's disk positions) and flushed entries are marked clean so the
//! item pager may evict them.

use std::sync::Arc;

use crate::checkpoint::PERSISTENCE_CURSOR;
use crate::error::Result;
use crate::item::Operation;
use crate::kvstore::PersistedDoc;
use crate::vbucket::VBucket;

use super::Bucket;

/// Items pulled from the cursor per flush round.
const FLUSH_BATCH_LIMIT: usize = 4096;

/// Flushes everything currently queued for the partition. Returns the
/// number of documents written.
pub(crate) fn flush_vbucket(bucket: &Bucket, vb: &Arc<VBucket>) -> Result<usize> {
    let vbid = vb.id();
    let mut flushed = 0usize;
    let mut last_seqno = 0u64;
    let mut snap = (0u64, 0u64);

    loop {
        let batches = match vb.checkpoint.next_items(PERSISTENCE_CURSOR, FLUSH_BATCH_LIMIT) {
            Ok(batches) => batches,
            Err(e) => {
                tracing::error!(vbid = %vbid, error = %e, "persistence cursor unavailable");
                return Err(e);
            }
        };
        if batches.is_empty() {
            break;
        }
        let mut clean: Vec<(crate::item::DocKey, u64)> = Vec::new();
        for batch in &batches {
            snap = (batch.snap_start, batch.snap_end);
            for item in &batch.items {
                match item.operation() {
                    Operation::Mutation => {
                        bucket.store.set(vbid, PersistedDoc::from_item(item))?;
                        flushed += 1;
                    }
                    Operation::CommitSyncWrite => {
                        let doc = PersistedDoc::from_item(item);
                        if doc.deleted {
                            bucket.store.del(vbid, doc)?;
                        } else {
                            bucket.store.set(vbid, doc)?;
                        }
                        flushed += 1;
                    }
                    Operation::Deletion | Operation::Expiration => {
                        bucket.store.del(vbid, PersistedDoc::from_item(item))?;
                        flushed += 1;
                    }
                    // Unresolved or metadata-only records stay in memory.
                    Operation::PendingSyncWrite
                    | Operation::AbortSyncWrite
                    | Operation::SystemEvent
                    | Operation::CheckpointStart
                    | Operation::CheckpointEnd
                    | Operation::SetVbState => {}
                }
                clean.push((item.key().clone(), item.seqno()));
                last_seqno = item.seqno();
            }
        }

        bucket.store.sync()?;
        for (key, seqno) in clean {
            vb.ht.lock_shard(&key).mark_clean_upto(&key, seqno);
        }
        vb.notify_persistence(last_seqno)?;
    }

    if flushed > 0 {
        tracing::debug!(vbid = %vbid, flushed, last_seqno, "flushed vbucket");
    }
    maybe_persist_vb_state(bucket, vb, snap)?;
    Ok(flushed)
}

/// Writes the state blob unconditionally of the snapshot window. Used on
/// state transitions and rollback, which must reach disk promptly.
pub(crate) fn persist_vb_state(bucket: &Bucket, vb: &Arc<VBucket>) -> Result<()> {
    let prev_snap = {
        let last = bucket
            .last_persisted
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        last.get(&vb.id())
            .map(|s| (s.snap_start, s.snap_end))
            .unwrap_or((0, 0))
    };
    let blob = vb.snapshot_state(prev_snap.0, prev_snap.1);
    bucket.store.snapshot_vb_state(vb.id(), &blob)?;
    bucket
        .last_persisted
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(vb.id(), blob);
    Ok(())
}

/// Rewrites the blob only when state or failover history changed, or the
/// flush advanced the snapshot window.
fn maybe_persist_vb_state(bucket: &Bucket, vb: &Arc<VBucket>, snap: (u64, u64)) -> Result<()> {
    let mut last = bucket
        .last_persisted
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let prev = last.get(&vb.id());
    let snap = if snap == (0, 0) {
        prev.map(|p| (p.snap_start, p.snap_end)).unwrap_or((0, 0))
    } else {
        snap
    };
    let blob = vb.snapshot_state(snap.0, snap.1);
    let write = match prev {
        None => true,
        Some(prev) => blob.needs_to_be_persisted(prev) || blob.snap_end != prev.snap_end,
    };
    if write {
        bucket.store.snapshot_vb_state(vb.id(), &blob)?;
        last.insert(vb.id(), blob);
    }
    Ok(())
}
