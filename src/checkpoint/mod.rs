//! Ordered log of queued mutations for one partition.
//!
//! The checkpoint manager assigns seqnos, groups items into bounded
//! checkpoints with [snap_start, snap_end] seqno ranges, and serves named
//! cursors (the flusher's persistence cursor plus one per DCP stream).
//! Within the open checkpoint a later mutation of the same key replaces the
//! earlier entry (the seqno still advances); closed checkpoints no cursor
//! references are removed by the checkpoint remover task. A cursor may be
//! dropped under memory pressure, after which its consumer must re-stream
//! from disk.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::errlogic;
use crate::error::{Error, Result};
use crate::item::{DocKey, Operation, QueuedItem, Vbid};

/// Name of the flusher's cursor, registered at manager creation.
pub const PERSISTENCE_CURSOR: &str = "persistence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointState {
    Open,
    Closed,
}

#[derive(Debug)]
struct Checkpoint {
    id: u64,
    snap_start: u64,
    snap_end: u64,
    state: CheckpointState,
    /// Slots are tombstoned (None) when deduplicated so cursor offsets
    /// remain stable.
    items: Vec<Option<QueuedItem>>,
    /// Open-checkpoint dedup index: key -> slot. Only plain mutations,
    /// deletions and expirations participate; sync-write prepares and
    /// commits must both survive for stream consumers.
    key_index: HashMap<DocKey, usize>,
    num_live: usize,
    mem_used: usize,
    created: Instant,
}

impl Checkpoint {
    fn new(id: u64, snap_start: u64) -> Self {
        Self {
            id,
            snap_start,
            snap_end: snap_start.saturating_sub(1),
            state: CheckpointState::Open,
            items: Vec::new(),
            key_index: HashMap::new(),
            num_live: 0,
            mem_used: 0,
            created: Instant::now(),
        }
    }

    fn close(&mut self) {
        self.state = CheckpointState::Closed;
        self.key_index.clear();
    }

    fn is_open(&self) -> bool {
        self.state == CheckpointState::Open
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cursor {
    checkpoint_id: u64,
    /// Next slot to read within that checkpoint.
    offset: usize,
}

#[derive(Debug)]
struct Inner {
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, Cursor>,
    high_seqno: u64,
    next_checkpoint_id: u64,
    chk_max_items: usize,
    chk_max_age: Duration,
}

/// A run of items sharing one snapshot range, as handed to a cursor.
#[derive(Debug, PartialEq)]
pub struct SnapshotBatch {
    pub checkpoint_id: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub items: Vec<QueuedItem>,
}

/// Outcome of a queue_dirty call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueResult {
    pub seqno: u64,
    /// True when the append closed the open checkpoint and started a new one.
    pub opened_new_checkpoint: bool,
}

/// Counters for stats output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointStats {
    pub num_checkpoints: usize,
    pub num_items: usize,
    pub mem_used: usize,
    pub high_seqno: u64,
    pub num_cursors: usize,
}

#[derive(Debug)]
pub struct CheckpointManager {
    vbid: Vbid,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    /// `high_seqno` and `snap_start` seed the manager from persisted state;
    /// a fresh partition passes (0, 1).
    pub fn new(
        vbid: Vbid,
        chk_max_items: usize,
        chk_max_age: Duration,
        high_seqno: u64,
    ) -> Self {
        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(Checkpoint::new(1, high_seqno + 1));
        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR.to_string(),
            Cursor {
                checkpoint_id: 1,
                offset: 0,
            },
        );
        Self {
            vbid,
            inner: Mutex::new(Inner {
                checkpoints,
                cursors,
                high_seqno,
                next_checkpoint_id: 2,
                chk_max_items,
                chk_max_age,
            }),
        }
    }

    /// Takes the manager lock for a write. Per the engine lock order the
    /// checkpoint lock is acquired before any hash-table shard lock.
    pub fn lock(&self) -> CheckpointWriter<'_> {
        CheckpointWriter {
            inner: self.inner.lock().unwrap_or_else(|e| e.into_inner()),
            vbid: self.vbid,
        }
    }

    pub fn high_seqno(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).high_seqno
    }

    pub fn open_checkpoint_id(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.checkpoints.back().expect("open checkpoint").id
    }

    /// Snapshot range of the open checkpoint, persisted alongside flushes.
    pub fn snapshot_range(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let open = inner.checkpoints.back().expect("open checkpoint");
        (open.snap_start, open.snap_end.max(open.snap_start))
    }

    /// Registers a cursor to resume after `start_seqno`. Returns the first
    /// seqno the cursor will deliver, or None when the items have already
    /// been removed and the consumer must backfill from disk.
    pub fn register_cursor(&self, name: &str, start_seqno: u64) -> Option<u64> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if start_seqno >= inner.high_seqno {
            // Nothing to replay; park at the tail of the open checkpoint.
            let open = inner.checkpoints.back().expect("open checkpoint");
            let cursor = Cursor {
                checkpoint_id: open.id,
                offset: open.items.len(),
            };
            inner.cursors.insert(name.to_string(), cursor);
            return Some(inner.high_seqno + 1);
        }

        // Find the first checkpoint containing items beyond start_seqno.
        let mut position: Option<(u64, usize, u64)> = None;
        'outer: for chk in &inner.checkpoints {
            for (slot, item) in chk.items.iter().enumerate() {
                if let Some(item) = item {
                    if item.seqno() > start_seqno {
                        position = Some((chk.id, slot, item.seqno()));
                        break 'outer;
                    }
                }
            }
        }
        let (checkpoint_id, offset, first_seqno) = position?;
        // The log must be contiguous from start_seqno: if the oldest
        // retained checkpoint starts after it, history is gone.
        let oldest_start = inner.checkpoints.front().expect("checkpoint").snap_start;
        if start_seqno + 1 < oldest_start {
            return None;
        }
        inner.cursors.insert(
            name.to_string(),
            Cursor {
                checkpoint_id,
                offset,
            },
        );
        Some(first_seqno)
    }

    pub fn drop_cursor(&self, name: &str) -> bool {
        if name == PERSISTENCE_CURSOR {
            return false;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = inner.cursors.remove(name).is_some();
        if dropped {
            tracing::debug!(vbid = %self.vbid, cursor = name, "dropped checkpoint cursor");
        }
        dropped
    }

    pub fn has_cursor(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cursors
            .contains_key(name)
    }

    /// Pulls up to `approx_limit` items for the cursor, batched per
    /// checkpoint so every batch maps to one snapshot marker. Fails with
    /// `Range` when the cursor has been dropped.
    pub fn next_items(&self, name: &str, approx_limit: usize) -> Result<Vec<SnapshotBatch>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.cursors.contains_key(name) {
            return Err(Error::Range);
        }

        let mut batches = Vec::new();
        let mut taken = 0usize;
        loop {
            let cursor = inner.cursors.get(name).expect("cursor present").clone();
            let Some(chk_idx) = inner
                .checkpoints
                .iter()
                .position(|c| c.id == cursor.checkpoint_id)
            else {
                // The cursor's checkpoint has been removed underneath it.
                inner.cursors.remove(name);
                return Err(Error::Range);
            };

            let chk = &inner.checkpoints[chk_idx];
            let mut offset = cursor.offset;
            let mut items = Vec::new();
            while offset < chk.items.len() && taken < approx_limit {
                if let Some(item) = &chk.items[offset] {
                    items.push(item.clone());
                    taken += 1;
                }
                offset += 1;
            }

            if !items.is_empty() {
                batches.push(SnapshotBatch {
                    checkpoint_id: chk.id,
                    snap_start: items.first().expect("non-empty").seqno(),
                    snap_end: items.last().expect("non-empty").seqno(),
                    items,
                });
            }

            let at_end = offset >= chk.items.len();
            let closed = !chk.is_open();
            let next_id = inner
                .checkpoints
                .get(chk_idx + 1)
                .map(|c| c.id);
            let cursor = inner.cursors.get_mut(name).expect("cursor present");
            if at_end && closed {
                if let Some(next_id) = next_id {
                    // Hop into the next checkpoint and keep draining.
                    cursor.checkpoint_id = next_id;
                    cursor.offset = 0;
                    if taken < approx_limit {
                        continue;
                    }
                } else {
                    cursor.offset = offset;
                }
            } else {
                cursor.offset = offset;
            }
            break;
        }
        Ok(batches)
    }

    /// Removes closed checkpoints no cursor references. Returns the number
    /// of items freed.
    pub fn remove_closed_unreferenced(&self) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut freed = 0;
        loop {
            let Some(front) = inner.checkpoints.front() else {
                break;
            };
            if front.is_open() {
                break;
            }
            let front_id = front.id;
            let front_len = front.items.len();
            // A cursor parked at the very end of a closed checkpoint is
            // logically in the next one.
            let next_id = inner.checkpoints.get(1).map(|c| c.id);
            if let Some(next_id) = next_id {
                for cursor in inner.cursors.values_mut() {
                    if cursor.checkpoint_id == front_id && cursor.offset >= front_len {
                        cursor.checkpoint_id = next_id;
                        cursor.offset = 0;
                    }
                }
            }
            let referenced = inner
                .cursors
                .values()
                .any(|c| c.checkpoint_id == front_id);
            if referenced {
                break;
            }
            let removed = inner.checkpoints.pop_front().expect("front exists");
            freed += removed.num_live;
        }
        freed
    }

    /// Cursors (other than persistence) parked in checkpoints older than
    /// the newest `keep` checkpoints; candidates for dropping under memory
    /// pressure.
    pub fn slow_cursors(&self, keep: usize) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.checkpoints.len() <= keep {
            return Vec::new();
        }
        let old_ids: Vec<u64> = inner
            .checkpoints
            .iter()
            .take(inner.checkpoints.len() - keep)
            .map(|c| c.id)
            .collect();
        inner
            .cursors
            .iter()
            .filter(|(name, cursor)| {
                name.as_str() != PERSISTENCE_CURSOR && old_ids.contains(&cursor.checkpoint_id)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn num_checkpoints(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .checkpoints
            .len()
    }

    pub fn stats(&self) -> CheckpointStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        CheckpointStats {
            num_checkpoints: inner.checkpoints.len(),
            num_items: inner.checkpoints.iter().map(|c| c.num_live).sum(),
            mem_used: inner.checkpoints.iter().map(|c| c.mem_used).sum(),
            high_seqno: inner.high_seqno,
            num_cursors: inner.cursors.len(),
        }
    }

    /// Resets the log to `high_seqno`, dropping all queued items and all
    /// cursors except persistence. Used by rollback.
    pub fn reset(&self, high_seqno: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.checkpoints.clear();
        let id = inner.next_checkpoint_id;
        inner.next_checkpoint_id += 1;
        inner.checkpoints.push_back(Checkpoint::new(id, high_seqno + 1));
        inner.high_seqno = high_seqno;
        inner.cursors.retain(|name, _| name == PERSISTENCE_CURSOR);
        if let Some(cursor) = inner.cursors.get_mut(PERSISTENCE_CURSOR) {
            cursor.checkpoint_id = id;
            cursor.offset = 0;
        }
    }
}

/// Held manager lock; queueing goes through this guard so the checkpoint
/// lock can be ordered before the hash-table shard lock by the caller.
pub struct CheckpointWriter<'a> {
    inner: MutexGuard<'a, Inner>,
    vbid: Vbid,
}

impl<'a> CheckpointWriter<'a> {
    pub fn high_seqno(&self) -> u64 {
        self.inner.high_seqno
    }

    /// Assigns the next seqno, appends to the open checkpoint, dedups the
    /// key within it, and rolls the checkpoint over when it is full or old.
    pub fn queue_dirty(&mut self, item: &QueuedItem) -> Result<QueueResult> {
        let inner = &mut *self.inner;
        let seqno = inner.high_seqno + 1;
        item.set_seqno(seqno);
        inner.high_seqno = seqno;

        let dedupable = matches!(
            item.operation(),
            Operation::Mutation | Operation::Deletion | Operation::Expiration
        );

        let open = inner.checkpoints.back_mut().expect("open checkpoint");
        debug_assert!(open.is_open());

        if dedupable {
            if let Some(&slot) = open.key_index.get(item.key()) {
                if let Some(old) = open.items[slot].take() {
                    open.num_live -= 1;
                    open.mem_used -= old.size();
                }
            }
        }

        open.mem_used += item.size();
        open.items.push(Some(item.clone()));
        open.num_live += 1;
        open.snap_end = seqno;
        if dedupable {
            open.key_index.insert(item.key().clone(), open.items.len() - 1);
        }

        let full = open.num_live >= inner.chk_max_items
            || open.created.elapsed() >= inner.chk_max_age;
        let mut opened_new = false;
        if full {
            open.close();
            let id = inner.next_checkpoint_id;
            inner.next_checkpoint_id += 1;
            inner.checkpoints.push_back(Checkpoint::new(id, seqno + 1));
            opened_new = true;
            tracing::debug!(vbid = %self.vbid, checkpoint = id, snap_start = seqno + 1,
                "opened new checkpoint");
        }

        Ok(QueueResult {
            seqno,
            opened_new_checkpoint: opened_new,
        })
    }

    /// Appends an item that already carries a seqno (replica apply path).
    /// The seqno must advance the log.
    pub fn queue_with_seqno(&mut self, item: &QueuedItem, seqno: u64) -> Result<QueueResult> {
        if seqno <= self.inner.high_seqno {
            return Err(errlogic!(
                "replicated seqno {seqno} does not advance high seqno {}",
                self.inner.high_seqno
            ));
        }
        // Delegate by pre-setting the gap: queue_dirty assigns high+1.
        self.inner.high_seqno = seqno - 1;
        self.queue_dirty(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Datatype, DocKey, Item};

    fn manager() -> CheckpointManager {
        CheckpointManager::new(Vbid(0), 100, Duration::from_secs(3600), 0)
    }

    fn mutation(key: &[u8], value: &[u8]) -> Item {
        Item::new(
            DocKey::plain(key),
            value.to_vec(),
            0,
            Datatype::RAW,
            0,
            42,
            Operation::Mutation,
            None,
        )
        .unwrap()
    }

    fn queue(mgr: &CheckpointManager, key: &[u8], value: &[u8]) -> QueueResult {
        mgr.lock()
            .queue_dirty(&QueuedItem::new(mutation(key, value)))
            .unwrap()
    }

    #[test]
    fn test_seqnos_strictly_increase() {
        let mgr = manager();
        let mut last = 0;
        for i in 0..50u32 {
            let result = queue(&mgr, format!("k{i}").as_bytes(), b"v");
            assert!(result.seqno > last);
            last = result.seqno;
        }
        assert_eq!(mgr.high_seqno(), 50);
    }

    #[test]
    fn test_dedup_within_open_checkpoint() {
        let mgr = manager();
        queue(&mgr, b"k", b"v1");
        let r2 = queue(&mgr, b"k", b"v2");
        // Seqno advanced even though the first entry was discarded
        assert_eq!(r2.seqno, 2);

        let batches = mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        assert_eq!(batches.len(), 1);
        let items = &batches[0].items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].seqno(), 2);
        assert_eq!(items[0].value(), b"v2");
        assert_eq!(batches[0].snap_start, 2);
    }

    #[test]
    fn test_dedup_does_not_cross_checkpoints() {
        let mgr = CheckpointManager::new(Vbid(0), 2, Duration::from_secs(3600), 0);
        queue(&mgr, b"k", b"v1");
        queue(&mgr, b"other", b"x"); // closes the checkpoint (2 items)
        queue(&mgr, b"k", b"v2");

        let batches = mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        let all: Vec<u64> = batches
            .iter()
            .flat_map(|b| b.items.iter().map(|i| i.seqno()))
            .collect();
        // Both versions of k survive, in different checkpoints
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn test_prepare_commit_not_deduped() {
        let mgr = manager();
        let prepare = Item::new(
            DocKey::plain(b"k"),
            b"v".to_vec(),
            0,
            Datatype::RAW,
            0,
            42,
            Operation::PendingSyncWrite,
            Some(crate::item::DurabilityRequirement::majority()),
        )
        .unwrap();
        mgr.lock().queue_dirty(&QueuedItem::new(prepare)).unwrap();
        let commit = Item::new(
            DocKey::plain(b"k"),
            b"v".to_vec(),
            0,
            Datatype::RAW,
            0,
            43,
            Operation::CommitSyncWrite,
            None,
        )
        .unwrap();
        mgr.lock().queue_dirty(&QueuedItem::new(commit)).unwrap();
        // A later plain mutation must not displace either sync-write record
        queue(&mgr, b"k", b"v2");

        let batches = mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        let seqnos: Vec<u64> = batches
            .iter()
            .flat_map(|b| b.items.iter().map(|i| i.seqno()))
            .collect();
        assert_eq!(seqnos, vec![1, 2, 3]);
    }

    #[test]
    fn test_checkpoint_rollover_on_max_items() {
        let mgr = CheckpointManager::new(Vbid(0), 3, Duration::from_secs(3600), 0);
        assert!(!queue(&mgr, b"a", b"1").opened_new_checkpoint);
        assert!(!queue(&mgr, b"b", b"2").opened_new_checkpoint);
        assert!(queue(&mgr, b"c", b"3").opened_new_checkpoint);
        assert_eq!(mgr.num_checkpoints(), 2);
        // New checkpoint's snapshot starts past the closed one
        queue(&mgr, b"d", b"4");
        let (snap_start, snap_end) = mgr.snapshot_range();
        assert_eq!((snap_start, snap_end), (4, 4));
    }

    #[test]
    fn test_cursor_batches_respect_checkpoint_boundaries() {
        let mgr = CheckpointManager::new(Vbid(0), 2, Duration::from_secs(3600), 0);
        queue(&mgr, b"a", b"1");
        queue(&mgr, b"b", b"2");
        queue(&mgr, b"c", b"3");

        let batches = mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!((batches[0].snap_start, batches[0].snap_end), (1, 2));
        assert_eq!((batches[1].snap_start, batches[1].snap_end), (3, 3));
        assert_ne!(batches[0].checkpoint_id, batches[1].checkpoint_id);

        // Cursor is drained
        let again = mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_register_cursor_resume_and_miss() {
        let mgr = manager();
        for i in 0..5u32 {
            queue(&mgr, format!("k{i}").as_bytes(), b"v");
        }
        // Resume mid-log
        let first = mgr.register_cursor("stream-a", 2).unwrap();
        assert_eq!(first, 3);
        let batches = mgr.next_items("stream-a", 100).unwrap();
        let seqnos: Vec<u64> = batches
            .iter()
            .flat_map(|b| b.items.iter().map(|i| i.seqno()))
            .collect();
        assert_eq!(seqnos, vec![3, 4, 5]);

        // Resume at the tip parks the cursor
        let next = mgr.register_cursor("stream-b", 5).unwrap();
        assert_eq!(next, 6);
        assert!(mgr.next_items("stream-b", 100).unwrap().is_empty());
    }

    #[test]
    fn test_register_cursor_after_removal_requires_backfill() {
        let mgr = CheckpointManager::new(Vbid(0), 2, Duration::from_secs(3600), 0);
        for i in 0..6u32 {
            queue(&mgr, format!("k{i}").as_bytes(), b"v");
        }
        // Drain persistence so the closed checkpoints are removable
        mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        let freed = mgr.remove_closed_unreferenced();
        assert!(freed > 0);
        // History from seqno 0 is gone
        assert!(mgr.register_cursor("late", 0).is_none());
    }

    #[test]
    fn test_remove_blocked_by_cursor() {
        let mgr = CheckpointManager::new(Vbid(0), 2, Duration::from_secs(3600), 0);
        for i in 0..4u32 {
            queue(&mgr, format!("k{i}").as_bytes(), b"v");
        }
        // Persistence cursor still at the start; nothing may be removed
        assert_eq!(mgr.remove_closed_unreferenced(), 0);
        mgr.next_items(PERSISTENCE_CURSOR, 100).unwrap();
        assert!(mgr.remove_closed_unreferenced() > 0);
    }

    #[test]
    fn test_dropped_cursor_reports_range() {
        let mgr = manager();
        queue(&mgr, b"a", b"1");
        mgr.register_cursor("stream", 0).unwrap();
        assert!(mgr.drop_cursor("stream"));
        assert_eq!(mgr.next_items("stream", 10), Err(Error::Range));
        // Persistence can never be dropped
        assert!(!mgr.drop_cursor(PERSISTENCE_CURSOR));
    }

    #[test]
    fn test_slow_cursors() {
        let mgr = CheckpointManager::new(Vbid(0), 2, Duration::from_secs(3600), 0);
        queue(&mgr, b"a", b"1");
        mgr.register_cursor("laggard", 0).unwrap();
        for i in 0..6u32 {
            queue(&mgr, format!("k{i}").as_bytes(), b"v");
        }
        let slow = mgr.slow_cursors(2);
        assert_eq!(slow, vec!["laggard".to_string()]);
    }

    #[test]
    fn test_queue_with_seqno_replica_path() {
        let mgr = manager();
        let result = mgr
            .lock()
            .queue_with_seqno(&QueuedItem::new(mutation(b"k", b"v")), 10)
            .unwrap();
        assert_eq!(result.seqno, 10);
        assert_eq!(mgr.high_seqno(), 10);
        // Regression is a logic error
        let err = mgr
            .lock()
            .queue_with_seqno(&QueuedItem::new(mutation(b"k2", b"v")), 5)
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_reset_drops_items_and_stream_cursors() {
        let mgr = manager();
        for i in 0..5u32 {
            queue(&mgr, format!("k{i}").as_bytes(), b"v");
        }
        mgr.register_cursor("stream", 0).unwrap();
        mgr.reset(2);
        assert_eq!(mgr.high_seqno(), 2);
        assert!(!mgr.has_cursor("stream"));
        assert!(mgr.has_cursor(PERSISTENCE_CURSOR));
        assert!(mgr.next_items(PERSISTENCE_CURSOR, 10).unwrap().is_empty());
        // Next append continues from the reset point
        let r = queue(&mgr, b"new", b"v");
        assert_eq!(r.seqno, 3);
    }
}
