//! Per-partition active stream.
//!
//! A stream walks `pending -> backfill -> in_memory` and ends dead, taking
//! the takeover detour when requested. Backfill reads persisted documents
//! in seqno order; the in-memory phase drains a checkpoint cursor. Every
//! contiguous run of items is bracketed by a snapshot marker carrying
//! disk/memory and checkpoint flags. If the cursor is dropped under memory
//! pressure the stream falls back to backfill from the last sent seqno.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::item::{Operation, QueuedItem, Vbid};
use crate::kvstore::KVStore;
use crate::vbstate::VbState;
use crate::vbucket::VBucket;

use super::message::{snapshot, stream_flags, DcpMessage, StreamEndReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Backfilling { from: u64 },
    InMemory,
    TakeoverSend,
    TakeoverWait,
    Dead,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    last_sent_seqno: u64,
    ready: VecDeque<DcpMessage>,
    items_from_backfill: u64,
    items_from_memory: u64,
}

/// Counters exposed per stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub last_sent_seqno: u64,
    pub items_from_backfill: u64,
    pub items_from_memory: u64,
    pub is_dead: bool,
}

pub struct ActiveStream {
    vbid: Vbid,
    opaque: u32,
    flags: u32,
    end_seqno: u64,
    cursor_name: String,
    stream_id: Option<u16>,
    delete_times: bool,
    vb: Arc<VBucket>,
    store: Arc<dyn KVStore>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ActiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveStream")
            .field("vbid", &self.vbid)
            .field("opaque", &self.opaque)
            .field("flags", &self.flags)
            .field("end_seqno", &self.end_seqno)
            .field("cursor_name", &self.cursor_name)
            .field("stream_id", &self.stream_id)
            .field("delete_times", &self.delete_times)
            .field("inner", &self.inner)
            .finish()
    }
}

impl ActiveStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn_name: &str,
        vb: Arc<VBucket>,
        store: Arc<dyn KVStore>,
        opaque: u32,
        flags: u32,
        start_seqno: u64,
        end_seqno: u64,
        stream_id: Option<u16>,
        delete_times: bool,
    ) -> Arc<ActiveStream> {
        let vbid = vb.id();
        let cursor_name = format!("dcp:{conn_name}:{}", vbid.0);
        // Try to serve from memory; fall back to backfill when the
        // checkpoint no longer holds the requested history.
        let phase = match vb.checkpoint.register_cursor(&cursor_name, start_seqno) {
            Some(_) => Phase::InMemory,
            None => Phase::Backfilling { from: start_seqno },
        };
        tracing::debug!(vbid = %vbid, cursor = %cursor_name, start_seqno, ?phase,
            "stream created");
        Arc::new(ActiveStream {
            vbid,
            opaque,
            flags,
            end_seqno,
            cursor_name,
            stream_id,
            delete_times,
            vb,
            store,
            inner: Mutex::new(Inner {
                phase,
                last_sent_seqno: start_seqno,
                ready: VecDeque::new(),
                items_from_backfill: 0,
                items_from_memory: 0,
            }),
        })
    }

    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn is_takeover(&self) -> bool {
        self.flags & stream_flags::TAKEOVER != 0
    }

    pub fn is_dead(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).phase == Phase::Dead
    }

    pub fn stats(&self) -> StreamStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        StreamStats {
            last_sent_seqno: inner.last_sent_seqno,
            items_from_backfill: inner.items_from_backfill,
            items_from_memory: inner.items_from_memory,
            is_dead: inner.phase == Phase::Dead,
        }
    }

    /// Produces the next ready frame, refilling from backfill or the
    /// checkpoint cursor as needed. None means "caught up, nothing to send".
    pub fn next_message(&self) -> Result<Option<DcpMessage>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(msg) = inner.ready.pop_front() {
                return Ok(Some(msg));
            }
            match inner.phase {
                Phase::Dead => return Ok(None),
                Phase::Backfilling { from } => {
                    if !self.run_backfill(&mut inner, from)? {
                        return Ok(None);
                    }
                }
                Phase::InMemory => {
                    if !self.fill_from_checkpoint(&mut inner)? {
                        if self.maybe_finish(&mut inner) {
                            continue;
                        }
                        return Ok(None);
                    }
                }
                Phase::TakeoverSend => {
                    // Hand the partition over: the consumer promotes itself
                    // on receipt and acknowledges.
                    inner.ready.push_back(DcpMessage::SetVbState {
                        vbid: self.vbid,
                        opaque: self.opaque,
                        state: VbState::Active,
                    });
                    inner.phase = Phase::TakeoverWait;
                }
                Phase::TakeoverWait => return Ok(None),
            }
        }
    }

    /// Consumer acknowledged the takeover set-state; the stream ends.
    pub fn takeover_ack(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.phase == Phase::TakeoverWait {
            inner.ready.push_back(DcpMessage::StreamEnd {
                vbid: self.vbid,
                opaque: self.opaque,
                reason: StreamEndReason::Ok,
            });
            inner.phase = Phase::Dead;
            self.vb.checkpoint.drop_cursor(&self.cursor_name);
        }
    }

    /// Terminates the stream: queues the end frame, releases the cursor,
    /// drops unread queues.
    pub fn close(&self, reason: StreamEndReason) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.phase == Phase::Dead {
            return;
        }
        inner.ready.clear();
        inner.ready.push_back(DcpMessage::StreamEnd {
            vbid: self.vbid,
            opaque: self.opaque,
            reason,
        });
        inner.phase = Phase::Dead;
        self.vb.checkpoint.drop_cursor(&self.cursor_name);
        tracing::debug!(vbid = %self.vbid, ?reason, "stream closed");
    }

    /// Scans persisted documents beyond `from` and frames them as a disk
    /// snapshot, then re-registers the memory cursor. Returns false when no
    /// progress could be made (waiting for the flusher).
    fn run_backfill(&self, inner: &mut Inner, from: u64) -> Result<bool> {
        if self.vb.backfills_deferred() {
            tracing::debug!(vbid = %self.vbid, "backfill deferred, memory above threshold");
            return Ok(false);
        }
        let disk_end = self.store.high_seqno(self.vbid).min(self.end_seqno);
        let mut new_from = from;
        if disk_end > from {
            let docs = self.store.scan_seqnos(self.vbid, from + 1, disk_end)?;
            if !docs.is_empty() {
                let start = docs.first().expect("non-empty").seqno;
                let end = docs.last().expect("non-empty").seqno;
                inner.ready.push_back(DcpMessage::SnapshotMarker {
                    vbid: self.vbid,
                    opaque: self.opaque,
                    start,
                    end,
                    flags: snapshot::DISK | snapshot::CHECKPOINT,
                });
                for doc in &docs {
                    let item = QueuedItem::new(doc.to_item()?);
                    let msg = self.frame_for(&item);
                    inner.items_from_backfill += 1;
                    inner.ready.push_back(msg);
                }
                inner.last_sent_seqno = end;
                new_from = end;
            }
        }

        if self.flags & stream_flags::DISK_ONLY != 0 {
            inner.ready.push_back(DcpMessage::StreamEnd {
                vbid: self.vbid,
                opaque: self.opaque,
                reason: StreamEndReason::Ok,
            });
            inner.phase = Phase::Dead;
            self.vb.checkpoint.drop_cursor(&self.cursor_name);
            return Ok(true);
        }

        match self.vb.checkpoint.register_cursor(&self.cursor_name, new_from) {
            Some(_) => {
                inner.phase = Phase::InMemory;
                Ok(true)
            }
            None => {
                // The gap between disk and the retained checkpoints has not
                // been flushed yet; try again after the flusher runs.
                inner.phase = Phase::Backfilling { from: new_from };
                Ok(new_from != from)
            }
        }
    }

    /// Drains the checkpoint cursor into ready frames, one snapshot marker
    /// per checkpoint batch. Returns false when nothing was queued.
    fn fill_from_checkpoint(&self, inner: &mut Inner) -> Result<bool> {
        let batches = match self.vb.checkpoint.next_items(&self.cursor_name, 256) {
            Ok(batches) => batches,
            Err(Error::Range) => {
                // Cursor dropped under memory pressure; re-stream from disk.
                tracing::debug!(vbid = %self.vbid, cursor = %self.cursor_name,
                    "cursor dropped, falling back to backfill");
                inner.phase = Phase::Backfilling {
                    from: inner.last_sent_seqno,
                };
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        let mut queued = false;
        for batch in batches {
            let items: Vec<QueuedItem> = batch
                .items
                .into_iter()
                .filter(|item| {
                    item.seqno() > inner.last_sent_seqno
                        && item.seqno() <= self.end_seqno
                        && !item.operation().is_meta()
                })
                .collect();
            if items.is_empty() {
                continue;
            }
            let start = items.first().expect("non-empty").seqno();
            let end = items.last().expect("non-empty").seqno();
            inner.ready.push_back(DcpMessage::SnapshotMarker {
                vbid: self.vbid,
                opaque: self.opaque,
                start,
                end,
                flags: snapshot::MEMORY | snapshot::CHECKPOINT,
            });
            for item in &items {
                let msg = self.frame_for(item);
                inner.items_from_memory += 1;
                inner.ready.push_back(msg);
            }
            inner.last_sent_seqno = end;
            queued = true;
        }
        Ok(queued)
    }

    /// Caught-up handling: stream-end on reaching end_seqno or a state
    /// change, takeover handoff when the consumer asked for one.
    fn maybe_finish(&self, inner: &mut Inner) -> bool {
        if inner.last_sent_seqno >= self.end_seqno {
            inner.ready.push_back(DcpMessage::StreamEnd {
                vbid: self.vbid,
                opaque: self.opaque,
                reason: StreamEndReason::Ok,
            });
            inner.phase = Phase::Dead;
            self.vb.checkpoint.drop_cursor(&self.cursor_name);
            return true;
        }
        if self.is_takeover() && inner.last_sent_seqno >= self.vb.high_seqno() {
            inner.phase = Phase::TakeoverSend;
            return true;
        }
        if !self.is_takeover() && self.vb.state() != VbState::Active {
            inner.ready.push_back(DcpMessage::StreamEnd {
                vbid: self.vbid,
                opaque: self.opaque,
                reason: StreamEndReason::StateChanged,
            });
            inner.phase = Phase::Dead;
            self.vb.checkpoint.drop_cursor(&self.cursor_name);
            return true;
        }
        false
    }

    fn frame_for(&self, item: &QueuedItem) -> DcpMessage {
        match item.operation() {
            Operation::Deletion => DcpMessage::Deletion {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                by_seqno: item.seqno(),
                rev_seqno: item.rev_seqno(),
                cas: item.cas(),
                delete_time: self.delete_times.then_some(0),
                stream_id: self.stream_id,
            },
            Operation::Expiration => DcpMessage::Expiration {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                by_seqno: item.seqno(),
                rev_seqno: item.rev_seqno(),
                cas: item.cas(),
                delete_time: item.expiry(),
                stream_id: self.stream_id,
            },
            Operation::PendingSyncWrite => DcpMessage::Prepare {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                value: item.value().to_vec(),
                by_seqno: item.seqno(),
                rev_seqno: item.rev_seqno(),
                cas: item.cas(),
                flags: item.flags(),
                expiration: item.expiry(),
                lock_time: 0,
                datatype: item.datatype(),
                nru: 0,
                durability: item
                    .durability()
                    .map(|d| d.level)
                    .unwrap_or(crate::item::DurabilityLevel::Majority),
            },
            Operation::CommitSyncWrite => DcpMessage::Commit {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                prepared_seqno: item.prepared_seqno(),
                commit_seqno: item.seqno(),
            },
            Operation::AbortSyncWrite => DcpMessage::Abort {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                prepared_seqno: item.prepared_seqno(),
                abort_seqno: item.seqno(),
            },
            Operation::SystemEvent => DcpMessage::SystemEvent {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                value: item.value().to_vec(),
                by_seqno: item.seqno(),
                id: 0,
                version: 0,
            },
            // Mutations, and anything meta that slipped through, frame as
            // a mutation of the current content.
            _ => DcpMessage::Mutation {
                vbid: self.vbid,
                opaque: self.opaque,
                key: item.key().clone(),
                value: item.value().to_vec(),
                by_seqno: item.seqno(),
                rev_seqno: item.rev_seqno(),
                cas: item.cas(),
                flags: item.flags(),
                expiration: item.expiry(),
                lock_time: 0,
                datatype: item.datatype(),
                nru: 0,
                stream_id: self.stream_id,
            },
        }
    }
}
