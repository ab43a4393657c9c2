//! DCP producer: one consumer connection, many per-partition streams.
//!
//! The producer owns stream lifecycles and the flow-control ledger. The
//! consumer grants a byte budget with buffer-acknowledgement messages; once
//! `unacked_bytes` would exceed the grant the producer stops emitting until
//! acks drain it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::errinval;
use crate::error::{Error, Result};
use crate::failover::{FailoverEntry, StreamHistory};
use crate::item::Vbid;
use crate::kvstore::KVStore;
use crate::vbstate::VbState;
use crate::vbucket::VBucket;

use super::message::{DcpMessage, StreamEndReason};
use super::stream::{ActiveStream, StreamStats};

/// Parameters of a stream request, as carried in its extras.
#[derive(Debug, Clone, Copy)]
pub struct StreamRequest {
    pub opaque: u32,
    pub flags: u32,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub uuid: u64,
    pub snap_start: u64,
    pub snap_end: u64,
    pub stream_id: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerStats {
    pub num_streams: usize,
    pub unacked_bytes: usize,
    pub buffer_grant: usize,
    pub streams: Vec<(Vbid, StreamStats)>,
}

pub struct DcpProducer {
    name: String,
    streams: Mutex<HashMap<Vbid, Arc<ActiveStream>>>,
    /// Byte budget granted by the consumer; zero disables flow control.
    buffer_grant: AtomicUsize,
    unacked_bytes: AtomicUsize,
    stream_ids_enabled: AtomicBool,
    delete_times_enabled: AtomicBool,
    next_stream_id: AtomicU16,
    round_robin: AtomicUsize,
    controls: Mutex<HashMap<String, String>>,
}

impl DcpProducer {
    pub fn new(name: impl Into<String>, default_buffer: usize) -> Arc<DcpProducer> {
        Arc::new(DcpProducer {
            name: name.into(),
            streams: Mutex::new(HashMap::new()),
            buffer_grant: AtomicUsize::new(default_buffer),
            unacked_bytes: AtomicUsize::new(0),
            stream_ids_enabled: AtomicBool::new(false),
            delete_times_enabled: AtomicBool::new(false),
            next_stream_id: AtomicU16::new(1),
            round_robin: AtomicUsize::new(0),
            controls: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Negotiates a connection option (DcpControl).
    pub fn control(&self, key: &str, value: &str) -> Result<()> {
        match key {
            "connection_buffer_size" => {
                let bytes: usize = value
                    .parse()
                    .map_err(|_| errinval!("connection_buffer_size {value:?} not a number"))?;
                self.buffer_grant.store(bytes, Ordering::SeqCst);
            }
            "enable_stream_id" => {
                self.stream_ids_enabled
                    .store(value == "true", Ordering::SeqCst);
            }
            "include_delete_times" => {
                self.delete_times_enabled
                    .store(value == "true", Ordering::SeqCst);
            }
            "enable_noop" | "set_noop_interval" | "send_stream_end_on_client_close_stream" => {
                // Accepted and recorded; behavior is fixed in this engine.
            }
            other => return Err(errinval!("unknown control key {other:?}")),
        }
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        tracing::debug!(producer = %self.name, key, value, "dcp control");
        Ok(())
    }

    /// Opens a stream pinned to the partition. On success returns the
    /// stream and the failover log for the consumer; a divergent history
    /// returns `Rollback`.
    pub fn stream_request(
        &self,
        vb: Arc<VBucket>,
        store: Arc<dyn KVStore>,
        req: StreamRequest,
    ) -> Result<(Arc<ActiveStream>, Vec<FailoverEntry>)> {
        if req.stream_id.is_some() && !self.stream_ids_enabled.load(Ordering::SeqCst) {
            return Err(Error::DcpStreamIdInvalid);
        }
        if req.start_seqno > req.end_seqno
            || req.snap_start > req.start_seqno
            || req.start_seqno > req.snap_end
        {
            return Err(Error::Range);
        }
        if vb.state() != VbState::Active {
            return Err(Error::NotMyVbucket);
        }
        if req.start_seqno > vb.high_seqno() {
            return Err(Error::Range);
        }
        // History below the purge horizon is gone from disk; the consumer
        // must restart from scratch.
        if req.start_seqno != 0 && req.start_seqno < vb.purge_seqno() {
            return Err(Error::Rollback(0));
        }

        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = streams.get(&vb.id()) {
            if !existing.is_dead() {
                return Err(Error::Busy);
            }
        }

        match vb.check_stream_history(req.uuid, req.start_seqno) {
            StreamHistory::Consistent => {}
            StreamHistory::Rollback(seqno) => return Err(Error::Rollback(seqno)),
        }

        // Consumers that negotiated stream-ids may omit one; assign the
        // next id on their behalf.
        let stream_id = if self.stream_ids_enabled.load(Ordering::SeqCst) {
            Some(
                req.stream_id
                    .unwrap_or_else(|| self.next_stream_id.fetch_add(1, Ordering::SeqCst)),
            )
        } else {
            None
        };
        let failover_log = vb.failover_entries();
        let stream = ActiveStream::new(
            &self.name,
            Arc::clone(&vb),
            store,
            req.opaque,
            req.flags,
            req.start_seqno,
            req.end_seqno,
            stream_id,
            self.delete_times_enabled.load(Ordering::SeqCst),
        );
        streams.insert(vb.id(), Arc::clone(&stream));
        tracing::info!(producer = %self.name, vbid = %vb.id(),
            start = req.start_seqno, end = req.end_seqno, "stream request accepted");
        Ok((stream, failover_log))
    }

    /// Produces the next frame across all streams, round-robin, honoring
    /// the consumer's buffer grant. None means idle (caught up or
    /// suspended on flow control).
    pub fn step(&self) -> Result<Option<DcpMessage>> {
        let grant = self.buffer_grant.load(Ordering::SeqCst);
        if grant > 0 && self.unacked_bytes.load(Ordering::SeqCst) >= grant {
            return Ok(None);
        }

        let streams: Vec<Arc<ActiveStream>> = {
            let map = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        if streams.is_empty() {
            return Ok(None);
        }
        let offset = self.round_robin.fetch_add(1, Ordering::Relaxed);
        for i in 0..streams.len() {
            let stream = &streams[(offset + i) % streams.len()];
            if let Some(msg) = stream.next_message()? {
                self.unacked_bytes
                    .fetch_add(msg.encoded_len(), Ordering::SeqCst);
                if stream.is_dead() && matches!(msg, DcpMessage::StreamEnd { .. }) {
                    self.streams
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&stream.vbid());
                }
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    /// Consumer returned buffer credit.
    pub fn buffer_ack(&self, bytes: u32) {
        let bytes = bytes as usize;
        let mut current = self.unacked_bytes.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_sub(bytes);
            match self.unacked_bytes.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn unacked_bytes(&self) -> usize {
        self.unacked_bytes.load(Ordering::SeqCst)
    }

    /// Closes one stream; the pending StreamEnd frame is still delivered.
    pub fn close_stream(&self, vbid: Vbid, reason: StreamEndReason) -> Result<()> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let stream = streams.get(&vbid).ok_or(Error::KeyMissing)?;
        stream.close(reason);
        Ok(())
    }

    /// Closes every stream pinned to the partition (rollback, deletion).
    pub fn close_streams_for(&self, vbid: Vbid, reason: StreamEndReason) {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stream) = streams.get(&vbid) {
            stream.close(reason);
        }
    }

    pub fn takeover_ack(&self, vbid: Vbid) -> Result<()> {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        let stream = streams.get(&vbid).ok_or(Error::KeyMissing)?;
        stream.takeover_ack();
        Ok(())
    }

    /// Tears the connection down; streams end with the given reason.
    pub fn close_all(&self, reason: StreamEndReason) {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        for stream in streams.values() {
            stream.close(reason);
        }
    }

    pub fn stats(&self) -> ProducerStats {
        let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        ProducerStats {
            num_streams: streams.len(),
            unacked_bytes: self.unacked_bytes.load(Ordering::SeqCst),
            buffer_grant: self.buffer_grant.load(Ordering::SeqCst),
            streams: streams
                .iter()
                .map(|(vbid, s)| (*vbid, s.stats()))
                .collect(),
        }
    }
}
