use std::sync::Arc;

use crate::config::EngineConfig;
use crate::cookie::Cookie;
use crate::error::Error;
use crate::hashtable::MemCounter;
use crate::item::{Datatype, DocKey, DurabilityRequirement, Vbid};
use crate::kvstore::{KVStore, MemoryKVStore, PersistedDoc};
use crate::vbstate::VbState;
use crate::vbucket::{SetOptions, VBucket};

use super::message::{snapshot, stream_flags, DcpMessage, StreamEndReason};
use super::producer::{DcpProducer, StreamRequest};

fn config() -> Arc<EngineConfig> {
    Arc::new(EngineConfig::new("/tmp/unused").hash_table(64, 4).chk_max_items(100))
}

fn active_vb() -> Arc<VBucket> {
    let vb = VBucket::new(Vbid(7), VbState::Active, config(), MemCounter::new());
    vb.register_replication_chain(vec!["active".into()]).unwrap();
    vb
}

fn set(vb: &VBucket, key: &[u8], value: &[u8]) -> u64 {
    vb.set(
        DocKey::plain(key),
        value.to_vec(),
        SetOptions::default(),
        &Cookie::new(),
    )
    .unwrap()
    .seqno
}

fn request(vb: &VBucket, start: u64, end: u64, uuid: u64) -> StreamRequest {
    StreamRequest {
        opaque: 0xab,
        flags: 0,
        start_seqno: start,
        end_seqno: end,
        uuid,
        snap_start: start,
        snap_end: start,
        stream_id: None,
    }
}

fn drain(producer: &DcpProducer) -> Vec<DcpMessage> {
    let mut out = Vec::new();
    while let Some(msg) = producer.step().unwrap() {
        out.push(msg);
    }
    out
}

#[test]
fn test_basic_mutation_fan_out() {
    // Two sets stream as one memory snapshot.
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k1", b"v1");
    set(&vb, b"k2", b"v2");

    let producer = DcpProducer::new("repl:a", 0);
    let uuid = vb.failover_entries()[0].uuid;
    let (_, failover_log) = producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();
    assert_eq!(failover_log, vb.failover_entries());

    let msgs = drain(&producer);
    assert_eq!(msgs.len(), 3);
    match &msgs[0] {
        DcpMessage::SnapshotMarker { start, end, flags, .. } => {
            assert_eq!((*start, *end), (1, 2));
            assert_eq!(*flags, snapshot::MEMORY | snapshot::CHECKPOINT);
        }
        other => panic!("expected snapshot marker, got {other:?}"),
    }
    match &msgs[1] {
        DcpMessage::Mutation { key, by_seqno, value, .. } => {
            assert_eq!(key.key, b"k1");
            assert_eq!(*by_seqno, 1);
            assert_eq!(value, b"v1");
        }
        other => panic!("expected mutation, got {other:?}"),
    }
    match &msgs[2] {
        DcpMessage::Mutation { key, by_seqno, .. } => {
            assert_eq!(key.key, b"k2");
            assert_eq!(*by_seqno, 2);
        }
        other => panic!("expected mutation, got {other:?}"),
    }
}

#[test]
fn test_seqnos_strictly_increase_on_stream() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    for i in 0..20u32 {
        set(&vb, format!("k{}", i % 5).as_bytes(), b"v");
    }
    let producer = DcpProducer::new("repl:mono", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();

    let mut last = 0;
    for msg in drain(&producer) {
        if let DcpMessage::Mutation { by_seqno, .. } = msg {
            assert!(by_seqno > last, "seqno {by_seqno} not above {last}");
            last = by_seqno;
        }
    }
    assert!(last > 0);
}

#[test]
fn test_rollback_negotiation() {
    // A consumer at (UUID_A, 7) against a table whose newest
    // entry is (UUID_B, 4).
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    let uuid_a = vb.failover_entries()[0].uuid;
    for i in 0..4u32 {
        set(&vb, format!("k{i}").as_bytes(), b"v");
    }
    // Failover: demote and re-promote to mint (UUID_B, 4).
    vb.set_state(VbState::Replica).unwrap();
    vb.set_state(VbState::Active).unwrap();
    let uuid_b = vb.failover_entries()[0].uuid;
    assert_ne!(uuid_a, uuid_b);
    assert_eq!(vb.failover_entries()[0].seqno, 4);

    let producer = DcpProducer::new("repl:rb", 0);
    let err = producer
        .stream_request(
            Arc::clone(&vb),
            Arc::clone(&store),
            request(&vb, 7, u64::MAX, uuid_a),
        )
        .unwrap_err();
    assert_eq!(err, Error::Rollback(4));

    // Consumer rewinds to 4 and re-requests with the new uuid.
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 4, u64::MAX, uuid_b))
        .unwrap();
    set(&vb, b"k-after", b"v");
    let msgs = drain(&producer);
    let seqnos: Vec<u64> = msgs
        .iter()
        .filter_map(|m| match m {
            DcpMessage::Mutation { by_seqno, .. } => Some(*by_seqno),
            _ => None,
        })
        .collect();
    assert_eq!(seqnos, vec![5]);
}

#[test]
fn test_checkpoint_dedup_stream() {
    // Only the surviving version of a deduplicated key streams; the
    // snapshot shifts to the surviving seqno.
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k", b"v1");
    set(&vb, b"k", b"v2");

    let producer = DcpProducer::new("repl:dedup", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();

    let msgs = drain(&producer);
    assert_eq!(msgs.len(), 2);
    match &msgs[0] {
        DcpMessage::SnapshotMarker { start, end, .. } => assert_eq!((*start, *end), (2, 2)),
        other => panic!("expected marker, got {other:?}"),
    }
    match &msgs[1] {
        DcpMessage::Mutation { by_seqno, value, .. } => {
            assert_eq!(*by_seqno, 2);
            assert_eq!(value, b"v2");
        }
        other => panic!("expected mutation, got {other:?}"),
    }
}

#[test]
fn test_backfill_then_memory_phase() {
    let store = Arc::new(MemoryKVStore::new());
    // Three documents already persisted; the in-memory checkpoint starts
    // past them (as after a warm-up).
    for s in 1..=3u64 {
        store
            .set(
                Vbid(7),
                PersistedDoc {
                    key: DocKey::plain(format!("k{s}")),
                    value: b"disk".to_vec(),
                    flags: 0,
                    datatype: 0,
                    expiry: 0,
                    cas: 100 + s,
                    seqno: s,
                    rev_seqno: 1,
                    deleted: false,
                },
            )
            .unwrap();
    }
    let state = crate::vbstate::VBucketState::new(VbState::Active);
    let vb = VBucket::from_persisted(Vbid(7), &state, 3, config(), MemCounter::new());
    vb.register_replication_chain(vec!["active".into()]).unwrap();

    let producer = DcpProducer::new("repl:bf", 0);
    let uuid = vb.failover_entries()[0].uuid;
    let store_dyn: Arc<dyn KVStore> = store;
    producer
        .stream_request(
            Arc::clone(&vb),
            Arc::clone(&store_dyn),
            request(&vb, 0, u64::MAX, uuid),
        )
        .unwrap();

    let msgs = drain(&producer);
    // Disk snapshot with the three backfilled documents.
    match &msgs[0] {
        DcpMessage::SnapshotMarker { start, end, flags, .. } => {
            assert_eq!((*start, *end), (1, 3));
            assert_eq!(*flags, snapshot::DISK | snapshot::CHECKPOINT);
        }
        other => panic!("expected disk marker, got {other:?}"),
    }
    assert_eq!(msgs.len(), 4);

    // New writes continue in the memory phase.
    set(&vb, b"k-new", b"mem");
    let msgs = drain(&producer);
    match &msgs[0] {
        DcpMessage::SnapshotMarker { start, end, flags, .. } => {
            assert_eq!((*start, *end), (4, 4));
            assert_eq!(*flags, snapshot::MEMORY | snapshot::CHECKPOINT);
        }
        other => panic!("expected memory marker, got {other:?}"),
    }
}

#[test]
fn test_flow_control_suspends_stream() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    for i in 0..10u32 {
        set(&vb, format!("key-{i}").as_bytes(), b"some-value-bytes");
    }
    // A tiny grant: one frame suspends the producer.
    let producer = DcpProducer::new("repl:fc", 16);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();

    let first = producer.step().unwrap();
    assert!(first.is_some());
    assert!(producer.unacked_bytes() >= 16);
    // Suspended until the consumer acks.
    assert!(producer.step().unwrap().is_none());

    producer.buffer_ack(producer.unacked_bytes() as u32);
    assert!(producer.step().unwrap().is_some());
}

#[test]
fn test_stream_end_on_state_change() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k", b"v");
    let producer = DcpProducer::new("repl:sc", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();
    // Drain the snapshot, then demote the partition.
    drain(&producer);
    vb.set_state(VbState::Replica).unwrap();

    let msgs = drain(&producer);
    assert_eq!(msgs.len(), 1);
    match &msgs[0] {
        DcpMessage::StreamEnd { reason, .. } => {
            assert_eq!(*reason, StreamEndReason::StateChanged)
        }
        other => panic!("expected stream end, got {other:?}"),
    }
    assert_eq!(producer.stats().num_streams, 0);
}

#[test]
fn test_bounded_stream_ends_ok() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    for i in 0..3u32 {
        set(&vb, format!("k{i}").as_bytes(), b"v");
    }
    let producer = DcpProducer::new("repl:b", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, 2, uuid))
        .unwrap();

    let msgs = drain(&producer);
    let seqnos: Vec<u64> = msgs
        .iter()
        .filter_map(|m| match m {
            DcpMessage::Mutation { by_seqno, .. } => Some(*by_seqno),
            _ => None,
        })
        .collect();
    assert_eq!(seqnos, vec![1, 2]);
    assert!(matches!(
        msgs.last(),
        Some(DcpMessage::StreamEnd {
            reason: StreamEndReason::Ok,
            ..
        })
    ));
}

#[tokio::test]
async fn test_prepare_then_commit_streamed_in_order() {
    let vb = active_vb();
    vb.register_replication_chain(vec!["active".into(), "r1".into()])
        .unwrap();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());

    let producer = DcpProducer::new("repl:dur", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();

    let cookie = Cookie::new();
    vb.set(
        DocKey::plain(b"k"),
        b"v".to_vec(),
        SetOptions {
            durability: Some(DurabilityRequirement::majority()),
            datatype: Datatype::RAW,
            ..Default::default()
        },
        &cookie,
    )
    .unwrap_err();

    // The prepare streams before any ack arrives.
    let msgs = drain(&producer);
    assert!(matches!(
        msgs.as_slice(),
        [
            DcpMessage::SnapshotMarker { .. },
            DcpMessage::Prepare { by_seqno: 1, .. }
        ]
    ));

    vb.seqno_ack("r1", 1, 0).unwrap();
    cookie.wait().await.unwrap();

    let msgs = drain(&producer);
    let commit = msgs
        .iter()
        .find_map(|m| match m {
            DcpMessage::Commit {
                prepared_seqno,
                commit_seqno,
                ..
            } => Some((*prepared_seqno, *commit_seqno)),
            _ => None,
        })
        .expect("commit frame");
    assert_eq!(commit, (1, 2));
}

#[test]
fn test_stream_request_validation() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k", b"v");
    let producer = DcpProducer::new("repl:v", 0);
    let uuid = vb.failover_entries()[0].uuid;

    // start beyond high seqno
    assert_eq!(
        producer
            .stream_request(
                Arc::clone(&vb),
                Arc::clone(&store),
                request(&vb, 99, u64::MAX, uuid)
            )
            .unwrap_err(),
        Error::Range
    );
    // stream-id without negotiation
    let mut bad = request(&vb, 0, u64::MAX, uuid);
    bad.stream_id = Some(1);
    assert_eq!(
        producer
            .stream_request(Arc::clone(&vb), Arc::clone(&store), bad)
            .unwrap_err(),
        Error::DcpStreamIdInvalid
    );
    // duplicate stream
    producer
        .stream_request(
            Arc::clone(&vb),
            Arc::clone(&store),
            request(&vb, 0, u64::MAX, uuid),
        )
        .unwrap();
    assert_eq!(
        producer
            .stream_request(
                Arc::clone(&vb),
                Arc::clone(&store),
                request(&vb, 0, u64::MAX, uuid)
            )
            .unwrap_err(),
        Error::Busy
    );

    // replica partitions refuse stream requests
    let replica = VBucket::new(Vbid(1), VbState::Replica, config(), MemCounter::new());
    assert_eq!(
        producer
            .stream_request(replica, store, request(&vb, 0, u64::MAX, uuid))
            .unwrap_err(),
        Error::NotMyVbucket
    );
}

#[test]
fn test_consumer_close_stream() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k", b"v");
    let producer = DcpProducer::new("repl:cl", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();

    producer
        .close_stream(Vbid(7), StreamEndReason::ClosedByConsumer)
        .unwrap();
    let msgs = drain(&producer);
    assert_eq!(msgs.len(), 1);
    assert!(matches!(
        msgs[0],
        DcpMessage::StreamEnd {
            reason: StreamEndReason::ClosedByConsumer,
            ..
        }
    ));
    // The cursor was released; closed checkpoints can be reclaimed.
    assert_eq!(producer.stats().num_streams, 0);
}

#[test]
fn test_control_negotiation() {
    let producer = DcpProducer::new("repl:ctl", 0);
    producer.control("connection_buffer_size", "1024").unwrap();
    producer.control("include_delete_times", "true").unwrap();
    assert!(matches!(
        producer.control("bogus_key", "1"),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_delete_times_control_switches_deletion_frame() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k", b"v");
    vb.delete(
        DocKey::plain(b"k"),
        crate::vbucket::DeleteOptions::default(),
        &Cookie::new(),
    )
    .unwrap();

    let producer = DcpProducer::new("repl:dt", 0);
    producer.control("include_delete_times", "true").unwrap();
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store, request(&vb, 0, u64::MAX, uuid))
        .unwrap();

    let msgs = drain(&producer);
    let deletion = msgs
        .iter()
        .find_map(|m| match m {
            DcpMessage::Deletion { delete_time, .. } => Some(*delete_time),
            _ => None,
        })
        .expect("deletion frame");
    // v2 frame carries a delete time.
    assert!(deletion.is_some());
}

#[test]
fn test_cursor_drop_falls_back_to_backfill() {
    let vb = active_vb();
    let store = Arc::new(MemoryKVStore::new());
    let store_dyn: Arc<dyn KVStore> = Arc::clone(&store) as Arc<dyn KVStore>;

    set(&vb, b"k1", b"v1");
    let producer = DcpProducer::new("conn", 0);
    let uuid = vb.failover_entries()[0].uuid;
    producer
        .stream_request(Arc::clone(&vb), store_dyn, request(&vb, 0, u64::MAX, uuid))
        .unwrap();
    drain(&producer);

    // More writes arrive; the stream's cursor is dropped under pressure
    // before they are streamed, but the flusher got them to disk.
    let s2 = set(&vb, b"k2", b"v2");
    store
        .set(
            Vbid(7),
            PersistedDoc {
                key: DocKey::plain(b"k2"),
                value: b"v2".to_vec(),
                flags: 0,
                datatype: 0,
                expiry: 0,
                cas: 1,
                seqno: s2,
                rev_seqno: 1,
                deleted: false,
            },
        )
        .unwrap();
    assert!(vb.checkpoint.drop_cursor("dcp:conn:7"));

    let msgs = drain(&producer);
    match &msgs[0] {
        DcpMessage::SnapshotMarker { start, end, flags, .. } => {
            assert_eq!((*start, *end), (2, 2));
            assert_eq!(*flags, snapshot::DISK | snapshot::CHECKPOINT);
        }
        other => panic!("expected disk marker, got {other:?}"),
    }
    assert!(matches!(
        &msgs[1],
        DcpMessage::Mutation { by_seqno: 2, .. }
    ));
}

#[test]
fn test_takeover_stream_hands_over() {
    let vb = active_vb();
    let store: Arc<dyn KVStore> = Arc::new(MemoryKVStore::new());
    set(&vb, b"k", b"v");
    let producer = DcpProducer::new("repl:tk", 0);
    let uuid = vb.failover_entries()[0].uuid;
    let mut req = request(&vb, 0, u64::MAX, uuid);
    req.flags = stream_flags::TAKEOVER;
    producer
        .stream_request(Arc::clone(&vb), store, req)
        .unwrap();

    let msgs = drain(&producer);
    // Snapshot, mutation, then the takeover handoff.
    assert!(matches!(
        msgs.last(),
        Some(DcpMessage::SetVbState {
            state: VbState::Active,
            ..
        })
    ));

    // Consumer acknowledges; the stream ends cleanly.
    producer.takeover_ack(Vbid(7)).unwrap();
    let msgs = drain(&producer);
    assert!(matches!(
        msgs.last(),
        Some(DcpMessage::StreamEnd {
            reason: StreamEndReason::Ok,
            ..
        })
    ));
}
