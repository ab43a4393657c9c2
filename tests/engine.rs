//! End-to-end engine scenarios: a bucket over the file store, exercised
//! through the public API the way a front end would drive it.

use std::sync::Arc;
use std::time::Duration;

use emberdb::bucket::Bucket;
use emberdb::dcp::message::{snapshot, DcpMessage};
use emberdb::dcp::producer::StreamRequest;
use emberdb::dcp::DcpProducer;
use emberdb::item::now_unix;
use emberdb::{
    Cookie, DocKey, DurabilityLevel, DurabilityRequirement, EngineConfig, Error, EvictionPolicy,
    FileKVStore, KVStore, MemoryKVStore, SetOptions, VbState, Vbid,
};

fn config() -> EngineConfig {
    EngineConfig::new("/tmp/unused")
        .hash_table(256, 8)
        .max_vbuckets(16)
}

fn stream_req(start: u64, uuid: u64) -> StreamRequest {
    StreamRequest {
        opaque: 1,
        flags: 0,
        start_seqno: start,
        end_seqno: u64::MAX,
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

/// Basic mutation fan-out: two sets reach a fresh DCP stream as
/// one memory snapshot, and survive restart through the file store.
#[test]
fn mutation_fan_out_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(FileKVStore::open(dir.path()).unwrap());
        let bucket = Bucket::open("main", config(), store).unwrap();
        bucket
            .set_vbucket_state(Vbid(7), VbState::Active, Some(vec!["active".into()]))
            .unwrap();

        for (k, v) in [(b"k1".as_ref(), b"v1".as_ref()), (b"k2".as_ref(), b"v2".as_ref())] {
            bucket
                .set(
                    Vbid(7),
                    DocKey::plain(k),
                    v.to_vec(),
                    SetOptions::default(),
                    &Cookie::new(),
                )
                .unwrap();
        }

        let producer = bucket.create_producer("replica-conn");
        let uuid = bucket.vbucket(Vbid(7)).unwrap().failover_entries()[0].uuid;
        bucket
            .dcp_stream_request(&producer, Vbid(7), stream_req(0, uuid))
            .unwrap();

        let msgs = drain(&producer);
        assert!(matches!(
            &msgs[0],
            DcpMessage::SnapshotMarker { start: 1, end: 2, flags, .. }
                if *flags == snapshot::MEMORY | snapshot::CHECKPOINT
        ));
        assert!(matches!(&msgs[1], DcpMessage::Mutation { by_seqno: 1, .. }));
        assert!(matches!(&msgs[2], DcpMessage::Mutation { by_seqno: 2, .. }));

        bucket.flush_all().unwrap();
    }

    // Restart: warm-up rebuilds the partition from the file store.
    let store = Arc::new(FileKVStore::open(dir.path()).unwrap());
    let bucket = Bucket::open("main", config(), store).unwrap();
    let got = bucket
        .get(Vbid(7), &DocKey::plain(b"k2"), &Cookie::new())
        .unwrap();
    assert_eq!(got.value, b"v2");
    assert_eq!(got.seqno, 2);
}

/// Sync write with a majority of three: pending until the second
/// node covers the seqno, then committed and visible.
#[tokio::test]
async fn sync_write_majority_of_three() {
    let store = Arc::new(MemoryKVStore::new());
    let bucket = Bucket::open("main", config(), store).unwrap();
    bucket
        .set_vbucket_state(
            Vbid(0),
            VbState::Active,
            Some(vec!["active".into(), "r1".into(), "r2".into()]),
        )
        .unwrap();

    // Reach seqno 4 with plain writes, then prepare at seqno 5.
    for i in 0..4u32 {
        bucket
            .set(
                Vbid(0),
                DocKey::plain(format!("warm{i}")),
                b"v".to_vec(),
                SetOptions::default(),
                &Cookie::new(),
            )
            .unwrap();
    }
    let cookie = Cookie::new();
    let err = bucket
        .set(
            Vbid(0),
            DocKey::plain(b"k"),
            b"durable".to_vec(),
            SetOptions {
                durability: Some(DurabilityRequirement::majority()),
                ..Default::default()
            },
            &cookie,
        )
        .unwrap_err();
    assert_eq!(err, Error::WouldBlock);
    assert!(cookie.status().is_none());

    // First replica ack reaches majority (active + r1); tracked set
    // empties and the client sees success.
    assert_eq!(bucket.seqno_ack(Vbid(0), "r1", 5, 0).unwrap(), 1);
    assert_eq!(cookie.wait().await, Ok(()));
    let vb = bucket.vbucket(Vbid(0)).unwrap();
    assert_eq!(vb.durability_monitor().num_tracked(), 0);
    // Commit appended at seqno 6.
    assert_eq!(vb.high_seqno(), 6);

    let got = bucket
        .get(Vbid(0), &DocKey::plain(b"k"), &Cookie::new())
        .unwrap();
    assert_eq!(got.value, b"durable");
}

/// Rollback negotiation at the bucket level: a consumer whose
/// history diverged is told where to rewind, and resumes from there.
#[test]
fn dcp_rollback_negotiation() {
    let store = Arc::new(MemoryKVStore::new());
    let bucket = Bucket::open("main", config(), store).unwrap();
    bucket
        .set_vbucket_state(Vbid(0), VbState::Active, Some(vec!["active".into()]))
        .unwrap();
    let uuid_a = bucket.vbucket(Vbid(0)).unwrap().failover_entries()[0].uuid;

    for i in 0..4u32 {
        bucket
            .set(
                Vbid(0),
                DocKey::plain(format!("k{i}")),
                b"v".to_vec(),
                SetOptions::default(),
                &Cookie::new(),
            )
            .unwrap();
    }
    // A failover elsewhere: this node re-promotes and mints (UUID_B, 4).
    bucket
        .set_vbucket_state(Vbid(0), VbState::Replica, None)
        .unwrap();
    bucket
        .set_vbucket_state(Vbid(0), VbState::Active, Some(vec!["active".into()]))
        .unwrap();
    let uuid_b = bucket.vbucket(Vbid(0)).unwrap().failover_entries()[0].uuid;

    let producer = bucket.create_producer("consumer");
    assert_eq!(
        bucket
            .dcp_stream_request(&producer, Vbid(0), stream_req(7, uuid_a))
            .unwrap_err(),
        Error::Rollback(4)
    );

    // The consumer rewinds to 4 and succeeds with the new uuid; streaming
    // resumes at seqno 5.
    bucket
        .dcp_stream_request(&producer, Vbid(0), stream_req(4, uuid_b))
        .unwrap();
    bucket
        .set(
            Vbid(0),
            DocKey::plain(b"k-after"),
            b"v".to_vec(),
            SetOptions::default(),
            &Cookie::new(),
        )
        .unwrap();
    let msgs = drain(&producer);
    assert!(matches!(&msgs[1], DcpMessage::Mutation { by_seqno: 5, .. }));
}

/// Full-eviction miss behavior: a clean bloom filter answers
/// without I/O; a dirty one goes through the background fetcher.
#[tokio::test]
async fn full_eviction_miss_paths() {
    let store = Arc::new(MemoryKVStore::new());
    // A zero low watermark lets the pager evict everything clean.
    let cfg = config()
        .item_eviction_policy(EvictionPolicy::FullEviction)
        .max_size(64 * 1024)
        .watermarks(0.0, 0.0);
    let bucket = Bucket::open("main", cfg, store.clone()).unwrap();
    bucket
        .set_vbucket_state(Vbid(0), VbState::Active, Some(vec!["active".into()]))
        .unwrap();

    // Clean bloom filter: definitive miss, no I/O.
    let fetches_before = store.get_stat("fetches").unwrap();
    assert_eq!(
        bucket
            .get(Vbid(0), &DocKey::plain(b"never-stored"), &Cookie::new())
            .unwrap_err(),
        Error::KeyMissing
    );
    assert_eq!(store.get_stat("fetches").unwrap(), fetches_before);

    // Store a key, persist it, then page its metadata out entirely.
    bucket
        .set(
            Vbid(0),
            DocKey::plain(b"ghost"),
            b"v".to_vec(),
            SetOptions::default(),
            &Cookie::new(),
        )
        .unwrap();
    bucket.flush_all().unwrap();
    for _ in 0..5 {
        bucket.run_item_pager();
    }
    let vb = bucket.vbucket(Vbid(0)).unwrap();
    assert_eq!(
        vb.hashtable_stats().num_items,
        0,
        "full eviction removes metadata"
    );

    // The bloom filter still knows the key, so the GET parks on a fetch,
    // which restores the document from disk.
    let cookie = Cookie::new();
    assert_eq!(
        bucket
            .get(Vbid(0), &DocKey::plain(b"ghost"), &cookie)
            .unwrap_err(),
        Error::WouldBlock
    );
    assert!(bucket.run_bgfetcher().unwrap() > 0);
    assert_eq!(cookie.wait().await, Ok(()));
    let got = bucket
        .get(Vbid(0), &DocKey::plain(b"ghost"), &Cookie::new())
        .unwrap();
    assert_eq!(got.value, b"v");

    // Same path for a key deleted on disk: the fetch proves absence and
    // repeat GETs short-circuit on the proven-absent entry.
    store
        .del(
            Vbid(0),
            emberdb::kvstore::PersistedDoc {
                key: DocKey::plain(b"ghost"),
                value: vec![],
                flags: 0,
                datatype: 0,
                expiry: 0,
                cas: 99,
                seqno: 2,
                rev_seqno: 2,
                deleted: true,
            },
        )
        .unwrap();
    {
        // Page the restored entry back out.
        bucket.flush_all().unwrap();
        for _ in 0..5 {
            bucket.run_item_pager();
        }
    }
    let cookie = Cookie::new();
    assert_eq!(
        bucket
            .get(Vbid(0), &DocKey::plain(b"ghost"), &cookie)
            .unwrap_err(),
        Error::WouldBlock
    );
    bucket.run_bgfetcher().unwrap();
    assert_eq!(cookie.wait().await, Err(Error::KeyMissing));
    assert_eq!(
        bucket
            .get(Vbid(0), &DocKey::plain(b"ghost"), &Cookie::new())
            .unwrap_err(),
        Error::KeyMissing
    );
}

/// Expiry in the past but nonzero schedules immediate expiration, and
/// the expiration streams with its own opcode.
#[test]
fn immediate_expiry_streams_as_expiration() {
    let store = Arc::new(MemoryKVStore::new());
    let bucket = Bucket::open("main", config(), store).unwrap();
    bucket
        .set_vbucket_state(Vbid(0), VbState::Active, Some(vec!["active".into()]))
        .unwrap();

    bucket
        .set(
            Vbid(0),
            DocKey::plain(b"transient"),
            b"v".to_vec(),
            SetOptions {
                ttl: Duration::from_secs(1),
                ..Default::default()
            },
            &Cookie::new(),
        )
        .unwrap();

    let producer = bucket.create_producer("obs");
    let vb = bucket.vbucket(Vbid(0)).unwrap();
    let uuid = vb.failover_entries()[0].uuid;
    bucket
        .dcp_stream_request(&producer, Vbid(0), stream_req(0, uuid))
        .unwrap();
    drain(&producer);

    // Pretend the pager runs two seconds later.
    assert_eq!(vb.expire_due_items(now_unix() + 2), 1);
    let msgs = drain(&producer);
    assert!(matches!(
        msgs.as_slice(),
        [
            DcpMessage::SnapshotMarker { .. },
            DcpMessage::Expiration { by_seqno: 2, .. }
        ]
    ));
}

/// PersistToMajority commits only after both the replica and the local
/// flusher confirm disk.
#[tokio::test]
async fn persist_to_majority_waits_for_local_flush() {
    let store = Arc::new(MemoryKVStore::new());
    let bucket = Bucket::open("main", config(), store).unwrap();
    bucket
        .set_vbucket_state(
            Vbid(0),
            VbState::Active,
            Some(vec!["active".into(), "r1".into()]),
        )
        .unwrap();

    let cookie = Cookie::new();
    bucket
        .set(
            Vbid(0),
            DocKey::plain(b"k"),
            b"v".to_vec(),
            SetOptions {
                durability: Some(DurabilityRequirement::new(
                    DurabilityLevel::PersistToMajority,
                    None,
                )),
                ..Default::default()
            },
            &cookie,
        )
        .unwrap_err();

    // Replica has it on disk; the active has not flushed yet.
    assert_eq!(bucket.seqno_ack(Vbid(0), "r1", 1, 1).unwrap(), 0);
    assert!(cookie.status().is_none());

    // Local flush persists up to the prepare's seqno and completes it.
    bucket.flush_all().unwrap();
    assert_eq!(cookie.wait().await, Ok(()));
}
