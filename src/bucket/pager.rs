//! Memory recovery: the item pager and the expiry pager.
//!
//! The item pager wakes when estimated memory crosses the high watermark
//! and ejects clean resident values until usage falls to the low
//! watermark, visiting replica partitions before actives (the configured
//! active share protects the working set). Entries are ejected only once
//! their reference bits say not-recently-used; younger entries age one
//! step per visit. Persisted tombstones are removed outright. Under
//! checkpoint pressure, cursors of laggard streams are dropped so closed
//! checkpoints can be reclaimed.

use std::sync::Arc;

use crate::config::EvictionPolicy;
use crate::hashtable::{VisitOutcome, MAX_NRU};
use crate::vbstate::VbState;
use crate::vbucket::VBucket;

use super::Bucket;

/// One expiry-pager sweep over all active partitions.
pub(crate) fn run_expiry_pager(bucket: &Bucket, now_unix: u32) -> usize {
    let mut expired = 0;
    for vb in bucket.vbmap.in_state(VbState::Active) {
        expired += vb.expire_due_items(now_unix);
    }
    if expired > 0 {
        tracing::info!(bucket = %bucket.name(), expired, "expiry pager pass");
    }
    expired
}

/// One item-pager pass. Returns the number of values ejected.
pub(crate) fn run_item_pager(bucket: &Bucket) -> usize {
    let high = bucket.config.high_wat_bytes();
    if bucket.mem.bytes() <= high {
        return 0;
    }
    let low = bucket.config.low_wat_bytes();
    tracing::info!(
        bucket = %bucket.name(),
        mem_used = bucket.mem.bytes(),
        high_wat = high,
        low_wat = low,
        "item pager running"
    );

    // Laggard DCP cursors pin closed checkpoints in memory; drop them
    // first. Their streams recover by backfilling from disk.
    for vb in bucket.vbmap.all() {
        if vb.checkpoint.num_checkpoints() > bucket.config.max_checkpoints {
            for cursor in vb.checkpoint.slow_cursors(bucket.config.max_checkpoints) {
                vb.checkpoint.drop_cursor(&cursor);
            }
            vb.checkpoint.remove_closed_unreferenced();
        }
    }

    // Replicas first; actives only as far as the configured share allows.
    let mut evicted = 0;
    let order: Vec<Arc<VBucket>> = bucket
        .vbmap
        .in_state(VbState::Replica)
        .into_iter()
        .chain(bucket.vbmap.in_state(VbState::Active))
        .collect();
    for vb in order {
        if bucket.mem.bytes() <= low {
            break;
        }
        evicted += evict_from_vbucket(bucket, &vb, low);
    }
    tracing::info!(bucket = %bucket.name(), evicted, mem_used = bucket.mem.bytes(),
        "item pager pass done");
    evicted
}

fn evict_from_vbucket(bucket: &Bucket, vb: &Arc<VBucket>, low_wat: usize) -> usize {
    let persisted = vb.persisted_seqno();
    let policy = bucket.config.item_eviction_policy;
    let mut evicted = 0;
    for idx in 0..vb.ht.num_shards() {
        if bucket.mem.bytes() <= low_wat {
            break;
        }
        let mut shard = vb.ht.lock_shard_idx(idx);
        shard.visit(|_key, sv| {
            if sv.deleted {
                // Tombstone metadata is reclaimable once persisted.
                return if sv.seqno <= persisted && !sv.dirty {
                    evicted += 1;
                    VisitOutcome::Remove
                } else {
                    VisitOutcome::Keep
                };
            }
            if sv.dirty || sv.is_temp() {
                return VisitOutcome::Keep;
            }
            if sv.nru < MAX_NRU {
                sv.nru += 1;
                return VisitOutcome::Keep;
            }
            match policy {
                // Values leave; metadata always stays resident.
                EvictionPolicy::ValueOnly => {
                    if sv.is_resident() {
                        evicted += 1;
                        VisitOutcome::EjectValue
                    } else {
                        VisitOutcome::Keep
                    }
                }
                // Metadata may leave too; later GETs go through the bloom
                // filter and a disk fetch.
                EvictionPolicy::FullEviction => {
                    evicted += 1;
                    VisitOutcome::Remove
                }
            }
        });
    }
    evicted
}
