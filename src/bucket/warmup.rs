//! Warm-up: rebuilding in-memory state from the persisted store.
//!
//! First every persisted partition is recreated from its state blob
//! (state, failover history, max CAS, high seqno), then hash tables are
//! rehydrated from disk until either the memory threshold or the item
//! threshold is reached. Until completion, client operations park on their
//! cookie; they resume when warm-up finishes.

use std::sync::Arc;

use crate::error::Result;
use crate::vbucket::VBucket;

use super::Bucket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmupStats {
    pub vbuckets: usize,
    pub items_loaded: usize,
    pub stopped_on_threshold: bool,
}

pub(crate) fn run(bucket: &Arc<Bucket>) -> Result<WarmupStats> {
    let vbids = bucket.store.list_persisted_vbuckets()?;
    let mut vbs = Vec::new();
    for vbid in vbids {
        let Some(state) = bucket.store.load_vb_state(vbid)? else {
            continue;
        };
        let high_seqno = bucket.store.high_seqno(vbid);
        let vb = VBucket::from_persisted(
            vbid,
            &state,
            high_seqno,
            Arc::clone(&bucket.config),
            Arc::clone(&bucket.mem),
        );
        vb.install_manifest(bucket.collections_manifest());
        bucket.vbmap.insert(Arc::clone(&vb))?;
        bucket
            .last_persisted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vbid, state);
        vbs.push(vb);
    }

    let mem_cap =
        (bucket.config.max_size as f64 * bucket.config.warmup_min_memory_threshold) as usize;
    let total_items: usize = vbs.iter().map(|vb| bucket.store.item_count(vb.id())).sum();
    let item_cap =
        (total_items as f64 * bucket.config.warmup_min_items_threshold).ceil() as usize;

    let mut loaded = 0usize;
    let mut stopped = false;
    'load: for vb in &vbs {
        for doc in bucket.store.scan_seqnos(vb.id(), 0, u64::MAX)? {
            if doc.deleted {
                continue;
            }
            vb.restore_doc(&doc)?;
            loaded += 1;
            if bucket.mem.bytes() >= mem_cap || loaded >= item_cap {
                stopped = loaded < total_items;
                break 'load;
            }
        }
    }

    bucket.finish_warmup();
    let stats = WarmupStats {
        vbuckets: vbs.len(),
        items_loaded: loaded,
        stopped_on_threshold: stopped,
    };
    tracing::info!(
        bucket = %bucket.name(),
        vbuckets = stats.vbuckets,
        items_loaded = stats.items_loaded,
        stopped_on_threshold = stats.stopped_on_threshold,
        "warmup finished"
    );
    Ok(stats)
}
