//! Background fetcher: batched disk reads for operations that missed
//! memory.
//!
//! Partitions accumulate pending fetches (full-eviction misses, ejected
//! values); each fetcher run drains every partition's queue in one
//! get_multi against the store and notifies each waiting cookie exactly
//! once.

use crate::error::Result;
use crate::item::DocKey;

use super::Bucket;

/// One fetcher run across all partitions. Returns the number of keys
/// resolved.
pub(crate) fn run(bucket: &Bucket) -> Result<usize> {
    let mut resolved = 0;
    for vb in bucket.vbmap.all() {
        if !vb.has_pending_fetches() {
            continue;
        }
        let pending = vb.drain_pending_fetches();
        let keys: Vec<DocKey> = pending.keys().cloned().collect();
        let results = match bucket.store.get_multi(vb.id(), &keys) {
            Ok(results) => results,
            Err(e) => {
                // The waiters must still resolve; report the failure.
                tracing::error!(vbid = %vb.id(), error = %e, "background fetch failed");
                for (_, cookies) in pending {
                    for cookie in cookies {
                        cookie.notify(Err(e.clone()));
                    }
                }
                continue;
            }
        };
        let mut docs: std::collections::HashMap<_, _> = results.into_iter().collect();
        for (key, cookies) in pending {
            let doc = docs.remove(&key).flatten();
            vb.complete_fetch(&key, doc, cookies);
            resolved += 1;
        }
    }
    Ok(resolved)
}
