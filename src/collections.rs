//! Collections manifest and the bucket-wide manager.
//!
//! Documents live in collections identified by a u32. The bucket holds one
//! current manifest; updates are serialized (at most one in flight), applied
//! to every active partition, and rolled back best-effort when any
//! partition rejects the new manifest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::item::{CollectionId, DEFAULT_COLLECTION};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub name: String,
    /// Collection-level TTL cap in seconds; zero means none.
    pub max_ttl: u32,
}

/// An immutable manifest generation. `uid` increases with every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionsManifest {
    pub uid: u64,
    collections: HashMap<CollectionId, CollectionMeta>,
}

impl CollectionsManifest {
    /// The epoch manifest: just the default collection.
    pub fn epoch() -> Self {
        let mut collections = HashMap::new();
        collections.insert(
            DEFAULT_COLLECTION,
            CollectionMeta {
                name: "_default".to_string(),
                max_ttl: 0,
            },
        );
        Self {
            uid: 0,
            collections,
        }
    }

    pub fn with_collection(mut self, id: CollectionId, name: &str) -> Self {
        self.collections.insert(
            id,
            CollectionMeta {
                name: name.to_string(),
                max_ttl: 0,
            },
        );
        self
    }

    pub fn without_collection(mut self, id: CollectionId) -> Self {
        self.collections.remove(&id);
        self
    }

    pub fn uid(mut self, uid: u64) -> Self {
        self.uid = uid;
        self
    }

    pub fn contains(&self, id: CollectionId) -> bool {
        self.collections.contains_key(&id)
    }

    pub fn get(&self, id: CollectionId) -> Option<&CollectionMeta> {
        self.collections.get(&id)
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// Serializes manifest updates across the bucket.
#[derive(Debug)]
pub struct CollectionsManager {
    current: RwLock<Arc<CollectionsManifest>>,
    update_lock: Mutex<()>,
}

impl CollectionsManager {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(CollectionsManifest::epoch())),
            update_lock: Mutex::new(()),
        }
    }

    pub fn current(&self) -> Arc<CollectionsManifest> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Applies a new manifest through `apply`, a callback that pushes the
    /// manifest to every active partition and fails if any rejects it. On
    /// failure the previous manifest is re-applied best-effort and the
    /// update fails.
    pub fn update(
        &self,
        new: CollectionsManifest,
        mut apply: impl FnMut(&Arc<CollectionsManifest>) -> Result<()>,
    ) -> Result<()> {
        let _serialized = self
            .update_lock
            .try_lock()
            .map_err(|_| Error::Busy)?;

        let prev = self.current();
        if new.uid < prev.uid {
            return Err(Error::CollectionsManifestAhead);
        }
        let new = Arc::new(new);
        if let Err(e) = apply(&new) {
            tracing::warn!(error = %e, uid = new.uid, "manifest update rejected, rolling back");
            if let Err(rollback_err) = apply(&prev) {
                tracing::error!(error = %rollback_err, "manifest rollback also failed");
            }
            return Err(Error::CannotApplyCollectionsManifest);
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&new);
        tracing::info!(uid = new.uid, collections = new.len(), "applied collections manifest");
        Ok(())
    }
}

impl Default for CollectionsManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_contains_default() {
        let manifest = CollectionsManifest::epoch();
        assert!(manifest.contains(DEFAULT_COLLECTION));
        assert!(!manifest.contains(9));
    }

    #[test]
    fn test_update_applies() {
        let mgr = CollectionsManager::new();
        let new = CollectionsManifest::epoch()
            .uid(1)
            .with_collection(8, "beers");
        mgr.update(new, |_| Ok(())).unwrap();
        assert!(mgr.current().contains(8));
        assert_eq!(mgr.current().uid, 1);
    }

    #[test]
    fn test_update_rolls_back_on_failure() {
        let mgr = CollectionsManager::new();
        let new = CollectionsManifest::epoch()
            .uid(1)
            .with_collection(8, "beers");

        let mut applied: Vec<u64> = Vec::new();
        let err = mgr
            .update(new, |m| {
                applied.push(m.uid);
                if m.uid == 1 {
                    Err(Error::TempFailure)
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert_eq!(err, Error::CannotApplyCollectionsManifest);
        // New manifest then the old one again (rollback)
        assert_eq!(applied, vec![1, 0]);
        assert!(!mgr.current().contains(8));
    }

    #[test]
    fn test_stale_manifest_rejected() {
        let mgr = CollectionsManager::new();
        mgr.update(CollectionsManifest::epoch().uid(5), |_| Ok(()))
            .unwrap();
        let err = mgr
            .update(CollectionsManifest::epoch().uid(3), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err, Error::CollectionsManifestAhead);
    }
}
