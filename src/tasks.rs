//! Concrete engine background tasks.
//!
//! Each task holds the bucket weakly and resolves it per run; once the
//! bucket is gone the task reports done and its timer loop exits.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::bucket::Bucket;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context, Scheduler, TaskControl, TaskPriority};

pub(crate) fn register_all(bucket: &Arc<Bucket>, scheduler: &Scheduler) {
    scheduler
        .register(Arc::new(FlusherTask {
            bucket: Arc::downgrade(bucket),
        }))
        .register(Arc::new(CheckpointRemoverTask {
            bucket: Arc::downgrade(bucket),
        }))
        .register(Arc::new(ExpiryPagerTask {
            bucket: Arc::downgrade(bucket),
        }))
        .register(Arc::new(ItemPagerTask {
            bucket: Arc::downgrade(bucket),
        }))
        .register(Arc::new(DurabilityTimeoutTask {
            bucket: Arc::downgrade(bucket),
        }))
        .register(Arc::new(BgFetcherTask {
            bucket: Arc::downgrade(bucket),
        }))
        .register(Arc::new(CompactorTask {
            bucket: Arc::downgrade(bucket),
        }));
}

macro_rules! resolve_or_done {
    ($task:expr) => {
        match $task.bucket.upgrade() {
            Some(bucket) => bucket,
            None => return Ok(TaskControl::Done),
        }
    };
}

pub struct FlusherTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for FlusherTask {
    fn name(&self) -> &'static str {
        "flusher"
    }

    fn description(&self) -> String {
        "Persisting dirty items to the KVStore".to_string()
    }

    fn interval(&self) -> Duration {
        self.bucket
            .upgrade()
            .map(|b| b.config().scheduler.flusher_interval)
            .unwrap_or(Duration::from_secs(1))
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::Writer
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.flush_all()?;
        Ok(TaskControl::Continue)
    }
}

pub struct CheckpointRemoverTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for CheckpointRemoverTask {
    fn name(&self) -> &'static str {
        "checkpoint-remover"
    }

    fn description(&self) -> String {
        "Removing closed unreferenced checkpoints".to_string()
    }

    fn interval(&self) -> Duration {
        self.bucket
            .upgrade()
            .map(|b| b.config().scheduler.checkpoint_remover_interval)
            .unwrap_or(Duration::from_secs(1))
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.run_checkpoint_remover();
        Ok(TaskControl::Continue)
    }
}

pub struct ExpiryPagerTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for ExpiryPagerTask {
    fn name(&self) -> &'static str {
        "expiry-pager"
    }

    fn description(&self) -> String {
        "Paging out expired documents".to_string()
    }

    fn interval(&self) -> Duration {
        self.bucket
            .upgrade()
            .map(|b| b.config().scheduler.expiry_pager_interval)
            .unwrap_or(Duration::from_secs(10))
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.run_expiry_pager();
        Ok(TaskControl::Continue)
    }
}

pub struct ItemPagerTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for ItemPagerTask {
    fn name(&self) -> &'static str {
        "item-pager"
    }

    fn description(&self) -> String {
        "Ejecting resident values above the high watermark".to_string()
    }

    fn interval(&self) -> Duration {
        self.bucket
            .upgrade()
            .map(|b| b.config().scheduler.item_pager_interval)
            .unwrap_or(Duration::from_millis(500))
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.run_item_pager();
        Ok(TaskControl::Continue)
    }
}

pub struct DurabilityTimeoutTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for DurabilityTimeoutTask {
    fn name(&self) -> &'static str {
        "durability-timeout"
    }

    fn description(&self) -> String {
        "Aborting timed-out synchronous writes".to_string()
    }

    fn interval(&self) -> Duration {
        self.bucket
            .upgrade()
            .map(|b| b.config().scheduler.durability_timeout_interval)
            .unwrap_or(Duration::from_secs(1))
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.run_durability_timeouts()?;
        Ok(TaskControl::Continue)
    }
}

pub struct BgFetcherTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for BgFetcherTask {
    fn name(&self) -> &'static str {
        "bg-fetcher"
    }

    fn description(&self) -> String {
        "Fetching documents from the KVStore for parked operations".to_string()
    }

    fn interval(&self) -> Duration {
        // Fetches gate client latency; poll briskly.
        Duration::from_millis(20)
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::Reader
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.run_bgfetcher()?;
        Ok(TaskControl::Continue)
    }
}

pub struct CompactorTask {
    bucket: Weak<Bucket>,
}

#[async_trait::async_trait]
impl BackgroundTask for CompactorTask {
    fn name(&self) -> &'static str {
        "compactor"
    }

    fn description(&self) -> String {
        "Purging persisted tombstones".to_string()
    }

    fn interval(&self) -> Duration {
        self.bucket
            .upgrade()
            .map(|b| b.config().scheduler.compactor_interval)
            .unwrap_or(Duration::from_secs(300))
    }

    fn priority(&self) -> TaskPriority {
        TaskPriority::AuxIo
    }

    fn max_expected_duration(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, _ctx: Context) -> Result<TaskControl> {
        let bucket = resolve_or_done!(self);
        bucket.run_compactor()?;
        Ok(TaskControl::Continue)
    }
}
