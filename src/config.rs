use std::path::PathBuf;
use std::time::Duration;

/// Policy controlling what the item pager may remove from memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Only values are ejected; key metadata always stays resident.
    ValueOnly,
    /// Metadata may also leave memory; misses require a disk lookup.
    FullEviction,
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for persisted partition state and data files
    pub dir: PathBuf,

    /// Bucket memory quota in bytes (default: 256MB)
    pub max_size: usize,

    /// Fraction of max_size the item pager evicts down to (default: 0.75)
    pub mem_low_wat: f64,

    /// Fraction of max_size that triggers the item pager (default: 0.85)
    pub mem_high_wat: f64,

    /// Fraction of max_size above which mutations are rejected (default: 0.93)
    pub mutation_mem_threshold: f64,

    /// Fraction of max_size above which backfills are deferred (default: 0.96)
    pub backfill_mem_threshold: f64,

    /// Number of partitions, fixed at bucket creation (default: 1024)
    pub max_vbuckets: u16,

    /// Initial hash table capacity per partition (default: 3079)
    pub ht_size: usize,

    /// Number of hash table shard locks per partition (default: 47)
    pub ht_locks: usize,

    /// Items in the open checkpoint before it is closed (default: 500)
    pub chk_max_items: usize,

    /// Age of the open checkpoint before it is closed (default: 5s)
    pub chk_max_age: Duration,

    /// Maximum checkpoints held per partition before cursor dropping (default: 2)
    pub max_checkpoints: usize,

    /// Failover table length cap (default: 25)
    pub max_failover_entries: usize,

    /// Warm-up stops after this fraction of max_size is resident (default: 1.0)
    pub warmup_min_memory_threshold: f64,

    /// Warm-up stops after this fraction of the item count is loaded (default: 1.0)
    pub warmup_min_items_threshold: f64,

    /// Whether full-eviction GETs consult the bloom filter (default: true)
    pub bfilter_enabled: bool,

    /// Eviction policy (default: ValueOnly)
    pub item_eviction_policy: EvictionPolicy,

    /// Cap applied to client-supplied TTLs; zero means uncapped (default: 0)
    pub max_ttl: Duration,

    /// Maximum key length in bytes (default: 250)
    pub max_key_len: usize,

    /// Maximum value size in bytes (default: 20MB)
    pub max_item_size: usize,

    /// Share of pager visits spent on active partitions (default: 0.4)
    pub pager_active_vb_pcnt: f64,

    /// Default sync-write timeout when the client does not supply one
    /// (default: 75s)
    pub sync_write_timeout: Duration,

    /// Replica lag (in seqnos) beyond which a takeover is considered
    /// backed-up and client writes are rejected (default: 5000)
    pub takeover_backlog_limit: u64,

    /// Minimum compression ratio before DCP sends values uncompressed
    /// (default: 0.85)
    pub dcp_min_compression_ratio: f64,

    /// DCP consumer flow-control buffer, granted at connect (default: 10MB)
    pub dcp_conn_buffer_size: usize,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the flusher drains persistence cursors (default: 250ms)
    pub flusher_interval: Duration,

    /// How often closed checkpoints are swept (default: 1s)
    pub checkpoint_remover_interval: Duration,

    /// How often the expiry pager scans for expired documents (default: 10s)
    pub expiry_pager_interval: Duration,

    /// How often memory usage is checked against the high watermark
    /// (default: 500ms)
    pub item_pager_interval: Duration,

    /// How often sync-write timeouts are enforced (default: 1s)
    pub durability_timeout_interval: Duration,

    /// How often persisted tombstones are compacted away (default: 300s)
    pub compactor_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            max_size: 256 * 1024 * 1024,
            mem_low_wat: 0.75,
            mem_high_wat: 0.85,
            mutation_mem_threshold: 0.93,
            backfill_mem_threshold: 0.96,
            max_vbuckets: 1024,
            ht_size: 3079,
            ht_locks: 47,
            chk_max_items: 500,
            chk_max_age: Duration::from_secs(5),
            max_checkpoints: 2,
            max_failover_entries: 25,
            warmup_min_memory_threshold: 1.0,
            warmup_min_items_threshold: 1.0,
            bfilter_enabled: true,
            item_eviction_policy: EvictionPolicy::ValueOnly,
            max_ttl: Duration::ZERO,
            max_key_len: 250,
            max_item_size: 20 * 1024 * 1024,
            pager_active_vb_pcnt: 0.4,
            sync_write_timeout: Duration::from_secs(75),
            takeover_backlog_limit: 5000,
            dcp_min_compression_ratio: 0.85,
            dcp_conn_buffer_size: 10 * 1024 * 1024,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flusher_interval: Duration::from_millis(250),
            checkpoint_remover_interval: Duration::from_secs(1),
            expiry_pager_interval: Duration::from_secs(10),
            item_pager_interval: Duration::from_millis(500),
            durability_timeout_interval: Duration::from_secs(1),
            compactor_interval: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given data directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the bucket memory quota
    pub fn max_size(mut self, bytes: usize) -> Self {
        self.max_size = bytes;
        self
    }

    /// Set the eviction watermarks as fractions of max_size
    pub fn watermarks(mut self, low: f64, high: f64) -> Self {
        self.mem_low_wat = low;
        self.mem_high_wat = high;
        self
    }

    /// Set the number of partitions
    pub fn max_vbuckets(mut self, n: u16) -> Self {
        self.max_vbuckets = n;
        self
    }

    /// Set hash table sizing (initial capacity, shard lock count)
    pub fn hash_table(mut self, size: usize, locks: usize) -> Self {
        self.ht_size = size;
        self.ht_locks = locks;
        self
    }

    /// Set the open-checkpoint item limit
    pub fn chk_max_items(mut self, n: usize) -> Self {
        self.chk_max_items = n;
        self
    }

    /// Set the open-checkpoint age limit
    pub fn chk_max_age(mut self, age: Duration) -> Self {
        self.chk_max_age = age;
        self
    }

    /// Set the eviction policy
    pub fn item_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.item_eviction_policy = policy;
        self
    }

    /// Set the TTL cap
    pub fn max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Enable or disable the bloom filter
    pub fn bfilter_enabled(mut self, enabled: bool) -> Self {
        self.bfilter_enabled = enabled;
        self
    }

    /// Set the default sync-write timeout
    pub fn sync_write_timeout(mut self, timeout: Duration) -> Self {
        self.sync_write_timeout = timeout;
        self
    }

    /// Configure scheduler settings
    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    /// Absolute byte position of the low watermark
    pub fn low_wat_bytes(&self) -> usize {
        (self.max_size as f64 * self.mem_low_wat) as usize
    }

    /// Absolute byte position of the high watermark
    pub fn high_wat_bytes(&self) -> usize {
        (self.max_size as f64 * self.mem_high_wat) as usize
    }

    /// Absolute byte position of the mutation admission threshold
    pub fn mutation_threshold_bytes(&self) -> usize {
        (self.max_size as f64 * self.mutation_mem_threshold) as usize
    }
}

impl SchedulerConfig {
    /// Set the flusher interval
    pub fn flusher_interval(mut self, interval: Duration) -> Self {
        self.flusher_interval = interval;
        self
    }

    /// Set the checkpoint remover interval
    pub fn checkpoint_remover_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_remover_interval = interval;
        self
    }

    /// Set the expiry pager interval
    pub fn expiry_pager_interval(mut self, interval: Duration) -> Self {
        self.expiry_pager_interval = interval;
        self
    }

    /// Set the item pager interval
    pub fn item_pager_interval(mut self, interval: Duration) -> Self {
        self.item_pager_interval = interval;
        self
    }

    /// Set the durability timeout enforcement interval
    pub fn durability_timeout_interval(mut self, interval: Duration) -> Self {
        self.durability_timeout_interval = interval;
        self
    }

    /// Set the tombstone compaction interval
    pub fn compactor_interval(mut self, interval: Duration) -> Self {
        self.compactor_interval = interval;
        self
    }
}
