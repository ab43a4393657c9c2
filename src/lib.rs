//! emberdb: a partitioned, in-memory, disk-backed key-value storage
//! engine with ordered change streams.
//!
//! # Architecture
//!
//! ```text
//!                      ┌───────────────────────┐
//!  client requests ───►│        Bucket         │──► admission, memory quota
//!                      └──────────┬────────────┘
//!                                 │ routes by partition id
//!                      ┌──────────▼────────────┐
//!                      │   VBucket (per vbid)  │──► state machine, seqnos
//!                      ├───────────┬───────────┤
//!            ┌─────────▼──┐  ┌─────▼────────┐  ┌──────────────────┐
//!            │ Hash Table │  │  Checkpoint  │  │ Durability       │
//!            │ (sharded)  │  │  Manager     │  │ Monitor          │
//!            └────────────┘  └─────┬────────┘  └──────────────────┘
//!                                  │ cursors
//!                   ┌──────────────┼──────────────┐
//!                   ▼              ▼              ▼
//!               Flusher       DCP streams     (more streams)
//!                   │              │
//!                   ▼              ▼
//!               KVStore        consumers
//! ```
//!
//! # Write path
//!
//! 1. The bucket checks warm-up and the memory quota, then routes to the
//!    partition.
//! 2. The partition validates state, CAS, collection and TTL, assigns the
//!    next seqno in its checkpoint, and updates the hash table — all under
//!    the checkpoint and shard locks.
//! 3. The appended item is observed by the flusher (to the KVStore), by
//!    attached DCP streams, and — for synchronous writes — by the
//!    durability monitor, which commits once replica acks satisfy the
//!    requirement.
//!
//! # Ordering
//!
//! Within a partition: enqueue order = seqno order = flush order = stream
//! delivery order. Cross-partition ordering is unspecified.

pub mod bucket;
pub mod checkpoint;
pub mod collections;
pub mod config;
pub mod cookie;
pub mod dcp;
pub mod durability;
pub mod error;
pub mod failover;
pub mod flock;
pub mod hashtable;
pub mod item;
pub mod kvstore;
pub mod scheduler;
pub mod tasks;
pub mod vbmap;
pub mod vbstate;
pub mod vbucket;

pub use bucket::Bucket;
pub use config::{EngineConfig, EvictionPolicy};
pub use cookie::Cookie;
pub use error::{Error, Result};
pub use item::{Datatype, DocKey, DurabilityLevel, DurabilityRequirement, Vbid};
pub use kvstore::{FileKVStore, KVStore, MemoryKVStore};
pub use vbstate::VbState;
pub use vbucket::{DeleteOptions, GetOutcome, MutationOutcome, SetOptions};
