use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errinval;
use crate::error::Result;

/// Partition (vBucket) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Vbid(pub u16);

impl fmt::Display for Vbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vb:{}", self.0)
    }
}

/// Collection identifier; documents live in exactly one collection.
pub type CollectionId = u32;

/// The default collection every bucket starts with.
pub const DEFAULT_COLLECTION: CollectionId = 0;

/// A document key qualified by its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: CollectionId,
    pub key: Vec<u8>,
}

impl DocKey {
    pub fn new(collection: CollectionId, key: impl Into<Vec<u8>>) -> Self {
        Self {
            collection,
            key: key.into(),
        }
    }

    /// Key in the default collection.
    pub fn plain(key: impl Into<Vec<u8>>) -> Self {
        Self::new(DEFAULT_COLLECTION, key)
    }

    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

/// Value datatype bits carried through storage and DCP unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datatype(pub u8);

impl Datatype {
    pub const RAW: Datatype = Datatype(0x00);
    pub const JSON: Datatype = Datatype(0x01);
    pub const SNAPPY: Datatype = Datatype(0x02);
    pub const XATTR: Datatype = Datatype(0x04);

    pub fn contains(self, other: Datatype) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Datatype) -> Datatype {
        Datatype(self.0 | other.0)
    }

    pub fn without(self, other: Datatype) -> Datatype {
        Datatype(self.0 & !other.0)
    }
}

/// What kind of event an item represents in the checkpoint/DCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Mutation,
    Deletion,
    Expiration,
    PendingSyncWrite,
    CommitSyncWrite,
    AbortSyncWrite,
    SystemEvent,
    CheckpointStart,
    CheckpointEnd,
    SetVbState,
}

impl Operation {
    /// Deletions and expirations both remove the document; only the opcode
    /// on the wire differs.
    pub fn is_delete(self) -> bool {
        matches!(self, Operation::Deletion | Operation::Expiration)
    }

    pub fn is_meta(self) -> bool {
        matches!(
            self,
            Operation::CheckpointStart | Operation::CheckpointEnd | Operation::SetVbState
        )
    }
}

/// Commit status of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommittedState {
    CommittedViaMutation,
    CommittedViaPrepare,
    Pending,
}

impl CommittedState {
    pub fn is_committed(self) -> bool {
        !matches!(self, CommittedState::Pending)
    }
}

/// Durability level of a synchronous write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistOnMaster,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn to_wire(self) -> u8 {
        match self {
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistOnMaster => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }

    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            0x01 => Ok(DurabilityLevel::Majority),
            0x02 => Ok(DurabilityLevel::MajorityAndPersistOnMaster),
            0x03 => Ok(DurabilityLevel::PersistToMajority),
            other => Err(errinval!("unknown durability level {other:#04x}")),
        }
    }
}

/// Durability requirement attached to a synchronous write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurabilityRequirement {
    pub level: DurabilityLevel,
    /// None means "use the bucket default".
    pub timeout: Option<Duration>,
}

impl DurabilityRequirement {
    pub fn majority() -> Self {
        Self {
            level: DurabilityLevel::Majority,
            timeout: None,
        }
    }

    pub fn new(level: DurabilityLevel, timeout: Option<Duration>) -> Self {
        Self { level, timeout }
    }
}

/// CAS values 0 and all-ones are reserved on documents.
pub fn cas_is_reserved(cas: u64) -> bool {
    cas == 0 || cas == u64::MAX
}

/// A single document event. Reference-counted and shared between the hash
/// table, the checkpoint, and in-flight DCP buffers; immutable from the
/// point of view of streaming consumers. The seqno is the one field set
/// after construction, exactly once, at checkpoint enqueue.
#[derive(Debug)]
pub struct Item {
    key: DocKey,
    value: Vec<u8>,
    flags: u32,
    datatype: Datatype,
    /// Absolute unix seconds; zero means no expiry.
    expiry: u32,
    cas: u64,
    rev_seqno: u64,
    seqno: AtomicU64,
    op: Operation,
    durability: Option<DurabilityRequirement>,
    committed: CommittedState,
    /// Deletions, expirations, and prepares of durable deletes.
    deleted: bool,
    /// For commit/abort records: the seqno of the matching prepare.
    prepared_seqno: u64,
}

impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.value == other.value
            && self.flags == other.flags
            && self.datatype == other.datatype
            && self.expiry == other.expiry
            && self.cas == other.cas
            && self.rev_seqno == other.rev_seqno
            && self.seqno.load(Ordering::Relaxed) == other.seqno.load(Ordering::Relaxed)
            && self.op == other.op
            && self.durability == other.durability
            && self.committed == other.committed
            && self.deleted == other.deleted
            && self.prepared_seqno == other.prepared_seqno
    }
}

/// Shared handle; the last holder releases the item.
pub type QueuedItem = Arc<Item>;

impl Item {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: DocKey,
        value: Vec<u8>,
        flags: u32,
        datatype: Datatype,
        expiry: u32,
        cas: u64,
        op: Operation,
        durability: Option<DurabilityRequirement>,
    ) -> Result<Item> {
        if cas_is_reserved(cas) {
            return Err(errinval!("reserved cas value {cas:#x}"));
        }
        let committed = match op {
            Operation::PendingSyncWrite => CommittedState::Pending,
            Operation::CommitSyncWrite => CommittedState::CommittedViaPrepare,
            _ => CommittedState::CommittedViaMutation,
        };
        Ok(Item {
            key,
            value,
            flags,
            datatype,
            expiry,
            cas,
            rev_seqno: 1,
            seqno: AtomicU64::new(0),
            op,
            durability,
            committed,
            deleted: op.is_delete(),
            prepared_seqno: 0,
        })
    }

    /// A deletion/expiration marker for the key. Expirations carry an empty
    /// value after the pre-expiry hook has run.
    pub fn deleted(key: DocKey, cas: u64, op: Operation, rev_seqno: u64) -> Result<Item> {
        if cas_is_reserved(cas) {
            return Err(errinval!("reserved cas value {cas:#x}"));
        }
        debug_assert!(op.is_delete() || op == Operation::AbortSyncWrite);
        Ok(Item {
            key,
            value: Vec::new(),
            flags: 0,
            datatype: Datatype::RAW,
            expiry: 0,
            cas,
            rev_seqno,
            seqno: AtomicU64::new(0),
            op,
            durability: None,
            committed: CommittedState::CommittedViaMutation,
            deleted: true,
            prepared_seqno: 0,
        })
    }

    /// The commit record for a satisfied sync write. Carries the prepared
    /// document's content so flusher and stream consumers see the final
    /// value.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_of(
        key: DocKey,
        value: Vec<u8>,
        flags: u32,
        datatype: Datatype,
        expiry: u32,
        cas: u64,
        rev_seqno: u64,
        deleted: bool,
        prepared_seqno: u64,
    ) -> Result<Item> {
        if cas_is_reserved(cas) {
            return Err(errinval!("reserved cas value {cas:#x}"));
        }
        Ok(Item {
            key,
            value,
            flags,
            datatype,
            expiry,
            cas,
            rev_seqno,
            seqno: AtomicU64::new(0),
            op: Operation::CommitSyncWrite,
            durability: None,
            committed: CommittedState::CommittedViaPrepare,
            deleted,
            prepared_seqno,
        })
    }

    /// The abort record for a timed-out or superseded sync write.
    pub fn abort_of(key: DocKey, cas: u64, rev_seqno: u64, prepared_seqno: u64) -> Result<Item> {
        if cas_is_reserved(cas) {
            return Err(errinval!("reserved cas value {cas:#x}"));
        }
        Ok(Item {
            key,
            value: Vec::new(),
            flags: 0,
            datatype: Datatype::RAW,
            expiry: 0,
            cas,
            rev_seqno,
            seqno: AtomicU64::new(0),
            op: Operation::AbortSyncWrite,
            durability: None,
            committed: CommittedState::CommittedViaMutation,
            deleted: true,
            prepared_seqno,
        })
    }

    /// A prepare for a durable delete: pending until committed, tombstone
    /// once committed.
    pub fn pending_delete(
        key: DocKey,
        cas: u64,
        rev_seqno: u64,
        durability: DurabilityRequirement,
    ) -> Result<Item> {
        if cas_is_reserved(cas) {
            return Err(errinval!("reserved cas value {cas:#x}"));
        }
        Ok(Item {
            key,
            value: Vec::new(),
            flags: 0,
            datatype: Datatype::RAW,
            expiry: 0,
            cas,
            rev_seqno,
            seqno: AtomicU64::new(0),
            op: Operation::PendingSyncWrite,
            durability: Some(durability),
            committed: CommittedState::Pending,
            deleted: true,
            prepared_seqno: 0,
        })
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    pub fn set_rev_seqno(&mut self, rev: u64) {
        self.rev_seqno = rev;
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    pub fn prepared_seqno(&self) -> u64 {
        self.prepared_seqno
    }

    pub fn durability(&self) -> Option<DurabilityRequirement> {
        self.durability
    }

    pub fn committed(&self) -> CommittedState {
        self.committed
    }

    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::SeqCst)
    }

    /// Assigned exactly once by the checkpoint manager at enqueue.
    pub fn set_seqno(&self, seqno: u64) {
        self.seqno.store(seqno, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Approximate memory footprint, used for quota accounting.
    pub fn size(&self) -> usize {
        std::mem::size_of::<Item>() + self.key.len() + self.value.len()
    }
}

/// Current wall-clock time in unix seconds.
pub fn now_unix() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Converts a client-relative TTL to an absolute expiry, applying the
/// bucket max_ttl cap. A zero TTL means no expiry unless the cap forces one.
pub fn expiry_from_ttl(ttl: Duration, max_ttl: Duration, now: u32) -> u32 {
    let effective = if max_ttl > Duration::ZERO && (ttl.is_zero() || ttl > max_ttl) {
        max_ttl
    } else {
        ttl
    };
    if effective.is_zero() {
        0
    } else {
        now.saturating_add(effective.as_secs() as u32)
    }
}

/// Hybrid logical clock minting CAS values: 48 bits of physical
/// microseconds and a 16-bit logical counter breaking ties. Monotonic
/// across the partition; the maximum observed value is persisted and
/// restored at warm-up.
#[derive(Debug)]
pub struct HybridClock {
    max_cas: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self {
            max_cas: AtomicU64::new(0),
        }
    }

    fn physical_now() -> u64 {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        micros << 16
    }

    /// Next CAS: the physical clock when it has advanced, otherwise the
    /// previous value plus one logical tick.
    pub fn next_cas(&self) -> u64 {
        let physical = Self::physical_now();
        loop {
            let prev = self.max_cas.load(Ordering::SeqCst);
            let next = if physical > prev { physical } else { prev + 1 };
            if self
                .max_cas
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    pub fn max_cas(&self) -> u64 {
        self.max_cas.load(Ordering::SeqCst)
    }

    /// Fold in a CAS observed from replication or warm-up.
    pub fn observe_cas(&self, cas: u64) {
        let mut prev = self.max_cas.load(Ordering::SeqCst);
        while cas > prev {
            match self
                .max_cas
                .compare_exchange(prev, cas, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(seen) => prev = seen,
            }
        }
    }
}

impl Default for HybridClock {
    fn default() -> Self {
        Self::new()
    }
}
