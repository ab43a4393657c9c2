//! Persisted per-partition state.
//!
//! A small JSON blob written next to the partition's data: state, current
//! checkpoint id, snapshot window, max CAS and the failover table. Numeric
//! fields are carried as strings for compatibility with external tooling
//! that treats them as opaque. The blob is rewritten only when `state` or
//! the failover table change, or when a flush advances the snapshot window.

use serde::{Deserialize, Serialize};

use crate::failover::FailoverEntry;

/// Partition state. Active accepts client writes; replica accepts only
/// replicated writes; pending queues client operations until promotion;
/// dead rejects everything and awaits deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VbState {
    Active,
    Replica,
    Pending,
    Dead,
}

impl std::fmt::Display for VbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VbState::Active => "active",
            VbState::Replica => "replica",
            VbState::Pending => "pending",
            VbState::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The persisted blob for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VBucketState {
    pub state: VbState,
    #[serde(with = "u64_string")]
    pub checkpoint_id: u64,
    #[serde(with = "u64_string")]
    pub max_deleted_seqno: u64,
    pub failover_table: Vec<FailoverEntry>,
    #[serde(with = "u64_string")]
    pub snap_start: u64,
    #[serde(with = "u64_string")]
    pub snap_end: u64,
    #[serde(with = "u64_string")]
    pub max_cas: u64,
    pub might_contain_xattrs: bool,
    pub supports_collections: bool,
}

impl VBucketState {
    pub fn new(state: VbState) -> Self {
        Self {
            state,
            checkpoint_id: 0,
            max_deleted_seqno: 0,
            failover_table: Vec::new(),
            snap_start: 0,
            snap_end: 0,
            max_cas: 0,
            might_contain_xattrs: false,
            supports_collections: true,
        }
    }

    /// The blob only needs rewriting when the state or failover history
    /// changed; snapshot-window advances are persisted by the flusher as
    /// part of its batch.
    pub fn needs_to_be_persisted(&self, prev: &VBucketState) -> bool {
        self.state != prev.state || self.failover_table != prev.failover_table
    }

    /// Clears everything back to an empty partition, keeping only the
    /// state. Used by rollback-to-zero and partition reset.
    pub fn reset(&mut self) {
        self.checkpoint_id = 0;
        self.max_deleted_seqno = 0;
        self.snap_start = 0;
        self.snap_end = 0;
        self.max_cas = 0;
        self.might_contain_xattrs = false;
        self.failover_table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VBucketState {
        VBucketState {
            state: VbState::Active,
            checkpoint_id: 3,
            max_deleted_seqno: 11,
            failover_table: vec![
                FailoverEntry {
                    uuid: 0xabc,
                    seqno: 7,
                },
                FailoverEntry { uuid: 0xdef, seqno: 0 },
            ],
            snap_start: 5,
            snap_end: 9,
            max_cas: 1 << 48,
            might_contain_xattrs: true,
            supports_collections: true,
        }
    }

    #[test]
    fn test_serialize_parse_round_trip_is_byte_identical() {
        let state = sample();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: VBucketState = serde_json::from_str(&json).unwrap();
        let json2 = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, json2);
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_numbers_carried_as_strings() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"checkpoint_id\":\"3\""));
        assert!(json.contains("\"max_cas\":\"281474976710656\""));
        assert!(json.contains("\"state\":\"active\""));
        assert!(json.contains("\"might_contain_xattrs\":true"));
    }

    #[test]
    fn test_needs_to_be_persisted() {
        let a = sample();
        let mut b = a.clone();
        // Snapshot advance alone does not force a rewrite
        b.snap_end = 100;
        assert!(!b.needs_to_be_persisted(&a));
        // State change does
        b.state = VbState::Replica;
        assert!(b.needs_to_be_persisted(&a));
        // Failover change does
        let mut c = a.clone();
        c.failover_table.pop();
        assert!(c.needs_to_be_persisted(&a));
    }

    #[test]
    fn test_reset() {
        let mut state = sample();
        state.reset();
        assert_eq!(state.state, VbState::Active);
        assert_eq!(state.checkpoint_id, 0);
        assert_eq!(state.snap_end, 0);
        assert!(state.failover_table.is_empty());
        assert!(!state.might_contain_xattrs);
    }
}
