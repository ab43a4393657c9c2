//! Failover history for one partition.
//!
//! Each promotion to active mints a fresh (uuid, high_seqno) entry. DCP
//! consumers present their last known (uuid, seqno) pair at stream request;
//! the table decides whether their history is consistent with ours or how
//! far they must roll back.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// One failover table row. Ordered newest-first in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    #[serde(rename = "id")]
    pub uuid: u64,
    #[serde(rename = "seq")]
    pub seqno: u64,
}

/// Verdict for a consumer's (uuid, start_seqno) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamHistory {
    /// History is consistent; streaming may begin at start_seqno.
    Consistent,
    /// The consumer must roll back to the contained seqno and re-request.
    Rollback(u64),
}

/// Bounded newest-first list of (uuid, seqno) entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
    #[serde(skip, default = "default_max_entries")]
    max_entries: usize,
}

fn default_max_entries() -> usize {
    25
}

impl FailoverTable {
    /// A fresh table for a newly created partition: one entry at seqno 0.
    pub fn new(max_entries: usize, rng: &mut impl Rng) -> Self {
        let mut table = Self {
            entries: Vec::new(),
            max_entries,
        };
        table.create_entry(0, rng);
        table
    }

    /// Rebuilds a table from persisted entries.
    pub fn from_entries(entries: Vec<FailoverEntry>, max_entries: usize) -> Self {
        Self {
            entries,
            max_entries,
        }
    }

    /// Prepends a new entry at the given high seqno, minting a fresh uuid.
    /// Called on every promotion to active. The oldest entry is discarded
    /// once the cap is reached.
    pub fn create_entry(&mut self, high_seqno: u64, rng: &mut impl Rng) -> FailoverEntry {
        // Zero is reserved so a consumer can always send (0, 0) for "no
        // history".
        let uuid = loop {
            let candidate: u64 = rng.gen();
            if candidate != 0 {
                break candidate;
            }
        };
        let entry = FailoverEntry {
            uuid,
            seqno: high_seqno,
        };
        self.entries.insert(0, entry);
        self.entries.truncate(self.max_entries);
        entry
    }

    pub fn latest_entry(&self) -> FailoverEntry {
        self.entries[0]
    }

    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Decides whether a consumer with history (uuid, start_seqno) may
    /// stream from us.
    ///
    /// The consumer's uuid must name an entry; the valid start range for
    /// that entry runs from its seqno up to the seqno of the next-newer
    /// entry (or our high seqno for the newest). A start beyond the range
    /// means the consumer saw seqnos we never did and must roll back to the
    /// range's upper bound. An unknown uuid rolls back to zero.
    pub fn check_stream_request(
        &self,
        uuid: u64,
        start_seqno: u64,
        high_seqno: u64,
    ) -> StreamHistory {
        if start_seqno == 0 {
            // No history yet; any uuid is acceptable.
            return StreamHistory::Consistent;
        }
        let Some(idx) = self.entries.iter().position(|e| e.uuid == uuid) else {
            return StreamHistory::Rollback(0);
        };
        let entry = self.entries[idx];
        let upper = if idx == 0 {
            high_seqno
        } else {
            self.entries[idx - 1].seqno
        };
        if start_seqno >= entry.seqno && start_seqno <= upper {
            StreamHistory::Consistent
        } else if start_seqno > upper {
            StreamHistory::Rollback(upper)
        } else {
            // start below the entry's own seqno: the newest entry whose
            // seqno is <= start governs; since this entry's does not, the
            // consumer's history predates it.
            StreamHistory::Rollback(entry.seqno.min(start_seqno))
        }
    }

    /// Discards entries ahead of a local rollback target so the head seqno
    /// never exceeds it.
    pub fn prune_above(&mut self, seqno: u64) {
        self.entries.retain(|e| e.seqno <= seqno);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_new_table_has_zero_entry() {
        let table = FailoverTable::new(25, &mut rng());
        assert_eq!(table.len(), 1);
        assert_eq!(table.latest_entry().seqno, 0);
        assert_ne!(table.latest_entry().uuid, 0);
    }

    #[test]
    fn test_entries_newest_first_and_capped() {
        let mut r = rng();
        let mut table = FailoverTable::new(3, &mut r);
        table.create_entry(10, &mut r);
        table.create_entry(20, &mut r);
        table.create_entry(30, &mut r);
        assert_eq!(table.len(), 3);
        let seqnos: Vec<u64> = table.entries().iter().map(|e| e.seqno).collect();
        assert_eq!(seqnos, vec![30, 20, 10]);
    }

    #[test]
    fn test_consistent_history() {
        let mut r = rng();
        let mut table = FailoverTable::new(25, &mut r);
        let entry = table.create_entry(4, &mut r);
        assert_eq!(
            table.check_stream_request(entry.uuid, 4, 10),
            StreamHistory::Consistent
        );
        assert_eq!(
            table.check_stream_request(entry.uuid, 10, 10),
            StreamHistory::Consistent
        );
    }

    #[test]
    fn test_unknown_uuid_rolls_back_to_zero() {
        let table = FailoverTable::new(25, &mut rng());
        assert_eq!(
            table.check_stream_request(0xdead_beef, 7, 10),
            StreamHistory::Rollback(0)
        );
    }

    #[test]
    fn test_divergent_history_rolls_back_to_branch_point() {
        // An active emitted 1..10 under UUID_A, then a failover
        // created (UUID_B, 4). A consumer at (UUID_A, 7) saw seqnos 5..7
        // that the new active never did.
        let mut r = rng();
        let mut table = FailoverTable::new(25, &mut r);
        let uuid_a = table.latest_entry().uuid;
        table.create_entry(4, &mut r);
        assert_eq!(
            table.check_stream_request(uuid_a, 7, 12),
            StreamHistory::Rollback(4)
        );
        // At exactly the branch point the history is fine.
        assert_eq!(
            table.check_stream_request(uuid_a, 4, 12),
            StreamHistory::Consistent
        );
    }

    #[test]
    fn test_zero_start_always_consistent() {
        let table = FailoverTable::new(25, &mut rng());
        assert_eq!(
            table.check_stream_request(0, 0, 10),
            StreamHistory::Consistent
        );
    }

    #[test]
    fn test_prune_above() {
        let mut r = rng();
        let mut table = FailoverTable::new(25, &mut r);
        table.create_entry(10, &mut r);
        table.create_entry(20, &mut r);
        table.prune_above(12);
        assert!(table.entries().iter().all(|e| e.seqno <= 12));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut r = rng();
        let mut table = FailoverTable::new(25, &mut r);
        table.create_entry(42, &mut r);
        let json = serde_json::to_string(table.entries()).unwrap();
        let entries: Vec<FailoverEntry> = serde_json::from_str(&json).unwrap();
        let restored = FailoverTable::from_entries(entries, 25);
        assert_eq!(restored.entries(), table.entries());
    }
}
