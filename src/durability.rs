//! Tracking of in-flight synchronous writes for one partition.
//!
//! The monitor holds the ordered list of pending SyncWrites and, per node
//! in the replication chain, dual {memory, disk} positions: the seqno of
//! the last tracked write the node has covered, and the raw ack seqno the
//! node last sent (which may run ahead of any tracked write). Once a prefix
//! of the tracked list satisfies its durability requirements it is handed
//! back for commit, strictly in tracked-write seqno order.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::cookie::Cookie;
use crate::errlogic;
use crate::error::{Error, Result};
use crate::item::{DocKey, DurabilityLevel, DurabilityRequirement, Vbid};

/// Maximum chain length: the active plus up to three replicas.
pub const MAX_CHAIN_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Position {
    /// Largest tracked-write seqno this node has covered on the channel.
    write_seqno: u64,
    /// Last raw seqno the node acknowledged; never decreases and may be
    /// far ahead of write_seqno.
    ack_seqno: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct NodePosition {
    memory: Position,
    disk: Position,
}

/// Node positions snapshot, exposed for stats and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSeqnos {
    pub memory_write_seqno: u64,
    pub memory_ack_seqno: u64,
    pub disk_write_seqno: u64,
    pub disk_ack_seqno: u64,
}

#[derive(Debug)]
struct ReplicationChain {
    /// First entry is the active.
    nodes: Vec<String>,
    positions: HashMap<String, NodePosition>,
}

impl ReplicationChain {
    fn majority(&self) -> usize {
        (self.nodes.len() + 2) / 2
    }

    fn active(&self) -> &str {
        &self.nodes[0]
    }
}

/// A synchronous write awaiting its durability requirement.
#[derive(Debug)]
pub struct SyncWrite {
    pub key: DocKey,
    pub seqno: u64,
    pub requirement: DurabilityRequirement,
    pub cookie: Option<Cookie>,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
struct State {
    chain: Option<ReplicationChain>,
    tracked: VecDeque<SyncWrite>,
}

#[derive(Debug)]
pub struct DurabilityMonitor {
    vbid: Vbid,
    state: Mutex<State>,
}

impl DurabilityMonitor {
    pub fn new(vbid: Vbid) -> Self {
        Self {
            vbid,
            state: Mutex::new(State::default()),
        }
    }

    /// Installs the replication chain (active first, 1..=4 nodes). Node
    /// positions reset; previously tracked writes keep their seqnos and are
    /// re-evaluated against the new chain as acks arrive.
    pub fn register_replication_chain(&self, nodes: Vec<String>) -> Result<()> {
        if nodes.is_empty() || nodes.len() > MAX_CHAIN_SIZE {
            return Err(Error::DurabilityImpossible);
        }
        let positions = nodes
            .iter()
            .map(|n| (n.clone(), NodePosition::default()))
            .collect();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.chain = Some(ReplicationChain { nodes, positions });
        tracing::info!(vbid = %self.vbid, "registered replication chain");
        Ok(())
    }

    pub fn has_chain(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chain
            .is_some()
    }

    pub fn chain_size(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chain
            .as_ref()
            .map_or(0, |c| c.nodes.len())
    }

    pub fn num_tracked(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tracked
            .len()
    }

    pub fn node_seqnos(&self, node: &str) -> Option<NodeSeqnos> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let pos = state.chain.as_ref()?.positions.get(node)?;
        Some(NodeSeqnos {
            memory_write_seqno: pos.memory.write_seqno,
            memory_ack_seqno: pos.memory.ack_seqno,
            disk_write_seqno: pos.disk.write_seqno,
            disk_ack_seqno: pos.disk.ack_seqno,
        })
    }

    /// Starts tracking a new SyncWrite. The write is already in the active's
    /// checkpoint, so the active's memory position advances implicitly.
    /// Returns any writes that became committable (a single-node chain
    /// commits immediately).
    pub fn add_sync_write(
        &self,
        cookie: Option<Cookie>,
        key: DocKey,
        seqno: u64,
        requirement: DurabilityRequirement,
        default_timeout: Duration,
    ) -> Result<Vec<SyncWrite>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.chain.is_none() {
            return Err(Error::DurabilityImpossible);
        }
        if let Some(last) = state.tracked.back() {
            if seqno <= last.seqno {
                return Err(errlogic!(
                    "sync write seqno {seqno} not after tracked tail {}",
                    last.seqno
                ));
            }
        }
        let timeout = requirement.timeout.unwrap_or(default_timeout);
        state.tracked.push_back(SyncWrite {
            key,
            seqno,
            requirement,
            cookie,
            deadline: Instant::now() + timeout,
        });
        let chain = state.chain.as_mut().expect("chain present");
        let active = chain.active().to_string();
        let pos = chain.positions.get_mut(&active).expect("active position");
        pos.memory.write_seqno = seqno;
        pos.memory.ack_seqno = pos.memory.ack_seqno.max(seqno);
        Ok(Self::drain_satisfied(&mut state))
    }

    /// Processes a replica's seqno acknowledgement and returns the prefix
    /// of tracked writes whose requirement is now satisfied, in seqno
    /// order. Regressions and malformed acks are logic errors.
    pub fn seqno_ack_received(
        &self,
        node: &str,
        mem_seqno: u64,
        disk_seqno: u64,
    ) -> Result<Vec<SyncWrite>> {
        if mem_seqno < disk_seqno {
            return Err(errlogic!(
                "ack from {node} has mem_seqno {mem_seqno} < disk_seqno {disk_seqno}"
            ));
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.tracked.is_empty() {
            return Err(errlogic!("ack from {node} with no tracked writes"));
        }
        let tracked_seqnos: Vec<u64> = state.tracked.iter().map(|w| w.seqno).collect();
        let chain = state
            .chain
            .as_mut()
            .ok_or_else(|| errlogic!("ack from {node} with no replication chain"))?;
        let pos = chain
            .positions
            .get_mut(node)
            .ok_or_else(|| errlogic!("ack from unknown node {node}"))?;

        if mem_seqno < pos.memory.ack_seqno || disk_seqno < pos.disk.ack_seqno {
            return Err(errlogic!(
                "ack seqnos from {node} decreased: mem {mem_seqno} (was {}), disk {disk_seqno} (was {})",
                pos.memory.ack_seqno,
                pos.disk.ack_seqno
            ));
        }
        pos.memory.ack_seqno = mem_seqno;
        pos.disk.ack_seqno = disk_seqno;

        // Advance each channel's write cursor to the largest tracked seqno
        // covered by the ack.
        let covered = |ack: u64| {
            tracked_seqnos
                .iter()
                .copied()
                .take_while(|s| *s <= ack)
                .last()
                .unwrap_or(0)
        };
        pos.memory.write_seqno = pos.memory.write_seqno.max(covered(mem_seqno));
        pos.disk.write_seqno = pos.disk.write_seqno.max(covered(disk_seqno));

        Ok(Self::drain_satisfied(&mut state))
    }

    /// Records that the active has persisted up to `seqno`. Feeds the
    /// PersistOnMaster and PersistToMajority requirements.
    pub fn notify_local_persistence(&self, seqno: u64) -> Vec<SyncWrite> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let tracked_seqnos: Vec<u64> = state.tracked.iter().map(|w| w.seqno).collect();
        let Some(chain) = state.chain.as_mut() else {
            return Vec::new();
        };
        let active = chain.active().to_string();
        let pos = chain.positions.get_mut(&active).expect("active position");
        pos.disk.ack_seqno = pos.disk.ack_seqno.max(seqno);
        let covered = tracked_seqnos
            .iter()
            .copied()
            .take_while(|s| *s <= seqno)
            .last()
            .unwrap_or(0);
        pos.disk.write_seqno = pos.disk.write_seqno.max(covered);
        Self::drain_satisfied(&mut state)
    }

    /// Removes and returns writes whose deadline has passed. The caller
    /// aborts them with SyncWriteAmbiguous.
    pub fn expired_writes(&self, now: Instant) -> Vec<SyncWrite> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut expired = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(write) = state.tracked.pop_front() {
            if write.deadline <= now {
                expired.push(write);
            } else {
                remaining.push_back(write);
            }
        }
        state.tracked = remaining;
        expired
    }

    /// Removes and returns every tracked write. Called on demotion and
    /// topology teardown; the caller aborts them.
    pub fn abort_all(&self) -> Vec<SyncWrite> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.tracked.drain(..).collect()
    }

    fn drain_satisfied(state: &mut State) -> Vec<SyncWrite> {
        let Some(chain) = state.chain.as_ref() else {
            return Vec::new();
        };
        let mut n = 0;
        for write in &state.tracked {
            if Self::is_satisfied(chain, write) {
                n += 1;
            } else {
                // The leading unsatisfied write blocks everything behind it
                // so commits are never reordered.
                break;
            }
        }
        state.tracked.drain(..n).collect()
    }

    fn is_satisfied(chain: &ReplicationChain, write: &SyncWrite) -> bool {
        let majority = chain.majority();
        let mem_count = chain
            .nodes
            .iter()
            .filter(|n| chain.positions[*n].memory.write_seqno >= write.seqno)
            .count();
        let disk_count = chain
            .nodes
            .iter()
            .filter(|n| chain.positions[*n].disk.write_seqno >= write.seqno)
            .count();
        match write.requirement.level {
            DurabilityLevel::Majority => mem_count >= majority,
            DurabilityLevel::MajorityAndPersistOnMaster => {
                mem_count >= majority
                    && chain.positions[chain.active()].disk.write_seqno >= write.seqno
            }
            DurabilityLevel::PersistToMajority => disk_count >= majority,
        }
    }
}
