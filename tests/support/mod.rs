//! In-process, channel-free multi-node test cluster.
//!
//! Message passing between nodes over `tokio::sync::mpsc` channels driven by
//! an async loop would reintroduce the scheduling nondeterminism the
//! tick-driven design exists to avoid. This harness instead steps every node
//! directly — `tick_all()` / `deliver_pending()` are plain synchronous calls
//! the test drives in whatever order it likes, so a failing scenario replays
//! identically every time. Partition and crash/pause are modeled with simple
//! `partitioned` / `paused` flags per node; there is no Byzantine fault
//! injection, since the protocol under test assumes only crash faults.

use replicated_consensus_core::{
    Config, ConsensusCore, Entry, EntryKind, LogIndex, MemLogStore, MemMetaStore, Message, NodeId,
};
use std::collections::{HashMap, HashSet};

/// Records every entry handed to it, in the order it was applied, and can
/// produce/restore an opaque snapshot blob. Used by every test in this
/// crate in place of a real embedded key-value engine.
#[derive(Debug, Default, Clone)]
pub struct RecordingStateMachine {
    pub applied: Vec<Entry>,
}

impl replicated_consensus_core::StateMachine for RecordingStateMachine {
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>, replicated_consensus_core::ConsensusError> {
        self.applied.push(entry.clone());
        Ok(entry.payload.clone())
    }

    fn snapshot(&self) -> Vec<u8> {
        serde_json::to_vec(&self.applied).unwrap_or_default()
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<(), replicated_consensus_core::ConsensusError> {
        self.applied = serde_json::from_slice(bytes).unwrap_or_default();
        Ok(())
    }
}

pub struct TestCluster {
    nodes: HashMap<NodeId, ConsensusCore>,
    /// Undirected pairs currently unable to exchange messages in either
    /// direction.
    partitions: HashSet<(NodeId, NodeId)>,
    /// Nodes not currently being driven by `tick_all`/`deliver_pending`, as
    /// though their process had crashed.
    paused: HashSet<NodeId>,
    pending: Vec<(NodeId, NodeId, Message)>,
}

fn partition_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl TestCluster {
    pub fn new(ids: &[&str]) -> Self {
        Self::new_with_timeout(ids, 5)
    }

    pub fn new_with_timeout(ids: &[&str], base_election_timeout: u64) -> Self {
        let mut nodes = HashMap::new();
        for id in ids {
            let mut cfg = Config { base_election_timeout, ..Config::default() };
            for peer in ids.iter().filter(|p| *p != id) {
                cfg.peers.insert((*peer).into(), format!("{peer}:0"));
            }
            let core = ConsensusCore::new(
                (*id).into(),
                cfg,
                Box::new(MemLogStore::new()),
                Box::new(MemMetaStore::default()),
                Box::new(RecordingStateMachine::default()),
            );
            nodes.insert((*id).into(), core);
        }
        Self { nodes, partitions: HashSet::new(), paused: HashSet::new(), pending: Vec::new() }
    }

    pub fn node(&self, id: &str) -> &ConsensusCore {
        self.nodes.get(id).expect("unknown node id")
    }

    pub fn node_mut(&mut self, id: &str) -> &mut ConsensusCore {
        self.nodes.get_mut(id).expect("unknown node id")
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.nodes.values().find(|n| n.is_leader()).map(|n| n.node_id().clone())
    }

    pub fn leaders(&self) -> Vec<NodeId> {
        self.nodes.values().filter(|n| n.is_leader()).map(|n| n.node_id().clone()).collect()
    }

    pub fn partition(&mut self, a: &str, b: &str) {
        self.partitions.insert(partition_key(&a.into(), &b.into()));
    }

    pub fn heal(&mut self, a: &str, b: &str) {
        self.partitions.remove(&partition_key(&a.into(), &b.into()));
    }

    pub fn pause(&mut self, id: &str) {
        self.paused.insert(id.into());
    }

    pub fn resume(&mut self, id: &str) {
        self.paused.remove(id);
    }

    fn connected(&self, a: &NodeId, b: &NodeId) -> bool {
        !self.partitions.contains(&partition_key(a, b))
    }

    /// Advances every non-paused node's timers by one tick and queues
    /// whatever they emit for the next `deliver_pending`.
    pub fn tick_all(&mut self) -> Vec<Entry> {
        let mut applied = Vec::new();
        let ids: Vec<NodeId> = self.nodes.keys().cloned().collect();
        for id in ids {
            if self.paused.contains(&id) {
                continue;
            }
            let result = self.nodes.get_mut(&id).unwrap().tick();
            applied.extend(result.applied);
            for (to, msg) in result.outbox {
                self.pending.push((id.clone(), to, msg));
            }
        }
        applied
    }

    /// Delivers every queued message whose endpoints are both un-paused and
    /// not currently partitioned from one another, returning newly applied
    /// entries. Messages crossing a partition, or addressed to/from a paused
    /// node, are dropped — the transport may lose messages and the protocol
    /// tolerates it.
    pub fn deliver_pending(&mut self) -> Vec<Entry> {
        let batch = std::mem::take(&mut self.pending);
        let mut applied = Vec::new();
        for (from, to, msg) in batch {
            if self.paused.contains(&from) || self.paused.contains(&to) {
                continue;
            }
            if !self.connected(&from, &to) {
                continue;
            }
            let Some(node) = self.nodes.get_mut(&to) else { continue };
            let result = node.handle_message(from, msg);
            applied.extend(result.applied);
            for (next_to, next_msg) in result.outbox {
                self.pending.push((to.clone(), next_to, next_msg));
            }
        }
        applied
    }

    /// Runs `tick_all`/`deliver_pending` alternately until `rounds` ticks
    /// have elapsed, draining all resulting messages each round so a
    /// multi-hop exchange (vote -> become candidate -> append -> ack) settles
    /// within a single call.
    pub fn run(&mut self, rounds: usize) -> Vec<Entry> {
        let mut applied = Vec::new();
        for _ in 0..rounds {
            applied.extend(self.tick_all());
            for _ in 0..8 {
                if self.pending.is_empty() {
                    break;
                }
                applied.extend(self.deliver_pending());
            }
        }
        applied
    }

    /// Drives ticks until some node becomes leader or `max_rounds` elapses.
    pub fn run_until_leader(&mut self, max_rounds: usize) -> Option<NodeId> {
        for _ in 0..max_rounds {
            self.run(1);
            if let Some(l) = self.leader() {
                return Some(l);
            }
        }
        None
    }

    /// Proposes on the given (assumed leader) node and drains the cluster
    /// until the entry is either committed everywhere reachable or the round
    /// budget is exhausted.
    pub fn propose_and_settle(
        &mut self,
        leader: &str,
        kind: EntryKind,
        payload: Vec<u8>,
        max_rounds: usize,
    ) -> Result<LogIndex, replicated_consensus_core::ConsensusError> {
        let (index, step) = self.node_mut(leader).propose(kind, payload)?;
        for (to, msg) in step.outbox {
            self.pending.push((leader.into(), to, msg));
        }
        self.run(max_rounds);
        Ok(index)
    }

    pub fn commit_index(&self, id: &str) -> LogIndex {
        self.node(id).commit_index()
    }
}
