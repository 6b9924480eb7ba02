//! Runtime configuration. Plain struct callers populate however they like —
//! no `clap`, no file format; CLI and process bootstrap are someone else's
//! problem. Defaults match a conventional single-digit-tick election/
//! heartbeat cadence.

use crate::types::NodeId;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Config {
    /// Ticks between leader heartbeats. Must be well below `base_election_timeout`.
    pub heartbeat_interval: u64,
    /// Base of the randomized election timeout range `[E, 2E)`, in ticks.
    pub base_election_timeout: u64,
    /// Wall-clock duration of one tick, for callers driving a real clock.
    pub tick_interval_ms: u64,
    /// Maximum entries batched into a single `AppendEntries`.
    pub max_entries_per_append: usize,
    /// Entries accumulated past `lastIncludedIndex` before auto-snapshot.
    pub snapshot_threshold_entries: u64,
    /// Initial cluster membership, address format left to the transport.
    pub peers: HashMap<NodeId, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: 1,
            base_election_timeout: 5,
            tick_interval_ms: 1000,
            max_entries_per_append: 100,
            snapshot_threshold_entries: 1000,
            peers: HashMap::new(),
        }
    }
}

impl Config {
    /// Node ids of everyone but ourselves, used for majority arithmetic.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.keys().cloned().collect()
    }

    /// `ceil((peer_ids().len() + 1) / 2) + ...` — strict majority of the
    /// whole configured set including self.
    pub fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }
}
