//! Leader-only per-peer replication state.
//!
//! Held in an arena keyed by node id, owned by the `Leader` role variant.
//! Peers never point back into the core — back-references are modeled by
//! the core looking them up by id, not by cross-links.

use crate::types::LogIndex;

#[derive(Debug, Clone)]
pub struct Peer {
    /// Next log index the leader will try to send this follower.
    pub next_index: LogIndex,
    /// Highest index known to be replicated on this follower.
    pub match_index: LogIndex,
    /// At most one outstanding `AppendEntries` per peer.
    pub inflight: bool,
    /// Byte offset of an in-progress snapshot transfer, if any.
    pub snapshot_offset: Option<u64>,
    /// Set once the chunk carrying `done=true` has been sent to this peer;
    /// cleared once the follower acknowledges and normal replication resumes.
    pub snapshot_done_sent: bool,
}

impl Peer {
    pub fn new(next_index: LogIndex) -> Self {
        Self { next_index, match_index: 0, inflight: false, snapshot_offset: None, snapshot_done_sent: false }
    }
}
