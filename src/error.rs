//! Error taxonomy for the consensus core.
//!
//! These are kinds, not exceptions: most are handled internally and never
//! surface to a caller. Only [`ConsensusError::NotLeader`] and
//! [`ConsensusError::ConfigConflict`] are meant to be returned to clients;
//! everything else is logged and absorbed by the protocol itself.

use crate::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    /// Term or index below current; dropped after an optional informative reply.
    #[error("stale message (term or index below current)")]
    Stale,

    /// Follower is missing the entries needed to splice in a new one.
    #[error("log gap: requested index is not contiguous with the log")]
    LogGap,

    /// Follower's entry at an index disagrees in term with the leader's.
    #[error("log mismatch at the requested index")]
    LogMismatch,

    /// A proposal was addressed to a non-leader.
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// Durable write failed. Fatal: the node must stop participating and be
    /// restarted externally. Never answer as though the write succeeded.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Transport send failed; ignored, retried on the next heartbeat cycle.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// A second config change was proposed while one is still uncommitted.
    #[error("a configuration change is already in flight")]
    ConfigConflict,

    /// Requested a log index that does not exist in this store.
    #[error("index {0} is out of range")]
    OutOfRange(u64),
}

impl ConsensusError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::StorageFailure(_))
    }
}
