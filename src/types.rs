//! Core data types shared across the consensus core.

use serde::{Deserialize, Serialize};

/// Identifies a node in the cluster. Opaque to the core beyond equality
/// and ordering for majority arithmetic.
pub type NodeId = String;

/// Monotonic logical epoch. Never decreases once advanced.
pub type Term = u64;

/// 1-based, dense log position. Index 0 means "no entry".
pub type LogIndex = u64;

/// What kind of change a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Ordinary application payload.
    Normal,
    /// Cluster membership mutation. At most one may be uncommitted at a time.
    ConfigChange,
    /// Leader-acquisition marker used to make prior-term entries committable.
    NoOp,
}

/// A single log entry. Immutable once appended: entries are only ever
/// truncated wholesale, never edited in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl Entry {
    pub fn normal(index: LogIndex, term: Term, payload: Vec<u8>) -> Self {
        Self { index, term, kind: EntryKind::Normal, payload }
    }

    pub fn no_op(index: LogIndex, term: Term) -> Self {
        Self { index, term, kind: EntryKind::NoOp, payload: Vec::new() }
    }

    pub fn config_change(index: LogIndex, term: Term, payload: Vec<u8>) -> Self {
        Self { index, term, kind: EntryKind::ConfigChange, payload }
    }
}

/// The role a node currently occupies. Exactly one at a time.
///
/// Candidate-shaped roles carry their own vote tally and the leader role
/// carries its peer arena — a tagged variant rather than subclassing, with
/// no cross-linking back into the core from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleTag {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
}

impl std::fmt::Display for RoleTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoleTag::Follower => "follower",
            RoleTag::PreCandidate => "pre-candidate",
            RoleTag::Candidate => "candidate",
            RoleTag::Leader => "leader",
        };
        write!(f, "{}", s)
    }
}

/// `(lastIncludedIndex, lastIncludedTerm)` — the log's compacted prefix
/// pointer. A membership blob is not carried here; this crate's
/// `StateMachine::snapshot`/`restore` carries configuration state today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPointer {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
}
