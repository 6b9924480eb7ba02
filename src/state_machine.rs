//! The external application state machine. The embedded key-value engine
//! and the user-visible application state it holds are out of scope here —
//! only the trait the core drives is specified.

use crate::error::ConsensusError;
use crate::types::Entry;

pub trait StateMachine: Send {
    /// Deterministically applies a committed entry. Called in index order,
    /// once per entry, never out of order and never twice for the same
    /// index on a given node.
    fn apply(&mut self, entry: &Entry) -> Result<Vec<u8>, ConsensusError>;

    /// Serializes the current state for a snapshot transfer.
    fn snapshot(&self) -> Vec<u8>;

    /// Replaces the current state with the given snapshot bytes.
    fn restore(&mut self, bytes: &[u8]) -> Result<(), ConsensusError>;
}
