//! Replicated consensus core.
//!
//! A Raft-style single-writer state machine for a replicated log: leader
//! election with mandatory pre-vote, batched log replication with
//! conflict-hint backoff, a median-based commitment rule, and chunked
//! snapshot transfer. The transport between peers, the durable key-value
//! engine applying committed entries, and any client-facing RPC surface
//! are all outside this crate — see [`transport::Transport`] and
//! [`state_machine::StateMachine`] for the seams a caller fills in.

pub mod config;
pub mod consensus;
pub mod error;
pub mod log_store;
pub mod message;
pub mod meta_store;
pub mod peer;
pub mod snapshot;
pub mod state_machine;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::Config;
pub use consensus::{ConsensusCore, Outbox, StepResult};
pub use error::ConsensusError;
pub use log_store::{LogStore, LogStoreStats, MemLogStore};
pub use message::Message;
pub use meta_store::{MemMetaStore, MetaStore, PersistentMeta};
pub use state_machine::StateMachine;
pub use storage::{FileLogStore, StorageConfig};
pub use transport::{RecordingTransport, Transport};
pub use types::{Entry, EntryKind, LogIndex, NodeId, RoleTag, SnapshotPointer, Term};
