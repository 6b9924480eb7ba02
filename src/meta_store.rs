//! Durable `(currentTerm, votedFor)`. Must reach stable storage before any
//! message carrying those values is sent, or any vote is granted.

use crate::error::ConsensusError;
use crate::types::{NodeId, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentMeta {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

pub trait MetaStore: Send {
    fn load(&self) -> PersistentMeta;
    fn persist(&mut self, meta: PersistentMeta) -> Result<(), ConsensusError>;
}

/// In-memory reference implementation, used by tests and as a model of the
/// contract; `storage::FileLogStore` fuses the durable equivalent into the
/// same file as the log.
#[derive(Debug, Default)]
pub struct MemMetaStore {
    meta: PersistentMeta,
}

impl MetaStore for MemMetaStore {
    fn load(&self) -> PersistentMeta {
        self.meta.clone()
    }

    fn persist(&mut self, meta: PersistentMeta) -> Result<(), ConsensusError> {
        self.meta = meta;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_and_reloads() {
        let mut store = MemMetaStore::default();
        store.persist(PersistentMeta { current_term: 4, voted_for: Some("n2".into()) }).unwrap();
        assert_eq!(store.load().current_term, 4);
    }
}
