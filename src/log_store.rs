//! The durable, ordered log contract and an in-memory reference
//! implementation used by tests and as a model of the contract.
//!
//! Entries live in a flat `Vec` rather than keeping a dummy index-0
//! sentinel; an explicit [`SnapshotPointer`] prefix carries the compacted
//! range instead, so snapshotted indexes are always handled via the pointer,
//! never via `get`. This is the single-log contract only — no dual-log
//! write-amplification variant.

use crate::error::ConsensusError;
use crate::types::{Entry, LogIndex, SnapshotPointer, Term};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStoreStats {
    pub first_index: LogIndex,
    pub last_index: LogIndex,
    pub entry_count: usize,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
}

pub trait LogStore: Send {
    /// Appends at `entry.index == last_index() + 1`. Must be durable before
    /// returning `Ok`.
    fn append(&mut self, entry: Entry) -> Result<(), ConsensusError>;

    /// Fetches the entry at `index`. Errors on an index at or below the
    /// snapshot prefix, or above `last_index()`.
    fn get(&self, index: LogIndex) -> Result<Entry, ConsensusError>;

    /// Contiguous slice `[lo, hi]`, `hi` clamped to `last_index()`.
    fn range(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, ConsensusError>;

    fn first_index(&self) -> LogIndex;

    fn last_index(&self) -> LogIndex;

    /// Term of the entry at `index`, or the snapshot's term if `index`
    /// equals the snapshot prefix exactly, or `0` for the virtual index 0.
    fn term_at(&self, index: LogIndex) -> Result<Term, ConsensusError>;

    /// Drops entries with index <= `upto` (snapshot compaction). Idempotent.
    fn truncate_prefix(&mut self, upto: LogIndex) -> Result<(), ConsensusError>;

    /// Drops entries with index >= `from`. Forbidden when `from <=
    /// commit_index` — the caller guarantees this; the store asserts it.
    fn truncate_suffix(&mut self, from: LogIndex, commit_index: LogIndex) -> Result<(), ConsensusError>;

    fn persist_commit_meta(&mut self, commit_index: LogIndex, applied_index: LogIndex) -> Result<(), ConsensusError>;

    fn commit_meta(&self) -> (LogIndex, LogIndex);

    /// Wholesale discard: adopt `(last_included_index, last_included_term)`
    /// as the new, empty, snapshot prefix. Used when a follower's existing
    /// entry at that index doesn't match what's in the snapshot.
    fn reset_to_snapshot(&mut self, last_included_index: LogIndex, last_included_term: Term) -> Result<(), ConsensusError>;

    fn stats(&self) -> LogStoreStats {
        let (commit_index, applied_index) = self.commit_meta();
        LogStoreStats {
            first_index: self.first_index(),
            last_index: self.last_index(),
            entry_count: (self.last_index().saturating_sub(self.first_index().saturating_sub(1))) as usize,
            commit_index,
            applied_index,
        }
    }
}

/// `Vec`-backed implementation of [`LogStore`]. `entries[0]` corresponds to
/// log index `first_index()`, the log is always the dense range
/// `[first_index(), last_index()]`.
pub struct MemLogStore {
    entries: Vec<Entry>,
    snapshot: SnapshotPointer,
    commit_index: LogIndex,
    applied_index: LogIndex,
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLogStore {
    pub fn new() -> Self {
        Self { entries: Vec::new(), snapshot: SnapshotPointer::default(), commit_index: 0, applied_index: 0 }
    }

    fn offset_of(&self, index: LogIndex) -> Option<usize> {
        let first = self.first_index();
        if index < first || index > self.last_index() {
            None
        } else {
            Some((index - first) as usize)
        }
    }
}

impl LogStore for MemLogStore {
    fn append(&mut self, entry: Entry) -> Result<(), ConsensusError> {
        if entry.index != self.last_index() + 1 {
            return Err(ConsensusError::LogGap);
        }
        self.entries.push(entry);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<Entry, ConsensusError> {
        if index <= self.snapshot.last_included_index {
            return Err(ConsensusError::OutOfRange(index));
        }
        match self.offset_of(index) {
            Some(off) => Ok(self.entries[off].clone()),
            None => Err(ConsensusError::OutOfRange(index)),
        }
    }

    fn range(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, ConsensusError> {
        let hi = hi.min(self.last_index());
        if lo > hi {
            return Ok(Vec::new());
        }
        if lo <= self.snapshot.last_included_index {
            return Err(ConsensusError::LogGap);
        }
        let lo_off = self.offset_of(lo).ok_or(ConsensusError::OutOfRange(lo))?;
        let hi_off = self.offset_of(hi).ok_or(ConsensusError::OutOfRange(hi))?;
        Ok(self.entries[lo_off..=hi_off].to_vec())
    }

    fn first_index(&self) -> LogIndex {
        self.snapshot.last_included_index + 1
    }

    fn last_index(&self) -> LogIndex {
        self.snapshot.last_included_index + self.entries.len() as LogIndex
    }

    fn term_at(&self, index: LogIndex) -> Result<Term, ConsensusError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot.last_included_index {
            return Ok(self.snapshot.last_included_term);
        }
        self.get(index).map(|e| e.term)
    }

    fn truncate_prefix(&mut self, upto: LogIndex) -> Result<(), ConsensusError> {
        if upto <= self.snapshot.last_included_index {
            return Ok(());
        }
        let term = self.term_at(upto)?;
        if let Some(off) = self.offset_of(upto) {
            self.entries.drain(0..=off);
        } else {
            self.entries.clear();
        }
        self.snapshot = SnapshotPointer { last_included_index: upto, last_included_term: term };
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex, commit_index: LogIndex) -> Result<(), ConsensusError> {
        debug_assert!(from > commit_index, "truncate_suffix below commit_index violates durability");
        if from <= commit_index {
            return Err(ConsensusError::LogMismatch);
        }
        match self.offset_of(from) {
            Some(off) => self.entries.truncate(off),
            None if from <= self.first_index() => self.entries.clear(),
            None => {}
        }
        Ok(())
    }

    fn persist_commit_meta(&mut self, commit_index: LogIndex, applied_index: LogIndex) -> Result<(), ConsensusError> {
        self.commit_index = commit_index;
        self.applied_index = applied_index;
        Ok(())
    }

    fn commit_meta(&self) -> (LogIndex, LogIndex) {
        (self.commit_index, self.applied_index)
    }

    fn reset_to_snapshot(&mut self, last_included_index: LogIndex, last_included_term: Term) -> Result<(), ConsensusError> {
        self.entries.clear();
        self.snapshot = SnapshotPointer { last_included_index, last_included_term };
        if self.commit_index < last_included_index {
            self.commit_index = last_included_index;
        }
        Ok(())
    }
}
