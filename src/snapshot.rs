//! Chunked install-snapshot transfer.
//!
//! No concrete KV engine backs this: chunks are staged to a `Vec<u8>` and
//! handed to [`crate::state_machine::StateMachine::restore`] on completion.
//! Leader-side chunking and follower-side staging are both plain,
//! synchronous helpers — the transfer has no timers of its own, it rides
//! the normal heartbeat/retry cadence.

use crate::error::ConsensusError;

/// Bytes per `InstallSnapshot` chunk.
pub const SNAPSHOT_CHUNK_SIZE: usize = 4096;

/// Leader-side: the next chunk to send for a transfer currently at `offset`
/// bytes into `data`. Returns `(chunk, done)`.
pub fn next_chunk(data: &[u8], offset: u64) -> (Vec<u8>, bool) {
    let start = (offset as usize).min(data.len());
    let end = (start + SNAPSHOT_CHUNK_SIZE).min(data.len());
    let chunk = data[start..end].to_vec();
    let done = end >= data.len();
    (chunk, done)
}

/// Follower-side staging area for an in-progress transfer.
#[derive(Debug, Default)]
pub struct SnapshotStaging {
    buf: Vec<u8>,
}

impl SnapshotStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Appends a chunk if it lands exactly at the end of what's staged so
    /// far; out-of-order or duplicate chunks are rejected rather than
    /// silently accepted, since the transfer has no sequence number beyond
    /// the byte offset itself.
    pub fn accept(&mut self, offset: u64, data: &[u8]) -> Result<(), ConsensusError> {
        if offset != self.len() {
            return Err(ConsensusError::Stale);
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_full_payload() {
        let data = vec![7u8; SNAPSHOT_CHUNK_SIZE * 2 + 10];
        let mut offset = 0u64;
        let mut collected = Vec::new();
        loop {
            let (chunk, done) = next_chunk(&data, offset);
            offset += chunk.len() as u64;
            collected.extend_from_slice(&chunk);
            if done {
                break;
            }
        }
        assert_eq!(collected, data);
    }

    #[test]
    fn staging_rejects_out_of_order_chunk() {
        let mut staging = SnapshotStaging::new();
        staging.accept(0, &[1, 2, 3]).unwrap();
        assert!(staging.accept(10, &[4, 5]).is_err());
        staging.accept(3, &[4, 5]).unwrap();
        assert_eq!(staging.take(), vec![1, 2, 3, 4, 5]);
    }
}
