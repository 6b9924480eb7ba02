//! Durable on-disk backing for [`LogStore`] and [`MetaStore`], fused into
//! one WAL: a plain line-delimited JSON log, snapshot pointer written via
//! temp-then-rename, with an `fsync_on_write` toggle.
//!
//! Query logic (get/range/term_at/...) is delegated to [`MemLogStore`]
//! rather than duplicated — this module is purely the durability wrapper
//! around it, writing to the WAL before mutating memory so a crash never
//! loses an acknowledged write.
//!
//! Compaction re-writes the WAL rather than just renaming it away and
//! starting an empty one: `FileLogStore::rewrite_wal` re-serializes every
//! surviving entry into the new file before the old one is removed, so
//! nothing appended after the snapshot point but before compaction is lost.

use crate::error::ConsensusError;
use crate::log_store::{LogStore, LogStoreStats, MemLogStore};
use crate::meta_store::{MetaStore, PersistentMeta};
use crate::types::{Entry, LogIndex, SnapshotPointer, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding `wal.log` and `snapshot.json`.
    pub dir: PathBuf,
    /// Flush (and fsync, via `File::sync_data`) after every WAL write.
    pub fsync_on_write: bool,
    /// WAL size, in bytes, past which compaction is worth triggering.
    pub max_wal_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("./consensus-data"), fsync_on_write: true, max_wal_bytes: 10 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WalEntry {
    #[serde(rename = "META")]
    Meta(PersistentMeta),
    #[serde(rename = "LOG")]
    Log(Entry),
    #[serde(rename = "COMMIT")]
    Commit { commit_index: LogIndex, applied_index: LogIndex },
}

fn io_err(context: &str, e: impl std::fmt::Display) -> ConsensusError {
    ConsensusError::StorageFailure(format!("{context}: {e}"))
}

/// WAL-backed implementation of both stores. Single-writer: every mutating
/// call here is synchronous and returns only once the write has hit disk
/// (and been fsynced, if configured) — durability before reply, always.
pub struct FileLogStore {
    config: StorageConfig,
    mem: MemLogStore,
    meta: PersistentMeta,
    wal: BufWriter<File>,
    wal_bytes: u64,
}

impl FileLogStore {
    /// Opens (creating if absent) the storage directory, replays the WAL
    /// and snapshot pointer to rebuild in-memory state, and leaves the WAL
    /// open for appending.
    pub fn open(config: StorageConfig) -> Result<Self, ConsensusError> {
        fs::create_dir_all(&config.dir).map_err(|e| io_err("creating storage dir", e))?;

        let snapshot = Self::load_snapshot_pointer(&config)?;
        let mut mem = MemLogStore::new();
        if snapshot.last_included_index > 0 {
            mem.reset_to_snapshot(snapshot.last_included_index, snapshot.last_included_term)
                .map_err(|e| io_err("seeding snapshot pointer", e))?;
        }
        let mut meta = PersistentMeta::default();

        let wal_path = config.dir.join("wal.log");
        if wal_path.exists() {
            let file = File::open(&wal_path).map_err(|e| io_err("opening wal for replay", e))?;
            let reader = BufReader::new(file);
            let mut replayed = 0usize;
            for (line_no, line) in reader.lines().enumerate() {
                let line = match line {
                    Ok(l) => l,
                    Err(e) => {
                        warn!(line = line_no, error = %e, "wal read error, stopping replay");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalEntry>(&line) {
                    Ok(WalEntry::Meta(m)) => meta = m,
                    Ok(WalEntry::Log(entry)) => {
                        if entry.index == mem.last_index() + 1 {
                            let _ = mem.append(entry);
                        }
                        // entries at/below last_index() are replays of
                        // something a later truncate_suffix already
                        // dropped from memory; the WAL line is stale.
                    }
                    Ok(WalEntry::Commit { commit_index, applied_index }) => {
                        let _ = mem.persist_commit_meta(commit_index, applied_index);
                    }
                    Err(e) => {
                        warn!(line = line_no, error = %e, "wal parse error, skipping entry");
                    }
                }
                replayed += 1;
            }
            info!(entries = replayed, "replayed wal");
        }

        let file = OpenOptions::new().create(true).append(true).open(&wal_path).map_err(|e| io_err("opening wal", e))?;
        let wal_bytes = file.metadata().map_err(|e| io_err("stat wal", e))?.len();

        Ok(Self { config, mem, meta, wal: BufWriter::new(file), wal_bytes })
    }

    fn load_snapshot_pointer(config: &StorageConfig) -> Result<SnapshotPointer, ConsensusError> {
        let path = config.dir.join("snapshot.json");
        if !path.exists() {
            return Ok(SnapshotPointer::default());
        }
        let data = fs::read_to_string(&path).map_err(|e| io_err("reading snapshot pointer", e))?;
        serde_json::from_str(&data).map_err(|e| io_err("parsing snapshot pointer", e))
    }

    fn save_snapshot_pointer(&self, pointer: SnapshotPointer) -> Result<(), ConsensusError> {
        let path = self.config.dir.join("snapshot.json");
        let temp = self.config.dir.join("snapshot.json.tmp");
        let data = serde_json::to_string(&pointer).map_err(|e| io_err("serializing snapshot pointer", e))?;
        fs::write(&temp, &data).map_err(|e| io_err("writing snapshot pointer", e))?;
        fs::rename(&temp, &path).map_err(|e| io_err("renaming snapshot pointer", e))?;
        Ok(())
    }

    fn write_wal(&mut self, entry: &WalEntry) -> Result<(), ConsensusError> {
        let data = serde_json::to_string(entry).map_err(|e| io_err("serializing wal entry", e))?;
        writeln!(self.wal, "{data}").map_err(|e| io_err("writing wal entry", e))?;
        self.wal.flush().map_err(|e| io_err("flushing wal", e))?;
        if self.config.fsync_on_write {
            self.wal.get_ref().sync_data().map_err(|e| io_err("fsyncing wal", e))?;
        }
        self.wal_bytes += data.len() as u64 + 1;
        Ok(())
    }

    pub fn should_compact_wal(&self) -> bool {
        self.wal_bytes >= self.config.max_wal_bytes
    }

    /// Rewrites the WAL from scratch: current meta, current commit/applied
    /// indices, then every entry still in memory. Called after any prefix
    /// truncation or suffix truncation so a stale WAL tail never outlives
    /// what a fresh recovery actually needs.
    fn rewrite_wal(&mut self) -> Result<(), ConsensusError> {
        let wal_path = self.config.dir.join("wal.log");
        let temp_path = self.config.dir.join("wal.log.tmp");

        {
            let file = File::create(&temp_path).map_err(|e| io_err("creating compacted wal", e))?;
            let mut writer = BufWriter::new(file);
            let write_line = |w: &mut BufWriter<File>, entry: &WalEntry| -> io::Result<()> {
                let data = serde_json::to_string(entry)?;
                writeln!(w, "{data}")
            };
            write_line(&mut writer, &WalEntry::Meta(self.meta.clone())).map_err(|e| io_err("writing compacted meta", e))?;
            let (commit_index, applied_index) = self.mem.commit_meta();
            write_line(&mut writer, &WalEntry::Commit { commit_index, applied_index })
                .map_err(|e| io_err("writing compacted commit meta", e))?;
            if self.mem.last_index() >= self.mem.first_index() {
                for entry in self.mem.range(self.mem.first_index(), self.mem.last_index()).unwrap_or_default() {
                    write_line(&mut writer, &WalEntry::Log(entry)).map_err(|e| io_err("writing compacted entry", e))?;
                }
            }
            writer.flush().map_err(|e| io_err("flushing compacted wal", e))?;
            writer.get_ref().sync_data().map_err(|e| io_err("fsyncing compacted wal", e))?;
        }

        fs::rename(&temp_path, &wal_path).map_err(|e| io_err("renaming compacted wal", e))?;
        let file = OpenOptions::new().append(true).open(&wal_path).map_err(|e| io_err("reopening wal", e))?;
        self.wal_bytes = file.metadata().map_err(|e| io_err("stat compacted wal", e))?.len();
        self.wal = BufWriter::new(file);
        debug!("wal compacted");
        Ok(())
    }
}

impl LogStore for FileLogStore {
    fn append(&mut self, entry: Entry) -> Result<(), ConsensusError> {
        if entry.index != self.mem.last_index() + 1 {
            return Err(ConsensusError::LogGap);
        }
        self.write_wal(&WalEntry::Log(entry.clone()))?;
        self.mem.append(entry)
    }

    fn get(&self, index: LogIndex) -> Result<Entry, ConsensusError> {
        self.mem.get(index)
    }

    fn range(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<Entry>, ConsensusError> {
        self.mem.range(lo, hi)
    }

    fn first_index(&self) -> LogIndex {
        self.mem.first_index()
    }

    fn last_index(&self) -> LogIndex {
        self.mem.last_index()
    }

    fn term_at(&self, index: LogIndex) -> Result<Term, ConsensusError> {
        self.mem.term_at(index)
    }

    fn truncate_prefix(&mut self, upto: LogIndex) -> Result<(), ConsensusError> {
        if upto <= self.first_index().saturating_sub(1) {
            return Ok(());
        }
        let term = self.mem.term_at(upto)?;
        self.mem.truncate_prefix(upto)?;
        self.save_snapshot_pointer(SnapshotPointer { last_included_index: upto, last_included_term: term })?;
        self.rewrite_wal()?;
        info!(upto, "compacted log prefix");
        Ok(())
    }

    fn truncate_suffix(&mut self, from: LogIndex, commit_index: LogIndex) -> Result<(), ConsensusError> {
        self.mem.truncate_suffix(from, commit_index)?;
        self.rewrite_wal()
    }

    fn persist_commit_meta(&mut self, commit_index: LogIndex, applied_index: LogIndex) -> Result<(), ConsensusError> {
        self.write_wal(&WalEntry::Commit { commit_index, applied_index })?;
        self.mem.persist_commit_meta(commit_index, applied_index)
    }

    fn commit_meta(&self) -> (LogIndex, LogIndex) {
        self.mem.commit_meta()
    }

    fn reset_to_snapshot(&mut self, last_included_index: LogIndex, last_included_term: Term) -> Result<(), ConsensusError> {
        self.mem.reset_to_snapshot(last_included_index, last_included_term)?;
        self.save_snapshot_pointer(SnapshotPointer { last_included_index, last_included_term })?;
        self.rewrite_wal()?;
        info!(last_included_index, "installed snapshot, log reset");
        Ok(())
    }

    fn stats(&self) -> LogStoreStats {
        self.mem.stats()
    }
}

impl MetaStore for FileLogStore {
    fn load(&self) -> PersistentMeta {
        self.meta.clone()
    }

    fn persist(&mut self, meta: PersistentMeta) -> Result<(), ConsensusError> {
        self.write_wal(&WalEntry::Meta(meta.clone()))?;
        self.meta = meta;
        Ok(())
    }
}
