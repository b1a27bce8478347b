//! Write-ahead log for the file-backed engine.
//!
//! The WAL is a newline-delimited sequence of JSON objects, one per
//! mutating operation, written **before** that operation is reflected in
//! the snapshot. Replaying all entries in file order against the
//! last-saved snapshot reconstructs the exact pre-crash state; the WAL
//! is truncated only after a full, successful snapshot save.
//!
//! ## Recovery Policy
//!
//! Replay distinguishes **tolerated** from **fatal** conditions:
//!
//! - An unparsable or unterminated **final** line is a torn write from a
//!   crash mid-append. The entry was never acknowledged, so it is
//!   discarded with a warning and replay succeeds.
//! - An unparsable line **before** the end is corruption. Replay fails
//!   and the engine must not reach `Ready` - silently skipping entries
//!   would mask data loss.

use crate::error::{EngineError, EngineResult};
use jotdb_record::Record;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One journaled mutation.
///
/// Insert and update entries carry the full post-image record, so replay
/// is a plain upsert and naturally idempotent; delete entries carry the
/// id and the deletion timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WalEntry {
    /// A record was inserted.
    Insert(Record),
    /// A record was replaced by an update.
    Update(Record),
    /// A record was soft-deleted.
    Delete {
        /// Id of the deleted record.
        id: String,
        /// Deletion timestamp.
        at: String,
    },
}

/// Append-only operation journal backed by one file.
#[derive(Debug)]
pub struct WalFile {
    path: PathBuf,
    file: File,
    sync_on_write: bool,
}

impl WalFile {
    /// Opens or creates the WAL at the given path.
    pub fn open(path: &Path, sync_on_write: bool) -> EngineResult<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            sync_on_write,
        })
    }

    /// Returns the WAL file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry as a JSON line and flushes it.
    ///
    /// With `sync_on_write` the line is fsynced before returning, so the
    /// entry is durable before the caller materializes the mutation.
    pub fn append(&mut self, entry: &WalEntry) -> EngineResult<()> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| EngineError::corrupted(format!("WAL encode failed: {e}")))?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        if self.sync_on_write {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Returns the number of pending entries without applying them.
    pub fn pending(&self) -> EngineResult<usize> {
        let mut count = 0;
        self.replay_inner(|_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Returns true when the WAL holds no bytes.
    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.file.metadata()?.len() == 0)
    }

    /// Replays every pending entry in file order through the callback.
    ///
    /// Returns the number of entries applied.
    ///
    /// # Errors
    ///
    /// Fails on mid-log corruption or when the callback fails; a torn
    /// final line is discarded with a warning instead.
    pub fn replay<F>(&self, apply: F) -> EngineResult<usize>
    where
        F: FnMut(WalEntry) -> EngineResult<()>,
    {
        self.replay_inner(apply)
    }

    fn replay_inner<F>(&self, mut apply: F) -> EngineResult<usize>
    where
        F: FnMut(WalEntry) -> EngineResult<()>,
    {
        let contents = std::fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = contents.lines().collect();
        let unterminated = !contents.is_empty() && !contents.ends_with('\n');

        let mut applied = 0;
        for (i, line) in lines.iter().enumerate() {
            let is_last = i + 1 == lines.len();
            match serde_json::from_str::<WalEntry>(line) {
                Ok(entry) => {
                    if is_last && unterminated {
                        // A parseable but unterminated tail still never
                        // got its newline - the append did not complete.
                        warn!(wal = %self.path.display(), "discarding torn WAL tail");
                        break;
                    }
                    apply(entry)?;
                    applied += 1;
                }
                Err(e) if is_last => {
                    warn!(
                        wal = %self.path.display(),
                        error = %e,
                        "discarding torn WAL tail"
                    );
                    break;
                }
                Err(e) => {
                    return Err(EngineError::corrupted(format!(
                        "WAL entry {} failed to parse: {e}",
                        i + 1
                    )));
                }
            }
        }
        Ok(applied)
    }

    /// Discards all entries.
    ///
    /// Called only after the snapshot covering them was saved.
    pub fn truncate(&mut self) -> EngineResult<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }
}
