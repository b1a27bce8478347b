//! Advisory lock file for cross-process writer exclusion.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default age after which a lock is considered abandoned.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(300);

/// A sentinel file serializing writers across process instances.
///
/// The file holds a single timestamp. Acquisition fails with
/// [`EngineError::Locked`] while a younger-than-threshold lock exists;
/// an older lock is considered abandoned and force-cleared with a
/// warning.
///
/// # Limitations
///
/// The staleness window is a liveness heuristic, not a lease protocol: a
/// paused process or a slow disk can race the reclaim. The lock is
/// advisory and acquired around initialization-level operations only;
/// steady-state mutations do not re-acquire it.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Locked`] when a live (non-stale) lock is
    /// held by another writer.
    pub fn acquire(path: &Path, stale_after: Duration) -> EngineResult<Self> {
        if let Ok(contents) = fs::read_to_string(path) {
            let stamp = contents.trim();
            match DateTime::parse_from_rfc3339(stamp) {
                Ok(held_since) => {
                    let age = Utc::now().signed_duration_since(held_since.with_timezone(&Utc));
                    let stale = chrono::Duration::from_std(stale_after)
                        .unwrap_or_else(|_| chrono::Duration::MAX);
                    if age < stale {
                        return Err(EngineError::Locked {
                            held_since: stamp.to_string(),
                        });
                    }
                    warn!(lock = %path.display(), held_since = stamp, "reclaiming stale lock");
                }
                Err(_) => {
                    // An unreadable timestamp cannot be proven live.
                    warn!(lock = %path.display(), "reclaiming unreadable lock");
                }
            }
        }

        fs::write(path, jotdb_record::now())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock by removing the sentinel file.
    pub fn release(self) {
        // Dropping does the removal.
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
