//! Error types for storage engine operations.

use std::io;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in storage engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Filter parsing failed.
    #[error("query error: {0}")]
    Query(#[from] jotdb_record::QueryError),

    /// Underlying SQLite error (relational engine).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No live record with the given id exists.
    #[error("record not found: {id}")]
    NotFound {
        /// The id that was looked up.
        id: String,
    },

    /// A live record with the given id already exists.
    #[error("record already exists: {id}")]
    AlreadyExists {
        /// The conflicting id.
        id: String,
    },

    /// Another writer holds a live lock on the collection.
    #[error("collection locked since {held_since}")]
    Locked {
        /// Timestamp found in the lock file.
        held_since: String,
    },

    /// Persisted state (snapshot or WAL) failed to parse.
    #[error("persisted state corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// The relational backend's connection could not be opened.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the failure.
        message: String,
    },

    /// The engine was used before `init()` completed.
    #[error("engine not initialized")]
    NotInitialized,

    /// A previous initialization attempt failed; the engine is unusable.
    #[error("engine initialization failed: {message}")]
    Failed {
        /// The error that moved the engine to the failed state.
        message: String,
    },
}

impl EngineError {
    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates an already-exists error.
    pub fn already_exists(id: impl Into<String>) -> Self {
        Self::AlreadyExists { id: id.into() }
    }

    /// Creates a corrupted-state error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a backend-unavailable error.
    pub fn backend_unavailable(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }
}
