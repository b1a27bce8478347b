//! Error types for the store facade.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store and collection operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Storage engine error.
    #[error("engine error: {0}")]
    Engine(#[from] jotdb_engine::EngineError),

    /// Filter parsing error.
    #[error("query error: {0}")]
    Query(#[from] jotdb_record::QueryError),

    /// A collection was used before `init()` completed.
    #[error("collection not initialized: {collection}")]
    NotInitialized {
        /// Name of the collection.
        collection: String,
    },

    /// A collection name is not usable as a file stem.
    #[error("invalid collection name: {name:?}")]
    InvalidCollectionName {
        /// The rejected name.
        name: String,
    },

    /// The data directory does not exist and `create_if_missing` is off.
    #[error("data directory does not exist: {path}")]
    MissingDirectory {
        /// The missing directory.
        path: PathBuf,
    },

    /// A typed document did not serialize to a JSON object.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Description of the problem.
        message: String,
    },
}

impl StoreError {
    /// Creates a not-initialized error.
    pub fn not_initialized(collection: impl Into<String>) -> Self {
        Self::NotInitialized {
            collection: collection.into(),
        }
    }

    /// Creates an invalid document error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }
}
