//! # jotdb Engine
//!
//! Storage engine contract and backend implementations for jotdb.
//!
//! This crate defines the [`StorageEngine`] capability trait - the
//! uniform CRUD + index + maintenance contract every backend satisfies -
//! and the three implementations:
//!
//! - [`FileEngine`] - one JSON snapshot per collection, write-ahead log
//!   for crash recovery, lock file for cross-process writer exclusion
//! - [`MemoryEngine`] - same contract, no persistence, for ephemeral and
//!   development workloads
//! - [`SqliteEngine`] - same contract over a generic key/JSON-blob table
//!   with a side index table, queries compiled to SQL predicates
//!
//! Each engine owns its own [`IndexManager`] and [`LruCache`]; nothing is
//! shared across engine instances or collections.
//!
//! ## Design Principles
//!
//! - Backends are independent variants behind one capability trait,
//!   selected by configuration, not inheritance
//! - Indexes are caches: always rebuildable from the live record set
//! - The WAL entry is durable before the mutation is materialized;
//!   the WAL is truncated only after a successful snapshot save
//! - Malformed persisted state fails initialization instead of silently
//!   degrading to an empty collection

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod engine;
mod error;
mod file;
mod index;
mod lock;
mod memory;
mod sqlite;
mod wal;

pub use cache::{LruCache, DEFAULT_CACHE_CAPACITY};
pub use engine::{EngineOptions, EngineState, StorageEngine};
pub use error::{EngineError, EngineResult};
pub use file::FileEngine;
pub use index::{derive_key, derive_key_from_values, IndexManager, KEY_SEPARATOR};
pub use lock::{LockFile, DEFAULT_LOCK_STALE_AFTER};
pub use memory::MemoryEngine;
pub use sqlite::SqliteEngine;
pub use wal::{WalEntry, WalFile};
