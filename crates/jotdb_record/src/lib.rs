//! # jotdb Record
//!
//! Record model and query filter evaluator for jotdb.
//!
//! This crate is the leaf of the jotdb workspace. It defines:
//!
//! - [`Record`] - a JSON document plus the framework-managed fields
//!   (`id`, `_created`, `_updated`, and the tombstone pair)
//! - [`RecordState`] - the explicit `Live`/`Tombstoned` state of a record
//! - [`Query`] - a parsed, validated filter that evaluates records
//!   without side effects
//!
//! Storage engines and the collection facade live in the higher crates;
//! nothing here touches the file system.
//!
//! ## Example
//!
//! ```rust
//! use jotdb_record::{Query, Record};
//! use serde_json::{json, Map};
//!
//! let mut fields = Map::new();
//! fields.insert("age".into(), json!(30));
//! let record = Record::new_insert(fields);
//!
//! let mut filter = Map::new();
//! filter.insert("age".into(), json!({"$gte": 18}));
//! let query = Query::parse(&filter).unwrap();
//! assert!(query.matches(&record));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod query;
mod record;

pub use error::{QueryError, QueryResult};
pub use query::{Predicate, Query};
pub use record::{
    generate_id, now, Record, RecordState, FIELD_CREATED, FIELD_DELETED, FIELD_DELETED_AT,
    FIELD_ID, FIELD_UPDATED, INTERNAL_PREFIX,
};
