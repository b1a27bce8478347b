//! # jotdb Core
//!
//! Collection and store facade for jotdb.
//!
//! [`Store`] binds collection names to storage backend instances chosen
//! by [`Config`]; [`Collection`] exposes the uniform CRUD + index +
//! maintenance contract and turns use-before-init into an immediate
//! [`StoreError::NotInitialized`] failure. The thin [`Document`] layer
//! adds typed access with schema defaults and lifecycle hooks.
//!
//! ## Example
//!
//! ```rust,ignore
//! use jotdb_core::{Backend, Config, Store};
//! use serde_json::{json, Map};
//!
//! let store = Store::open(Config::new(Backend::Memory))?;
//! let users = store.open_collection("users")?;
//!
//! let mut data = Map::new();
//! data.insert("name".into(), json!("alice"));
//! let record = users.insert(data)?;
//!
//! let mut filter = Map::new();
//! filter.insert("name".into(), json!("alice"));
//! assert_eq!(users.find(&filter)?.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod config;
mod error;
mod model;
mod store;

pub use collection::Collection;
pub use config::{Backend, Config};
pub use error::{StoreError, StoreResult};
pub use model::{Document, TypedCollection};
pub use store::Store;

// The record and query types are part of this crate's public surface.
pub use jotdb_record::{Query, QueryError, Record, RecordState};
