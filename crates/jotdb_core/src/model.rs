//! Typed document layer.
//!
//! A thin, optional layer over [`Collection`]: a [`Document`] type names
//! its collection, contributes schema defaults for absent fields, and
//! may hook into the insert/load lifecycle. Everything else - queries,
//! indexes, maintenance - stays on the untyped collection, reachable
//! via [`TypedCollection::collection`].

use crate::collection::Collection;
use crate::error::{StoreError, StoreResult};
use crate::store::Store;
use jotdb_record::Record;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::marker::PhantomData;
use std::sync::Arc;

/// A document type bound to a named collection.
///
/// Documents serialize to JSON objects; the store's framework fields
/// (`id`, `_created`, `_updated`) are layered on top of the serialized
/// shape, so a document type does not need to declare them (but may -
/// an `id: Option<String>` field round-trips naturally).
pub trait Document: Serialize + DeserializeOwned {
    /// Name of the collection this type is stored in.
    const COLLECTION: &'static str;

    /// Default field values applied to fields the serialized document
    /// leaves absent.
    #[must_use]
    fn defaults() -> Map<String, Value> {
        Map::new()
    }

    /// Hook invoked on the field map just before insertion.
    fn before_insert(_fields: &mut Map<String, Value>) {}

    /// Hook invoked on the record after it is loaded, before
    /// deserialization.
    fn after_load(_record: &mut Record) {}
}

/// Typed access to one collection.
pub struct TypedCollection<T: Document> {
    inner: Arc<Collection>,
    _marker: PhantomData<T>,
}

impl Store {
    /// Returns an initialized typed collection for the document type.
    pub fn typed<T: Document>(&self) -> StoreResult<TypedCollection<T>> {
        let inner = self.open_collection(T::COLLECTION)?;
        Ok(TypedCollection {
            inner,
            _marker: PhantomData,
        })
    }
}

impl<T: Document> TypedCollection<T> {
    /// Returns the underlying untyped collection.
    #[must_use]
    pub fn collection(&self) -> &Arc<Collection> {
        &self.inner
    }

    /// Inserts a document, applying defaults and the insert hook.
    /// Returns the stored record (with id and timestamps).
    pub fn insert(&self, document: &T) -> StoreResult<Record> {
        let mut fields = to_fields(document)?;
        for (field, value) in T::defaults() {
            fields.entry(field).or_insert(value);
        }
        T::before_insert(&mut fields);
        self.inner.insert(fields)
    }

    /// Returns the document with the given id, or `None`.
    pub fn get(&self, id: &str) -> StoreResult<Option<T>> {
        match self.inner.get(id)? {
            Some(mut record) => {
                T::after_load(&mut record);
                Ok(Some(from_record(record)?))
            }
            None => Ok(None),
        }
    }

    /// Returns all documents matching the filter.
    pub fn find(&self, filter: &Map<String, Value>) -> StoreResult<Vec<T>> {
        let mut documents = Vec::new();
        for mut record in self.inner.find(filter)? {
            T::after_load(&mut record);
            documents.push(from_record(record)?);
        }
        Ok(documents)
    }

    /// Merges `data` over the document with the given id.
    pub fn update(&self, id: &str, data: Map<String, Value>) -> StoreResult<T> {
        let mut record = self.inner.update(id, data)?;
        T::after_load(&mut record);
        from_record(record)
    }

    /// Soft-deletes the document with the given id.
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        self.inner.delete(id)
    }
}

fn to_fields<T: Serialize>(document: &T) -> StoreResult<Map<String, Value>> {
    match serde_json::to_value(document) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StoreError::invalid_document(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
        Err(e) => Err(StoreError::invalid_document(e.to_string())),
    }
}

fn from_record<T: DeserializeOwned>(record: Record) -> StoreResult<T> {
    serde_json::from_value(Value::Object(record.into_fields()))
        .map_err(|e| StoreError::invalid_document(e.to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
