//! Record representation and framework-managed fields.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Field holding the record identifier.
pub const FIELD_ID: &str = "id";

/// Field holding the creation timestamp.
pub const FIELD_CREATED: &str = "_created";

/// Field holding the last-update timestamp.
pub const FIELD_UPDATED: &str = "_updated";

/// Field marking a record as soft-deleted.
pub const FIELD_DELETED: &str = "_deleted";

/// Field holding the soft-delete timestamp.
pub const FIELD_DELETED_AT: &str = "_deleted_at";

/// Prefix marking internal bookkeeping fields.
///
/// Fields starting with this prefix are managed by the store and are not
/// addressable from query filters.
pub const INTERNAL_PREFIX: char = '_';

/// Returns the current UTC time in the store's canonical timestamp format
/// (RFC 3339 with millisecond precision).
#[must_use]
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Generates a fresh record identifier (UUID v4, hyphenated).
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// The lifecycle state of a record.
///
/// A record is `Live` until deleted, `Tombstoned` afterwards. Tombstoned
/// records stay physically present until compaction purges them, so the
/// full state machine is `Live -> Tombstoned -> purged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordState {
    /// The record is visible to `get` and `find`.
    Live,
    /// The record was soft-deleted and awaits compaction.
    Tombstoned {
        /// When the record was deleted.
        at: String,
    },
}

/// A single document in a collection.
///
/// `Record` wraps a JSON object and layers the framework-managed fields
/// on top: `id` (immutable after insert), `_created`/`_updated`
/// timestamps, and the tombstone pair. Serialization is transparent -
/// a record persists as the plain JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Wraps an existing field map without touching any framework fields.
    #[must_use]
    pub fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds a record ready for insertion.
    ///
    /// Assigns an `id` when the data carries none (an explicit id is
    /// honored verbatim) and stamps `_created`/`_updated` with the
    /// current time.
    #[must_use]
    pub fn new_insert(fields: Map<String, Value>) -> Self {
        let mut record = Self { fields };
        if record.id().is_none() {
            record
                .fields
                .insert(FIELD_ID.to_string(), Value::String(generate_id()));
        }
        let ts = now();
        record
            .fields
            .insert(FIELD_CREATED.to_string(), Value::String(ts.clone()));
        record
            .fields
            .insert(FIELD_UPDATED.to_string(), Value::String(ts));
        record
    }

    /// Returns the record id, if assigned.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.fields.get(FIELD_ID).and_then(Value::as_str)
    }

    /// Returns the record's lifecycle state.
    #[must_use]
    pub fn state(&self) -> RecordState {
        let deleted = self
            .fields
            .get(FIELD_DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if deleted {
            let at = self
                .fields
                .get(FIELD_DELETED_AT)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            RecordState::Tombstoned { at }
        } else {
            RecordState::Live
        }
    }

    /// Returns true if the record has not been soft-deleted.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.state(), RecordState::Live)
    }

    /// Returns a field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns the underlying field map.
    #[must_use]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Consumes the record and returns the underlying field map.
    #[must_use]
    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Produces the merged record for an update.
    ///
    /// `data` is merged shallowly, field by field, over the existing
    /// fields; the `id` is never overwritten. `_updated` is re-stamped.
    #[must_use]
    pub fn merged_with(&self, data: Map<String, Value>) -> Self {
        let mut merged = self.clone();
        for (field, value) in data {
            if field == FIELD_ID {
                continue;
            }
            merged.fields.insert(field, value);
        }
        merged
            .fields
            .insert(FIELD_UPDATED.to_string(), Value::String(now()));
        merged
    }

    /// Transitions the record to `Tombstoned` in place.
    pub fn tombstone(&mut self, at: String) {
        self.fields
            .insert(FIELD_DELETED.to_string(), Value::Bool(true));
        self.fields
            .insert(FIELD_DELETED_AT.to_string(), Value::String(at));
    }

    /// Removes the tombstone bookkeeping fields.
    ///
    /// Used by compaction when rewriting the live record set.
    pub fn strip_tombstone_fields(&mut self) {
        self.fields.remove(FIELD_DELETED);
        self.fields.remove(FIELD_DELETED_AT);
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Object(record.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn insert_assigns_id_and_timestamps() {
        let record = Record::new_insert(fields(&[("name", json!("alice"))]));

        assert!(record.id().is_some());
        assert!(record.get(FIELD_CREATED).is_some());
        assert!(record.get(FIELD_UPDATED).is_some());
        assert_eq!(record.get("name"), Some(&json!("alice")));
    }

    #[test]
    fn insert_honors_explicit_id() {
        let record = Record::new_insert(fields(&[("id", json!("custom-1"))]));
        assert_eq!(record.id(), Some("custom-1"));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = Record::new_insert(Map::new());
        let b = Record::new_insert(Map::new());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn merge_overwrites_fields_but_not_id() {
        let record = Record::new_insert(fields(&[("id", json!("r1")), ("age", json!(30))]));
        let merged = record.merged_with(fields(&[("id", json!("evil")), ("age", json!(31))]));

        assert_eq!(merged.id(), Some("r1"));
        assert_eq!(merged.get("age"), Some(&json!(31)));
        assert_eq!(merged.get(FIELD_CREATED), record.get(FIELD_CREATED));
    }

    #[test]
    fn tombstone_state_machine() {
        let mut record = Record::new_insert(Map::new());
        assert_eq!(record.state(), RecordState::Live);

        record.tombstone("2026-01-01T00:00:00.000Z".to_string());
        assert!(matches!(record.state(), RecordState::Tombstoned { .. }));
        assert!(!record.is_live());

        record.strip_tombstone_fields();
        assert_eq!(record.state(), RecordState::Live);
    }

    #[test]
    fn serializes_transparently() {
        let record = Record::new(fields(&[("a", json!(1))]));
        let text = serde_json::to_string(&record).unwrap();
        assert_eq!(text, r#"{"a":1}"#);

        let back: Record = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn timestamp_format_is_rfc3339_utc() {
        let ts = now();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
