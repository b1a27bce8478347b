//! Secondary index maintenance.
//!
//! An index maps a derived key - the deterministic rendering of one or
//! more field values - to the set of record ids currently holding that
//! key among live records. Indexes are caches over the record set, never
//! a source of truth: any index can be rebuilt from scratch, and is,
//! after WAL replay and after compaction.
//!
//! ## Composite keys
//!
//! A composite index keys on the ordered concatenation of each field's
//! rendered value, joined by the `\u{1F}` unit separator. A record
//! missing **any** of the index's fields contributes no entry - it is
//! excluded, not null-keyed.

use jotdb_record::Record;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Separator between composite key components.
pub const KEY_SEPARATOR: char = '\u{1F}';

/// Renders one field value as a key component.
///
/// Strings render verbatim; every other value renders as its canonical
/// JSON text (object keys are sorted by the underlying map, so the
/// rendering is deterministic).
fn render_component(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Derives the index key for a record, or `None` when the record is
/// missing any of the index's fields.
#[must_use]
pub fn derive_key(fields: &[String], record: &Record) -> Option<String> {
    let mut components = Vec::with_capacity(fields.len());
    for field in fields {
        components.push(render_component(record.get(field)?));
    }
    Some(components.join(&KEY_SEPARATOR.to_string()))
}

/// Derives the index key for a list of values, one per index field.
#[must_use]
pub fn derive_key_from_values(values: &[Value]) -> String {
    values
        .iter()
        .map(render_component)
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string())
}

/// Returns the internal name of an index over the ordered field-set.
#[must_use]
pub fn index_name(fields: &[String]) -> String {
    fields.join("+")
}

#[derive(Debug, Clone)]
struct Index {
    fields: Vec<String>,
    entries: HashMap<String, HashSet<String>>,
}

impl Index {
    fn add(&mut self, record: &Record) {
        let (Some(key), Some(id)) = (derive_key(&self.fields, record), record.id()) else {
            return;
        };
        self.entries.entry(key).or_default().insert(id.to_string());
    }

    fn remove(&mut self, record: &Record) {
        let (Some(key), Some(id)) = (derive_key(&self.fields, record), record.id()) else {
            return;
        };
        if let Some(set) = self.entries.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                self.entries.remove(&key);
            }
        }
    }

    fn rebuild(&mut self, live: &[&Record]) {
        self.entries.clear();
        for record in live {
            self.add(record);
        }
    }
}

/// Maintains all indexes of one collection.
///
/// Every mutating engine operation notifies the manager so incremental
/// maintenance stays consistent with the record set; `rebuild_all` is
/// the full-scan fallback used where incremental maintenance cannot be
/// trusted (startup, compaction, restore).
#[derive(Debug, Default, Clone)]
pub struct IndexManager {
    indexes: BTreeMap<String, Index>,
}

impl IndexManager {
    /// Creates a manager with no indexes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an index on the ordered field-set and builds it from
    /// the live records.
    ///
    /// Returns false (and leaves the existing index untouched) when the
    /// exact field-set is already indexed.
    pub fn create(&mut self, fields: &[String], live: &[&Record]) -> bool {
        let name = index_name(fields);
        if self.indexes.contains_key(&name) {
            return false;
        }
        let mut index = Index {
            fields: fields.to_vec(),
            entries: HashMap::new(),
        };
        index.rebuild(live);
        self.indexes.insert(name, index);
        true
    }

    /// Drops the index on the field-set. Returns false when absent.
    pub fn drop_index(&mut self, fields: &[String]) -> bool {
        self.indexes.remove(&index_name(fields)).is_some()
    }

    /// Clears and re-derives the index from the live records,
    /// registering it first when absent.
    pub fn rebuild(&mut self, fields: &[String], live: &[&Record]) {
        let name = index_name(fields);
        match self.indexes.get_mut(&name) {
            Some(index) => index.rebuild(live),
            None => {
                self.create(fields, live);
            }
        }
    }

    /// Rebuilds every registered index from the live records.
    pub fn rebuild_all(&mut self, live: &[&Record]) {
        for index in self.indexes.values_mut() {
            index.rebuild(live);
        }
    }

    /// Returns true when the exact field-set is indexed.
    #[must_use]
    pub fn contains(&self, fields: &[String]) -> bool {
        self.indexes.contains_key(&index_name(fields))
    }

    /// Returns the registered field-sets, in name order.
    #[must_use]
    pub fn registered(&self) -> Vec<Vec<String>> {
        self.indexes.values().map(|i| i.fields.clone()).collect()
    }

    /// Returns the key-to-ids mapping of an index, if registered.
    #[must_use]
    pub fn entries(&self, fields: &[String]) -> Option<&HashMap<String, HashSet<String>>> {
        self.indexes.get(&index_name(fields)).map(|i| &i.entries)
    }

    /// Looks up the ids holding the given values on an indexed
    /// field-set. Returns an empty vector for unindexed field-sets and
    /// unknown keys.
    #[must_use]
    pub fn lookup(&self, fields: &[String], values: &[Value]) -> Vec<String> {
        let key = derive_key_from_values(values);
        self.indexes
            .get(&index_name(fields))
            .and_then(|i| i.entries.get(&key))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Maintenance hook: a record was inserted.
    pub fn note_insert(&mut self, record: &Record) {
        for index in self.indexes.values_mut() {
            index.add(record);
        }
    }

    /// Maintenance hook: a record was replaced.
    ///
    /// Moves the id between keys only when the derived key changed.
    pub fn note_update(&mut self, old: &Record, new: &Record) {
        for index in self.indexes.values_mut() {
            let old_key = derive_key(&index.fields, old);
            let new_key = derive_key(&index.fields, new);
            if old_key == new_key {
                continue;
            }
            index.remove(old);
            index.add(new);
        }
    }

    /// Maintenance hook: a record was deleted.
    pub fn note_delete(&mut self, record: &Record) {
        for index in self.indexes.values_mut() {
            index.remove(record);
        }
    }
}
