//! Relational-table storage engine backed by SQLite.
//!
//! Records live in a generic key/JSON-blob table; a side table holds
//! (index-name, derived-key, record-id) triples with the same composite
//! key derivation as the in-process index manager. Filters are compiled
//! to SQL predicates over `json_extract(doc, ...)` instead of scanning
//! in process - functionally equivalent to the in-process evaluator,
//! evaluated by SQLite.
//!
//! ```sql
//! records      (id TEXT PRIMARY KEY, doc TEXT, created TEXT,
//!               updated TEXT, deleted_at TEXT)
//! record_index (idx TEXT, key TEXT, record_id TEXT)
//! index_meta   (idx TEXT PRIMARY KEY, fields TEXT)
//! ```
//!
//! `deleted_at` doubles as the tombstone marker; `index_meta` makes
//! registered field-sets durable. A `regexp(pattern, text)` scalar
//! function is registered on the connection for `$regex`.

use crate::cache::LruCache;
use crate::engine::{EngineOptions, EngineState, StorageEngine};
use crate::error::{EngineError, EngineResult};
use crate::index::{derive_key, index_name};
use jotdb_record::{now, Predicate, Query, Record, FIELD_CREATED, FIELD_UPDATED};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    doc TEXT NOT NULL,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    deleted_at TEXT
);
CREATE TABLE IF NOT EXISTS record_index (
    idx TEXT NOT NULL,
    key TEXT NOT NULL,
    record_id TEXT NOT NULL,
    PRIMARY KEY (idx, key, record_id)
);
CREATE TABLE IF NOT EXISTS index_meta (
    idx TEXT PRIMARY KEY,
    fields TEXT NOT NULL
);
";

/// Storage engine backed by a per-collection SQLite database.
pub struct SqliteEngine {
    name: String,
    path: PathBuf,
    conn: Option<Connection>,
    /// Registered indexes: internal name to ordered field-set.
    indexes: BTreeMap<String, Vec<String>>,
    cache: LruCache,
    state: EngineState,
    failure: Option<String>,
}

impl SqliteEngine {
    /// Creates an engine for the named collection; the database file is
    /// `<dir>/<name>.sqlite`. No I/O happens until [`StorageEngine::init`].
    #[must_use]
    pub fn new(dir: &Path, name: &str, options: EngineOptions) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{name}.sqlite")),
            conn: None,
            indexes: BTreeMap::new(),
            cache: LruCache::new(options.cache_capacity),
            state: EngineState::Uninitialized,
            failure: None,
        }
    }

    /// Returns the database file path.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.path
    }

    fn ensure_ready(&self) -> EngineResult<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Failed => Err(EngineError::Failed {
                message: self.failure.clone().unwrap_or_default(),
            }),
            _ => Err(EngineError::NotInitialized),
        }
    }

    fn conn(&self) -> EngineResult<&Connection> {
        self.conn.as_ref().ok_or(EngineError::NotInitialized)
    }

    fn conn_mut(&mut self) -> EngineResult<&mut Connection> {
        self.conn.as_mut().ok_or(EngineError::NotInitialized)
    }

    fn try_init(&mut self) -> EngineResult<()> {
        self.state = EngineState::LoadingSnapshot;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)
            .map_err(|e| EngineError::backend_unavailable(e.to_string()))?;

        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        register_regexp(&conn)?;

        self.state = EngineState::RebuildingIndexes;
        self.indexes = load_index_meta(&conn)?;
        self.conn = Some(conn);
        Ok(())
    }

    fn fetch_live(&self, id: &str) -> EngineResult<Option<Record>> {
        let doc: Option<String> = self
            .conn()?
            .query_row(
                "SELECT doc FROM records WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        doc.map(|d| parse_doc(&d)).transpose()
    }

    /// Rebuilds the side-table entries of every registered index from
    /// the live rows.
    fn rebuild_side_entries(&mut self, only: Option<&str>) -> EngineResult<()> {
        let indexes = self.indexes.clone();
        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;

        let rows: Vec<(String, String)> = {
            let mut stmt = tx.prepare("SELECT id, doc FROM records WHERE deleted_at IS NULL")?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<Result<_, _>>()?
        };

        for (name, fields) in &indexes {
            if only.is_some_and(|o| o != name) {
                continue;
            }
            tx.execute("DELETE FROM record_index WHERE idx = ?1", params![name])?;
            for (id, doc) in &rows {
                let record = parse_doc(doc)?;
                if let Some(key) = derive_key(fields, &record) {
                    tx.execute(
                        "INSERT OR IGNORE INTO record_index (idx, key, record_id) \
                         VALUES (?1, ?2, ?3)",
                        params![name, key, id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns the (key, record-id) pairs of an index's side-table
    /// entries. Introspection surface for stats and tests.
    pub fn index_entries(&self, fields: &[String]) -> EngineResult<Vec<(String, String)>> {
        self.ensure_ready()?;
        let name = index_name(fields);
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key, record_id FROM record_index WHERE idx = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![name], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn parse_doc(doc: &str) -> EngineResult<Record> {
    serde_json::from_str(doc)
        .map_err(|e| EngineError::corrupted(format!("stored document failed to parse: {e}")))
}

fn load_index_meta(conn: &Connection) -> EngineResult<BTreeMap<String, Vec<String>>> {
    let mut stmt = conn.prepare("SELECT idx, fields FROM index_meta")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut indexes = BTreeMap::new();
    for row in rows {
        let (name, fields_json) = row?;
        let fields: Vec<String> = serde_json::from_str(&fields_json)
            .map_err(|e| EngineError::corrupted(format!("index meta failed to parse: {e}")))?;
        indexes.insert(name, fields);
    }
    Ok(indexes)
}

fn register_regexp(conn: &Connection) -> EngineResult<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let text: Option<String> = ctx.get(1)?;
            let re = regex::Regex::new(&pattern)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
            Ok(text.is_some_and(|t| re.is_match(&t)))
        },
    )?;
    Ok(())
}

fn timestamp_field(record: &Record, field: &str) -> String {
    record
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn encode_doc(record: &Record) -> EngineResult<String> {
    serde_json::to_string(record)
        .map_err(|e| EngineError::corrupted(format!("document encode failed: {e}")))
}

// ---------------------------------------------------------------------
// Query compilation
// ---------------------------------------------------------------------

fn json_path(field: &str) -> String {
    format!("$.\"{field}\"")
}

fn sql_param(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Equality fragment for one field and operand.
///
/// Typed `json_type` guards keep SQLite's cross-type ordering from
/// matching where the in-process evaluator would not (a JSON `true`
/// extracts as integer 1, for instance).
fn eq_fragment(field: &str, operand: &Value, args: &mut Vec<SqlValue>) -> String {
    let path = json_path(field);
    match operand {
        Value::Null => {
            args.push(SqlValue::Text(path));
            "json_type(doc, ?) = 'null'".to_string()
        }
        Value::Bool(_) => {
            args.push(SqlValue::Text(path.clone()));
            args.push(SqlValue::Text(path));
            args.push(sql_param(operand));
            "(json_type(doc, ?) IN ('true','false') AND json_extract(doc, ?) = ?)".to_string()
        }
        _ => {
            args.push(SqlValue::Text(path));
            args.push(sql_param(operand));
            "json_extract(doc, ?) = ?".to_string()
        }
    }
}

/// Membership fragment for one `$in` member: the whole field equals the
/// member, or (for array fields) one of its elements does. `json_each`
/// yields a single row for scalar fields, which covers both shapes.
fn member_fragment(field: &str, member: &Value, args: &mut Vec<SqlValue>) -> String {
    let eq = eq_fragment(field, member, args);
    args.push(SqlValue::Text(json_path(field)));
    args.push(sql_param(member));
    format!("({eq} OR EXISTS (SELECT 1 FROM json_each(doc, ?) WHERE json_each.value = ?))")
}

fn in_fragment(field: &str, members: &[Value], args: &mut Vec<SqlValue>) -> String {
    if members.is_empty() {
        return "0".to_string();
    }
    let parts: Vec<String> = members
        .iter()
        .map(|m| member_fragment(field, m, args))
        .collect();
    format!("({})", parts.join(" OR "))
}

fn compare_fragment(
    field: &str,
    operand: &Value,
    op: &str,
    args: &mut Vec<SqlValue>,
) -> String {
    let path = json_path(field);
    let guard = match operand {
        Value::Number(_) => "json_type(doc, ?) IN ('integer','real')",
        Value::String(_) => "json_type(doc, ?) = 'text'",
        Value::Bool(_) => "json_type(doc, ?) IN ('true','false')",
        // Ordered comparison is undefined for the remaining types.
        _ => return "0".to_string(),
    };
    args.push(SqlValue::Text(path.clone()));
    args.push(SqlValue::Text(path));
    args.push(sql_param(operand));
    format!("({guard} AND json_extract(doc, ?) {op} ?)")
}

/// Stringified rendering of a field for `regexp`, matching the
/// in-process evaluator: strings as-is, other values via their JSON
/// rendering.
fn text_rendering(path_args: &mut Vec<SqlValue>, path: &str) -> String {
    path_args.push(SqlValue::Text(path.to_string()));
    path_args.push(SqlValue::Text(path.to_string()));
    "CASE json_type(doc, ?) \
     WHEN 'true' THEN 'true' \
     WHEN 'false' THEN 'false' \
     WHEN 'null' THEN 'null' \
     ELSE CAST(json_extract(doc, ?) AS TEXT) END"
        .to_string()
}

fn predicate_fragment(field: &str, predicate: &Predicate, args: &mut Vec<SqlValue>) -> String {
    match predicate {
        Predicate::Eq(operand) => eq_fragment(field, operand, args),
        Predicate::Ne(operand) => {
            let eq = eq_fragment(field, operand, args);
            // Missing fields yield SQL NULL; a missing field is "not
            // equal", so coalesce before negating.
            format!("NOT COALESCE(({eq}), 0)")
        }
        Predicate::Gt(operand) => compare_fragment(field, operand, ">", args),
        Predicate::Gte(operand) => compare_fragment(field, operand, ">=", args),
        Predicate::Lt(operand) => compare_fragment(field, operand, "<", args),
        Predicate::Lte(operand) => compare_fragment(field, operand, "<=", args),
        Predicate::In(members) => in_fragment(field, members, args),
        Predicate::Nin(members) => {
            if members.is_empty() {
                return "1".to_string();
            }
            let inner = in_fragment(field, members, args);
            format!("NOT COALESCE({inner}, 0)")
        }
        Predicate::Regex(regex) => {
            args.push(SqlValue::Text(json_path(field)));
            args.push(SqlValue::Text(regex.as_str().to_string()));
            let rendering = text_rendering(args, &json_path(field));
            format!("(json_type(doc, ?) IS NOT NULL AND regexp(?, {rendering}))")
        }
        Predicate::Exists(true) => {
            args.push(SqlValue::Text(json_path(field)));
            "json_type(doc, ?) IS NOT NULL".to_string()
        }
        Predicate::Exists(false) => {
            args.push(SqlValue::Text(json_path(field)));
            "json_type(doc, ?) IS NULL".to_string()
        }
    }
}

/// Compiles a parsed query to a SQL `WHERE` body plus its parameters.
fn compile_query(query: &Query) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["deleted_at IS NULL".to_string()];
    let mut args = Vec::new();
    for (field, predicates) in query.predicates() {
        for predicate in predicates {
            clauses.push(predicate_fragment(field, predicate, &mut args));
        }
    }
    (clauses.join(" AND "), args)
}

impl StorageEngine for SqliteEngine {
    fn state(&self) -> EngineState {
        self.state
    }

    fn init(&mut self) -> EngineResult<()> {
        if self.state == EngineState::Ready {
            return Ok(());
        }
        match self.try_init() {
            Ok(()) => {
                self.state = EngineState::Ready;
                self.failure = None;
                debug!(collection = %self.name, db = %self.path.display(), "engine ready");
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Failed;
                self.failure = Some(e.to_string());
                self.conn = None;
                Err(e)
            }
        }
    }

    fn get(&mut self, id: &str) -> EngineResult<Option<Record>> {
        self.ensure_ready()?;
        if let Some(record) = self.cache.get(id) {
            return Ok(Some(record.clone()));
        }
        let found = self.fetch_live(id)?;
        if let Some(record) = &found {
            self.cache.set(id.to_string(), record.clone());
        }
        Ok(found)
    }

    fn find(&mut self, query: &Query) -> EngineResult<Vec<Record>> {
        self.ensure_ready()?;
        let (where_body, args) = compile_query(query);
        let sql = format!("SELECT doc FROM records WHERE {where_body}");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(parse_doc(&row?)?);
        }
        Ok(records)
    }

    fn insert(&mut self, data: Map<String, Value>) -> EngineResult<Record> {
        self.ensure_ready()?;
        let record = Record::new_insert(data);
        let id = record
            .id()
            .map(ToString::to_string)
            .ok_or_else(|| EngineError::corrupted("record missing id"))?;
        let doc = encode_doc(&record)?;
        let created = timestamp_field(&record, FIELD_CREATED);
        let updated = timestamp_field(&record, FIELD_UPDATED);

        let indexes = self.indexes.clone();
        let conn = self.conn_mut()?;

        // A tombstoned row may still occupy the id; only a live row
        // conflicts.
        let existing: Option<Option<String>> = conn
            .query_row(
                "SELECT deleted_at FROM records WHERE id = ?1",
                params![&id],
                |row| row.get(0),
            )
            .optional()?;
        if matches!(existing, Some(None)) {
            return Err(EngineError::already_exists(id));
        }

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO records (id, doc, created, updated, deleted_at) \
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![&id, doc, created, updated],
        )?;
        for (name, fields) in &indexes {
            if let Some(key) = derive_key(fields, &record) {
                tx.execute(
                    "INSERT OR IGNORE INTO record_index (idx, key, record_id) \
                     VALUES (?1, ?2, ?3)",
                    params![name, key, &id],
                )?;
            }
        }
        tx.commit()?;

        self.cache.set(id.clone(), record.clone());
        debug!(collection = %self.name, id = %id, "inserted record");
        Ok(record)
    }

    fn update(&mut self, id: &str, data: Map<String, Value>) -> EngineResult<Record> {
        self.ensure_ready()?;
        let old = self
            .fetch_live(id)?
            .ok_or_else(|| EngineError::not_found(id))?;
        let merged = old.merged_with(data);
        let doc = encode_doc(&merged)?;
        let updated = timestamp_field(&merged, FIELD_UPDATED);

        let indexes = self.indexes.clone();
        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE records SET doc = ?1, updated = ?2 WHERE id = ?3",
            params![doc, updated, id],
        )?;
        for (name, fields) in &indexes {
            let old_key = derive_key(fields, &old);
            let new_key = derive_key(fields, &merged);
            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                tx.execute(
                    "DELETE FROM record_index WHERE idx = ?1 AND key = ?2 AND record_id = ?3",
                    params![name, key, id],
                )?;
            }
            if let Some(key) = new_key {
                tx.execute(
                    "INSERT OR IGNORE INTO record_index (idx, key, record_id) \
                     VALUES (?1, ?2, ?3)",
                    params![name, key, id],
                )?;
            }
        }
        tx.commit()?;

        self.cache.set(id.to_string(), merged.clone());
        debug!(collection = %self.name, id, "updated record");
        Ok(merged)
    }

    fn delete(&mut self, id: &str) -> EngineResult<bool> {
        self.ensure_ready()?;
        let mut old = self
            .fetch_live(id)?
            .ok_or_else(|| EngineError::not_found(id))?;
        let at = now();
        let live = old.clone();
        old.tombstone(at.clone());
        let doc = encode_doc(&old)?;

        let indexes = self.indexes.clone();
        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE records SET doc = ?1, deleted_at = ?2 WHERE id = ?3",
            params![doc, at, id],
        )?;
        for (name, fields) in &indexes {
            if let Some(key) = derive_key(fields, &live) {
                tx.execute(
                    "DELETE FROM record_index WHERE idx = ?1 AND key = ?2 AND record_id = ?3",
                    params![name, key, id],
                )?;
            }
        }
        tx.commit()?;

        self.cache.remove(id);
        debug!(collection = %self.name, id, "deleted record");
        Ok(true)
    }

    fn create_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let name = index_name(fields);
        if self.indexes.contains_key(&name) {
            return Ok(());
        }
        let fields_json = serde_json::to_string(fields)
            .map_err(|e| EngineError::corrupted(format!("index meta encode failed: {e}")))?;

        let conn = self.conn_mut()?;
        conn.execute(
            "INSERT OR IGNORE INTO index_meta (idx, fields) VALUES (?1, ?2)",
            params![name, fields_json],
        )?;
        // Structural index accelerating side-table lookups for this
        // logical index.
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"ix_{name}\" ON record_index (key, record_id) \
             WHERE idx = '{name}'"
        ))?;

        self.indexes.insert(name.clone(), fields.to_vec());
        self.rebuild_side_entries(Some(&name))?;
        Ok(())
    }

    fn drop_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let name = index_name(fields);
        if self.indexes.remove(&name).is_none() {
            return Ok(());
        }
        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM index_meta WHERE idx = ?1", params![name])?;
        tx.execute("DELETE FROM record_index WHERE idx = ?1", params![name])?;
        tx.execute_batch(&format!("DROP INDEX IF EXISTS \"ix_{name}\""))?;
        tx.commit()?;
        Ok(())
    }

    fn rebuild_index(&mut self, fields: &[String]) -> EngineResult<()> {
        self.ensure_ready()?;
        let name = index_name(fields);
        if !self.indexes.contains_key(&name) {
            return self.create_index(fields);
        }
        self.rebuild_side_entries(Some(&name))
    }

    fn compact(&mut self) -> EngineResult<bool> {
        self.ensure_ready()?;
        let conn = self.conn_mut()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM record_index WHERE record_id IN \
             (SELECT id FROM records WHERE deleted_at IS NOT NULL)",
            [],
        )?;
        let purged = tx.execute("DELETE FROM records WHERE deleted_at IS NOT NULL", [])?;
        tx.commit()?;

        // Storage-engine-level reclaim of the freed pages.
        conn.execute_batch("VACUUM")?;
        self.cache.clear();
        debug!(collection = %self.name, purged, "compacted collection");
        Ok(true)
    }

    fn backup(&mut self, dir: &Path) -> EngineResult<PathBuf> {
        self.ensure_ready()?;
        fs::create_dir_all(dir)?;
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S%3f");
        let dest = dir.join(format!("{}-{stamp}.sqlite", self.name));

        let conn = self.conn()?;
        let mut target = Connection::open(&dest)
            .map_err(|e| EngineError::backend_unavailable(e.to_string()))?;
        let backup = rusqlite::backup::Backup::new(conn, &mut target)?;
        backup.run_to_completion(64, std::time::Duration::from_millis(0), None)?;
        drop(backup);

        debug!(collection = %self.name, path = %dest.display(), "wrote backup");
        Ok(dest)
    }

    fn restore(&mut self, path: &Path) -> EngineResult<bool> {
        self.ensure_ready()?;
        let source = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| EngineError::backend_unavailable(e.to_string()))?;

        {
            let conn = self.conn_mut()?;
            let backup = rusqlite::backup::Backup::new(&source, conn)?;
            backup.run_to_completion(64, std::time::Duration::from_millis(0), None)?;
        }

        self.cache.clear();
        self.indexes = load_index_meta(self.conn()?)?;
        // Incremental maintenance cannot be trusted across a wholesale
        // replace; rebuild every side entry.
        self.rebuild_side_entries(None)?;
        debug!(collection = %self.name, path = %path.display(), "restored from backup");
        Ok(true)
    }

    fn len(&self) -> EngineResult<usize> {
        self.ensure_ready()?;
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM records WHERE deleted_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn close(&mut self) -> EngineResult<()> {
        self.conn = None;
        self.cache.clear();
        if self.state == EngineState::Ready {
            debug!(collection = %self.name, "engine closed");
        }
        self.state = EngineState::Uninitialized;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn open_engine(dir: &Path) -> SqliteEngine {
        let mut engine = SqliteEngine::new(dir, "things", EngineOptions::default());
        engine.init().unwrap();
        engine
    }

    fn query(filter: Value) -> Query {
        match filter {
            Value::Object(map) => Query::parse(&map).unwrap(),
            _ => panic!("filter must be an object"),
        }
    }

    fn physical_count(engine: &SqliteEngine) -> i64 {
        let conn = Connection::open(engine.db_path()).unwrap();
        conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn insert_and_get() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let record = engine.insert(fields(&[("name", json!("alice"))])).unwrap();
        let id = record.id().unwrap().to_string();

        let found = engine.get(&id).unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("alice")));
    }

    #[test]
    fn ops_fail_before_init() {
        let dir = tempdir().unwrap();
        let mut engine = SqliteEngine::new(dir.path(), "things", EngineOptions::default());
        assert!(matches!(engine.get("x"), Err(EngineError::NotInitialized)));
    }

    #[test]
    fn unopenable_database_is_backend_unavailable() {
        let dir = tempdir().unwrap();
        // A file where the engine expects a directory component.
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "not a directory").unwrap();

        let mut engine = SqliteEngine::new(&blocker, "things", EngineOptions::default());
        let result = engine.init();
        assert!(matches!(
            result,
            Err(EngineError::BackendUnavailable { .. }) | Err(EngineError::Io(_))
        ));
        assert_eq!(engine.state(), EngineState::Failed);
    }

    #[test]
    fn duplicate_live_id_is_rejected() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.insert(fields(&[("id", json!("mine"))])).unwrap();

        let dup = engine.insert(fields(&[("id", json!("mine"))]));
        assert!(matches!(dup, Err(EngineError::AlreadyExists { .. })));
    }

    #[test]
    fn find_compiles_operator_filters() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        engine
            .insert(fields(&[("age", json!(30)), ("tags", json!(["a", "b"]))]))
            .unwrap();
        engine
            .insert(fields(&[("age", json!(70)), ("tags", json!(["c"]))]))
            .unwrap();
        engine.insert(fields(&[("age", json!("thirty"))])).unwrap();

        let hits = engine
            .find(&query(json!({
                "age": {"$gte": 18, "$lt": 65},
                "tags": {"$in": ["b", "c"]},
            })))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("age"), Some(&json!(30)));

        // $gt is strict, and string-typed fields never order against
        // number operands.
        assert!(engine.find(&query(json!({"age": {"$gt": 70}}))).unwrap().is_empty());
    }

    #[test]
    fn ne_and_exists_handle_missing_fields() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.insert(fields(&[("age", json!(30))])).unwrap();

        assert_eq!(
            engine.find(&query(json!({"nickname": {"$ne": "al"}}))).unwrap().len(),
            1
        );
        assert_eq!(
            engine
                .find(&query(json!({"nickname": {"$exists": false}})))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            engine.find(&query(json!({"age": {"$exists": true}}))).unwrap().len(),
            1
        );
        assert_eq!(
            engine.find(&query(json!({"age": {"$nin": [31]}}))).unwrap().len(),
            1
        );
    }

    #[test]
    fn regex_matches_via_registered_function() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine
            .insert(fields(&[("email", json!("a@example.com"))]))
            .unwrap();
        engine.insert(fields(&[("email", json!("b@other.net"))])).unwrap();

        let hits = engine
            .find(&query(json!({"email": {"$regex": "@example\\.com$"}})))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn boolean_equality_does_not_match_integers() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        engine.insert(fields(&[("flag", json!(true))])).unwrap();
        engine.insert(fields(&[("flag", json!(1))])).unwrap();

        let hits = engine.find(&query(json!({"flag": true}))).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("flag"), Some(&json!(true)));
    }

    #[test]
    fn soft_delete_then_compact_reclaims_rows() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let a = engine.insert(fields(&[("n", json!(1))])).unwrap();
        engine.insert(fields(&[("n", json!(2))])).unwrap();
        let id = a.id().unwrap().to_string();

        engine.delete(&id).unwrap();
        assert!(engine.get(&id).unwrap().is_none());
        assert_eq!(engine.len().unwrap(), 1);
        // Tombstoned row still occupies the table.
        assert_eq!(physical_count(&engine), 2);

        engine.compact().unwrap();
        assert_eq!(physical_count(&engine), 1);
    }

    #[test]
    fn side_table_maintains_composite_index() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        let idx = vec!["last".to_string(), "first".to_string()];
        engine.create_index(&idx).unwrap();

        let full = engine
            .insert(fields(&[("last", json!("smith")), ("first", json!("jo"))]))
            .unwrap();
        engine.insert(fields(&[("last", json!("smith"))])).unwrap();

        // The record missing "first" contributes no entry.
        let entries = engine.index_entries(&idx).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, full.id().unwrap());

        // Update moves the entry to its new key.
        engine
            .update(full.id().unwrap(), fields(&[("first", json!("al"))]))
            .unwrap();
        let entries = engine.index_entries(&idx).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].0.contains("al"));

        // Delete removes it.
        engine.delete(full.id().unwrap()).unwrap();
        assert!(engine.index_entries(&idx).unwrap().is_empty());
    }

    #[test]
    fn index_meta_survives_restart() {
        let dir = tempdir().unwrap();
        let idx = vec!["city".to_string()];
        {
            let mut engine = open_engine(dir.path());
            engine.create_index(&idx).unwrap();
            engine.insert(fields(&[("city", json!("rome"))])).unwrap();
            engine.close().unwrap();
        }
        {
            let mut engine = open_engine(dir.path());
            assert_eq!(engine.index_entries(&idx).unwrap().len(), 1);
        }
    }

    #[test]
    fn rebuild_index_rederives_side_entries() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        let idx = vec!["city".to_string()];
        engine.create_index(&idx).unwrap();
        engine.insert(fields(&[("city", json!("rome"))])).unwrap();

        // Damage the side table, then rebuild.
        engine
            .conn()
            .unwrap()
            .execute("DELETE FROM record_index", [])
            .unwrap();
        assert!(engine.index_entries(&idx).unwrap().is_empty());

        engine.rebuild_index(&idx).unwrap();
        assert_eq!(engine.index_entries(&idx).unwrap().len(), 1);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let dir = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let mut engine = open_engine(dir.path());

        let a = engine.insert(fields(&[("n", json!(1))])).unwrap();
        let b = engine.insert(fields(&[("n", json!(2))])).unwrap();
        let backup_path = engine.backup(backups.path()).unwrap();
        assert!(backup_path.exists());

        engine.delete(a.id().unwrap()).unwrap();
        engine.delete(b.id().unwrap()).unwrap();
        engine.compact().unwrap();
        assert_eq!(engine.len().unwrap(), 0);

        assert!(engine.restore(&backup_path).unwrap());
        assert_eq!(engine.len().unwrap(), 2);
        assert!(engine.get(a.id().unwrap()).unwrap().is_some());
    }

    #[test]
    fn update_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let mut engine = open_engine(dir.path());
        assert!(matches!(
            engine.update("ghost", fields(&[])),
            Err(EngineError::NotFound { .. })
        ));
        assert!(matches!(
            engine.delete("ghost"),
            Err(EngineError::NotFound { .. })
        ));
    }
}
