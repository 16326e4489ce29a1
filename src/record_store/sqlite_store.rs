//! Concrete SQLite binding for the record-store engine, grounded directly
//! on the original `SQLiteDatabase`/`SQLiteKeyStore` schema and query shapes
//! (§4.1 expansion): `kvmeta` bookkeeping table, one `kv_<name>` table per
//! key-store, lazily-created `_keys`/`_seqs` indexes.

use super::{ContentOptions, KeyRange, Record, SequenceRange};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Invoked once with `true` right before a compaction starts and once with
/// `false` right after it finishes (successfully or not), mirroring
/// `Database::setOnCompact`'s `OnCompactCallback`.
pub type OnCompactCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Only one compaction may run at any moment across the process (mirrors
/// the original `SQLiteDataFile`'s process-wide compaction guard) —
/// deliberately a `static`, not a per-handle flag, since two `SqliteHandle`s
/// could otherwise both think they're compacting different files at once
/// while actually racing on shared process resources (temp space, page
/// cache).
static COMPACTING: AtomicBool = AtomicBool::new(false);

/// Kind of index `createIndex` can build, mirroring `C4IndexType` (§4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKind {
    Value,
    FullText,
    Array,
    Predictive,
}

/// A compiled query, returned by [`RecordStore::compile_query`]. Opaque for
/// now — see that method's doc comment.
pub struct Query {
    pub source_json: String,
}

/// Per-store capability flags, immutable after creation, mirroring §3's
/// `KeyStore capabilities`.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeyStoreCapabilities {
    pub sequences: bool,
    pub soft_deletes: bool,
    pub get_by_offset: bool,
}

impl KeyStoreCapabilities {
    pub fn default_store() -> Self {
        Self {
            sequences: true,
            soft_deletes: true,
            get_by_offset: false,
        }
    }
}

/// The shared SQLite connection underlying every key-store of one database
/// file. Opened once by the `Database` facade and handed out to each
/// [`RecordStore`] as a clone of the `Arc`.
pub struct SqliteHandle {
    conn: Mutex<Connection>,
    path: PathBuf,
    on_compact: Mutex<Option<OnCompactCallback>>,
}

impl SqliteHandle {
    pub fn open(path: impl AsRef<Path>, create: bool, writeable: bool) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() && !create {
            return Err(Error::CantOpenFile(path));
        }
        let conn = if writeable {
            Connection::open(&path)?
        } else {
            Connection::open_with_flags(&path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?
        };

        conn.pragma_update(None, "mmap_size", 50_000_000i64)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kvmeta (name TEXT PRIMARY KEY, lastSeq INTEGER NOT NULL DEFAULT 0) WITHOUT ROWID",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS compactionmeta (id INTEGER PRIMARY KEY CHECK (id = 0), purgeCount INTEGER NOT NULL DEFAULT 0)",
            [],
        )?;
        conn.execute("INSERT OR IGNORE INTO compactionmeta (id, purgeCount) VALUES (0, 0)", [])?;

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            path,
            on_compact: Mutex::new(None),
        }))
    }

    /// Registers (or clears, with `None`) the callback compaction invokes
    /// once before starting and once after finishing.
    pub fn set_on_compact(&self, callback: Option<OnCompactCallback>) {
        *self.on_compact.lock() = callback;
    }

    /// Total rows permanently removed by compaction over this database's
    /// lifetime.
    pub fn purge_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT purgeCount FROM compactionmeta WHERE id = 0", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (creating if necessary) a named key-store table.
    pub fn key_store(
        self: &Arc<Self>,
        name: &str,
        capabilities: KeyStoreCapabilities,
    ) -> Result<RecordStore> {
        let table = table_name(name);
        {
            let conn = self.conn.lock();
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        key BLOB PRIMARY KEY,
                        meta BLOB,
                        body BLOB,
                        sequence INTEGER,
                        deleted INTEGER NOT NULL DEFAULT 0
                    )"
                ),
                [],
            )?;
        }
        Ok(RecordStore {
            handle: self.clone(),
            name: name.to_string(),
            capabilities,
            key_index_ready: AtomicBool::new(false),
            seq_index_ready: AtomicBool::new(false),
        })
    }

    /// All `kv_*` table names currently present in the database.
    pub fn all_key_store_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'kv\\_%' ESCAPE '\\'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .map(|full| full.trim_start_matches("kv_").to_string())
            .collect();
        Ok(names)
    }

    /// Deletes all soft-deleted rows from every key-store table, then
    /// `VACUUM`s, then adds the rows removed to the database's lifetime
    /// `purgeCount`. Fires the registered `OnCompactCallback` once before
    /// and once after. Only one compaction may run at a time across the
    /// whole process — a concurrent caller gets
    /// [`Error::CompactionInProgress`] rather than blocking.
    pub fn compact(&self) -> Result<()> {
        if COMPACTING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::CompactionInProgress);
        }
        let result = self.compact_locked();
        COMPACTING.store(false, Ordering::Release);
        result
    }

    fn compact_locked(&self) -> Result<()> {
        if let Some(cb) = self.on_compact.lock().as_ref() {
            cb(true);
        }
        let result = self.compact_inner();
        if let Some(cb) = self.on_compact.lock().as_ref() {
            cb(false);
        }
        result
    }

    fn compact_inner(&self) -> Result<()> {
        let names = self.all_key_store_names()?;
        let conn = self.conn.lock();
        let mut purged: u64 = 0;
        for name in &names {
            purged += conn.execute(&format!("DELETE FROM {} WHERE deleted = 1", table_name(name)), [])? as u64;
        }
        // Recorded before VACUUM: the deletes above already committed, so
        // purgeCount must reflect them even if VACUUM itself fails (e.g.
        // out of disk space, which VACUUM needs roughly a full copy for).
        conn.execute(
            "UPDATE compactionmeta SET purgeCount = purgeCount + ?1 WHERE id = 0",
            params![purged as i64],
        )?;
        conn.execute("VACUUM", [])?;
        Ok(())
    }

    pub fn begin_transaction(&self) -> Result<()> {
        self.conn.lock().execute("BEGIN IMMEDIATE", [])?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.lock().execute("COMMIT", [])?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.lock().execute("ROLLBACK", [])?;
        Ok(())
    }
}

fn table_name(store: &str) -> String {
    format!("kv_{store}")
}

/// A named, transactional key/value collection within one SQLite file.
pub struct RecordStore {
    handle: Arc<SqliteHandle>,
    name: String,
    capabilities: KeyStoreCapabilities,
    key_index_ready: AtomicBool,
    seq_index_ready: AtomicBool,
}

impl RecordStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> KeyStoreCapabilities {
        self.capabilities
    }

    fn table(&self) -> String {
        table_name(&self.name)
    }

    fn ensure_key_index(&self) -> Result<()> {
        if self.key_index_ready.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.handle.conn.lock();
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {0}_keys ON {0} (key)",
                self.table()
            ),
            [],
        )?;
        Ok(())
    }

    fn ensure_seq_index(&self) -> Result<()> {
        if !self.capabilities.sequences {
            return Err(Error::NotSequenced(self.name.clone()));
        }
        if self.seq_index_ready.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conn = self.handle.conn.lock();
        conn.execute(
            &format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {0}_seqs ON {0} (sequence)",
                self.table()
            ),
            [],
        )?;
        Ok(())
    }

    pub fn last_sequence(&self) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let seq: Option<i64> = conn
            .query_row(
                "SELECT lastSeq FROM kvmeta WHERE name = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0) as u64)
    }

    fn set_last_sequence(conn: &Connection, name: &str, seq: u64) -> Result<()> {
        conn.execute(
            "INSERT INTO kvmeta(name, lastSeq) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET lastSeq = excluded.lastSeq",
            params![name, seq as i64],
        )?;
        Ok(())
    }

    pub fn record_count(&self) -> Result<u64> {
        let conn = self.handle.conn.lock();
        let sql = if self.capabilities.soft_deletes {
            format!("SELECT COUNT(*) FROM {} WHERE deleted != 1", self.table())
        } else {
            format!("SELECT COUNT(*) FROM {}", self.table())
        };
        let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn get(&self, key: &[u8], opts: ContentOptions) -> Result<Option<Record>> {
        let conn = self.handle.conn.lock();
        let cols = if opts == ContentOptions::MetaOnly {
            "key, meta, NULL, sequence, deleted"
        } else {
            "key, meta, body, sequence, deleted"
        };
        let sql = format!("SELECT {cols} FROM {} WHERE key = ?1", self.table());
        conn.query_row(&sql, params![key], row_to_record)
            .optional()
            .map_err(Error::from)
    }

    pub fn get_by_sequence(&self, sequence: u64, opts: ContentOptions) -> Result<Option<Record>> {
        if !self.capabilities.sequences {
            return Err(Error::NotSequenced(self.name.clone()));
        }
        let conn = self.handle.conn.lock();
        let cols = if opts == ContentOptions::MetaOnly {
            "key, meta, NULL, sequence, deleted"
        } else {
            "key, meta, body, sequence, deleted"
        };
        let sql = format!("SELECT {cols} FROM {} WHERE sequence = ?1", self.table());
        conn.query_row(&sql, params![sequence as i64], row_to_record)
            .optional()
            .map_err(Error::from)
    }

    /// Insert or replace a row, assigning the next sequence if this store
    /// has sequences enabled. Returns `(sequence, offset)` — `offset` is
    /// always 0 unless `getByOffset` is supported (not yet implemented).
    pub fn set(&self, key: &[u8], meta: &[u8], body: &[u8]) -> Result<(u64, u64)> {
        let conn = self.handle.conn.lock();
        let sequence = if self.capabilities.sequences {
            let next = {
                let seq: Option<i64> = conn
                    .query_row(
                        "SELECT lastSeq FROM kvmeta WHERE name = ?1",
                        params![self.name],
                        |row| row.get(0),
                    )
                    .optional()?;
                seq.unwrap_or(0) as u64 + 1
            };
            next
        } else {
            0
        };

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, meta, body, sequence, deleted) VALUES (?1, ?2, ?3, ?4, 0)",
                self.table()
            ),
            params![key, meta, body, sequence as i64],
        )?;

        if self.capabilities.sequences {
            Self::set_last_sequence(&conn, &self.name, sequence)?;
        }

        Ok((sequence, 0))
    }

    pub fn write(&self, record: &Record) -> Result<()> {
        self.set(&record.key, &record.meta, &record.body)?;
        Ok(())
    }

    /// Delete by key: soft-delete (row kept, body/meta nulled, sequence
    /// advanced) when the store supports it, otherwise a hard delete.
    pub fn del_by_key(&self, key: &[u8]) -> Result<bool> {
        let conn = self.handle.conn.lock();
        if self.capabilities.soft_deletes {
            let new_seq = if self.capabilities.sequences {
                let seq: Option<i64> = conn
                    .query_row(
                        "SELECT lastSeq FROM kvmeta WHERE name = ?1",
                        params![self.name],
                        |row| row.get(0),
                    )
                    .optional()?;
                Some(seq.unwrap_or(0) as u64 + 1)
            } else {
                None
            };

            let changed = if let Some(seq) = new_seq {
                conn.execute(
                    &format!(
                        "UPDATE {} SET deleted = 1, meta = NULL, body = NULL, sequence = ?2 WHERE key = ?1",
                        self.table()
                    ),
                    params![key, seq as i64],
                )?
            } else {
                conn.execute(
                    &format!(
                        "UPDATE {} SET deleted = 1, meta = NULL, body = NULL WHERE key = ?1",
                        self.table()
                    ),
                    params![key],
                )?
            };

            if changed > 0 {
                if let Some(seq) = new_seq {
                    Self::set_last_sequence(&conn, &self.name, seq)?;
                }
                return Ok(true);
            }
            Ok(false)
        } else {
            let changed = conn.execute(
                &format!("DELETE FROM {} WHERE key = ?1", self.table()),
                params![key],
            )?;
            Ok(changed > 0)
        }
    }

    /// Hard-deletes a row outright regardless of `softDeletes`, matching
    /// `purgeDocument`'s "gone, not tombstoned" semantics.
    pub fn purge(&self, key: &[u8]) -> Result<bool> {
        let conn = self.handle.conn.lock();
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", self.table()),
            params![key],
        )?;
        Ok(changed > 0)
    }

    pub fn erase(&self) -> Result<()> {
        let conn = self.handle.conn.lock();
        conn.execute(&format!("DELETE FROM {}", self.table()), [])?;
        Self::set_last_sequence(&conn, &self.name, 0)?;
        Ok(())
    }

    /// Key-range enumeration, matching `newEnumeratorImpl(min,max,...)`: a
    /// lazily-created `(key)` index, inclusive/exclusive bounds, optional
    /// descending order, `deleted != 1` filter when soft-deletes are on.
    pub fn enumerate_by_key(&self, range: &KeyRange) -> Result<Vec<Record>> {
        self.ensure_key_index()?;
        let conn = self.handle.conn.lock();

        let mut clauses = Vec::new();
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(min) = &range.min {
            clauses.push(format!("key {} ?", if range.min_inclusive { ">=" } else { ">" }));
            binds.push(Box::new(min.clone()));
        }
        if let Some(max) = &range.max {
            clauses.push(format!("key {} ?", if range.max_inclusive { "<=" } else { "<" }));
            binds.push(Box::new(max.clone()));
        }
        if self.capabilities.soft_deletes && !range.include_deleted {
            clauses.push("deleted != 1".to_string());
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let order = if range.descending { "DESC" } else { "ASC" };
        // SQLite requires a LIMIT before an OFFSET; -1 means "no limit".
        let limit = range.limit.map(|l| l as i64).unwrap_or(-1);

        let sql = format!(
            "SELECT key, meta, body, sequence, deleted FROM {} {where_clause} ORDER BY key {order} LIMIT ?{n} OFFSET ?{n2}",
            self.table(),
            n = binds.len() + 1,
            n2 = binds.len() + 2,
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut idx = 1;
        for b in &binds {
            stmt.raw_bind_parameter(idx, b.to_sql()?)?;
            idx += 1;
        }
        stmt.raw_bind_parameter(idx, limit)?;
        stmt.raw_bind_parameter(idx + 1, range.skip as i64)?;

        let mut rows = stmt.raw_query();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_record(row)?);
        }
        Ok(out)
    }

    /// Creates a named index over `exprJSON` — a JSON array of property
    /// paths, e.g. `["name", "address.city"]` — the common "simple value
    /// index" shape. Anything beyond flat property paths (computed
    /// expressions, arrays-of-arrays) and every kind but [`IndexKind::Value`]
    /// are out of scope for this binding and report
    /// [`Error::Unimplemented`] rather than silently doing nothing — the
    /// same seam `VectorDocumentFactory` uses elsewhere in this crate.
    pub fn create_index(&self, index_name: &str, expr_json: &str, kind: IndexKind, _options: Option<&str>) -> Result<()> {
        match kind {
            IndexKind::Value => self.create_value_index(index_name, expr_json),
            IndexKind::FullText => Err(Error::Unimplemented("full-text indexes (MATCH/rank())")),
            IndexKind::Array => Err(Error::Unimplemented("array indexes")),
            IndexKind::Predictive => Err(Error::Unimplemented("predictive indexes")),
        }
    }

    fn create_value_index(&self, index_name: &str, expr_json: &str) -> Result<()> {
        if !is_safe_identifier(index_name) {
            return Err(Error::InvalidParameter(format!("invalid index name: {index_name}")));
        }
        let paths = parse_property_paths(expr_json)?;
        if paths.is_empty() {
            return Err(Error::InvalidParameter("index expression has no properties".into()));
        }
        for path in &paths {
            if !is_safe_property_path(path) {
                return Err(Error::InvalidParameter(format!("invalid property path: {path}")));
            }
        }
        let columns: Vec<String> = paths
            .iter()
            .map(|path| format!("json_extract(body, '$.{path}')"))
            .collect();
        let conn = self.handle.conn.lock();
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS {table}_idx_{index_name} ON {table} ({columns})",
                table = self.table(),
                columns = columns.join(", "),
            ),
            [],
        )?;
        Ok(())
    }

    /// Compiles a JSON query (§9's dynamic query AST: `SELECT`/`WHERE`/
    /// `ORDER BY`/`WHAT` as nested JSON arrays) into an executable
    /// [`Query`]. Server-side query planning is explicitly out of scope
    /// (§4.1's only query Non-goal); the JSON-to-SQL compiler needed even
    /// for the client-side cases is not, but is sizable enough that this
    /// binding reports it as an explicit unimplemented seam rather than
    /// guessing at a partial translation.
    pub fn compile_query(&self, _query_json: &str) -> Result<Query> {
        Err(Error::Unimplemented("JSON query compilation"))
    }

    /// Sequence-range enumeration: unique `(sequence)` index, `since`
    /// exclusive lower bound, ascending order.
    pub fn enumerate_by_sequence(&self, range: &SequenceRange) -> Result<Vec<Record>> {
        self.ensure_seq_index()?;
        let conn = self.handle.conn.lock();
        let limit = range.limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT key, meta, body, sequence, deleted FROM {} WHERE sequence > ?1 ORDER BY sequence ASC LIMIT ?2",
            self.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![range.since as i64, limit], row_to_record)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

/// Parses `exprJSON`'s simple-value-index shape: a JSON array of property
/// path strings.
fn parse_property_paths(expr_json: &str) -> Result<Vec<String>> {
    let parsed: serde_json::Value = serde_json::from_str(expr_json)
        .map_err(|e| Error::InvalidParameter(format!("invalid index expression JSON: {e}")))?;
    let array = parsed
        .as_array()
        .ok_or_else(|| Error::InvalidParameter("index expression must be a JSON array of property paths".into()))?;
    array
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| Error::InvalidParameter("index expression entries must be strings".into()))
        })
        .collect()
}

/// `CREATE INDEX` can't bind its column list or index name as query
/// parameters, so property paths and index names are validated against an
/// identifier charset instead of being interpolated as-is.
fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_safe_property_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|segment| !segment.is_empty() && segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<Record> {
    Ok(Record {
        key: row.get(0)?,
        meta: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
        body: row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
        sequence: row.get::<_, i64>(3)? as u64,
        deleted: row.get::<_, i64>(4)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(name: &str) -> (TempDir, RecordStore) {
        let dir = TempDir::new().unwrap();
        let handle = SqliteHandle::open(dir.path().join("db.sqlite3"), true, true).unwrap();
        let store = handle
            .key_store(name, KeyStoreCapabilities::default_store())
            .unwrap();
        (dir, store)
    }

    #[test]
    fn create_read_update_assigns_sequences() {
        let (_dir, store) = open_store("default");
        let (seq1, _) = store.set(b"a", b"", b"A").unwrap();
        assert_eq!(seq1, 1);
        let rec = store.get(b"a", ContentOptions::Default).unwrap().unwrap();
        assert_eq!(rec.body, b"A");
        assert_eq!(rec.sequence, 1);

        let (seq2, _) = store.set(b"a", b"", b"B").unwrap();
        assert_eq!(seq2, 2);
        let rec = store.get(b"a", ContentOptions::Default).unwrap().unwrap();
        assert_eq!(rec.body, b"B");
        assert_eq!(store.last_sequence().unwrap(), 2);
    }

    #[test]
    fn soft_delete_advances_sequence_and_sets_flag() {
        let (_dir, store) = open_store("default");
        store.set(b"a", b"", b"A").unwrap();
        let deleted = store.del_by_key(b"a").unwrap();
        assert!(deleted);
        assert_eq!(store.last_sequence().unwrap(), 2);
        let rec = store.get(b"a", ContentOptions::Default).unwrap().unwrap();
        assert!(rec.deleted);
        assert!(rec.body.is_empty());
    }

    #[test]
    fn range_enumeration_respects_inclusivity() {
        let (_dir, store) = open_store("default");
        for i in 1..=100u32 {
            let key = format!("rec-{:03}", i);
            store.set(key.as_bytes(), b"", b"x").unwrap();
        }

        let mut range = KeyRange::new();
        range.min = Some(b"rec-024".to_vec());
        range.max = Some(b"rec-029".to_vec());
        let inclusive = store.enumerate_by_key(&range).unwrap();
        assert_eq!(inclusive.len(), 6);

        range.min_inclusive = false;
        range.max_inclusive = false;
        let exclusive = store.enumerate_by_key(&range).unwrap();
        assert_eq!(exclusive.len(), 4);
        assert_eq!(exclusive[0].key, b"rec-025");
        assert_eq!(exclusive[3].key, b"rec-028");
    }

    #[test]
    fn enumeration_by_sequence_since_cursor() {
        let (_dir, store) = open_store("default");
        store.set(b"a", b"", b"A").unwrap();
        store.set(b"b", b"", b"B").unwrap();
        store.set(b"c", b"", b"C").unwrap();

        let recs = store
            .enumerate_by_sequence(&SequenceRange { since: 1, limit: None })
            .unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].key, b"b");
        assert_eq!(recs[1].key, b"c");
    }

    #[test]
    fn compact_purges_soft_deletes_and_counts_them() {
        let dir = TempDir::new().unwrap();
        let handle = SqliteHandle::open(dir.path().join("db.sqlite3"), true, true).unwrap();
        let store = handle.key_store("default", KeyStoreCapabilities::default_store()).unwrap();
        store.set(b"a", b"", b"A").unwrap();
        store.set(b"b", b"", b"B").unwrap();
        store.del_by_key(b"a").unwrap();

        assert_eq!(handle.purge_count().unwrap(), 0);
        handle.compact().unwrap();
        assert_eq!(handle.purge_count().unwrap(), 1);
        assert!(store.get(b"a", ContentOptions::Default).unwrap().is_none());
        assert!(store.get(b"b", ContentOptions::Default).unwrap().is_some());
    }

    #[test]
    fn compact_invokes_on_compact_callback_around_the_operation() {
        let dir = TempDir::new().unwrap();
        let handle = SqliteHandle::open(dir.path().join("db.sqlite3"), true, true).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        handle.set_on_compact(Some(Arc::new(move |starting| recorded.lock().push(starting))));
        handle.compact().unwrap();
        assert_eq!(*calls.lock(), vec![true, false]);
    }

    #[test]
    fn create_value_index_accepts_property_path_array() {
        let (_dir, store) = open_store("default");
        store.create_index("by_name", r#"["name"]"#, IndexKind::Value, None).unwrap();
        // Idempotent: creating it again doesn't error.
        store.create_index("by_name", r#"["name"]"#, IndexKind::Value, None).unwrap();
    }

    #[test]
    fn create_value_index_rejects_unsafe_property_path() {
        let (_dir, store) = open_store("default");
        let err = store
            .create_index("by_name", r#"["name'), (select 1); --"]"#, IndexKind::Value, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParameter(_)));
    }

    #[test]
    fn full_text_index_reports_unimplemented() {
        let (_dir, store) = open_store("default");
        let err = store
            .create_index("by_text", r#"["text"]"#, IndexKind::FullText, None)
            .unwrap_err();
        assert!(matches!(err, Error::Unimplemented(_)));
    }

    #[test]
    fn erase_resets_sequence() {
        let (_dir, store) = open_store("default");
        store.set(b"a", b"", b"A").unwrap();
        store.erase().unwrap();
        assert_eq!(store.record_count().unwrap(), 0);
        assert_eq!(store.last_sequence().unwrap(), 0);
    }
}
