//! Fact store implementation using SQLite.
//!
//! Provides durable storage for facts and the link graph, with an FTS5
//! full-text index kept in sync by triggers.
//!
//! # Connections
//!
//! One writer connection serializes every mutation. File-backed stores also
//! open a small pool of read-only connections so lookups and searches run
//! concurrently with each other; under SQLite WAL journaling they only wait
//! on the writer while a commit is being applied.
//!
//! # Operations
//!
//! - `fact_ops`: insert, get, update, supersede, delete, access tracking
//! - `link_ops`: typed edges with cascade delete and relinking
//! - `search`: exact-match lookup and BM25 full-text search
//! - `query`: filter and result types shared by the read paths

mod fact_ops;
mod link_ops;
pub mod query;
mod search;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OpenFlags, Row, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::decay::TtlPolicy;
use crate::error::{MemoryError, Result};
use crate::types::{Category, DecayClass, Fact, FactId, Scope};

pub use query::{FtsHit, LookupOrder, LookupQuery, ScopeFilter, SearchFilter, StoreStats};

// ─────────────────────────────────────────────────────────────────────────────
// Schema Version
// ─────────────────────────────────────────────────────────────────────────────

/// Current schema version for migrations.
pub const SCHEMA_VERSION: i32 = 2;

/// Meta key holding the fingerprint of the TTLs the expiry cache was
/// derived with.
const TTL_POLICY_KEY: &str = "decay.policy";

// ─────────────────────────────────────────────────────────────────────────────
// Fact Store
// ─────────────────────────────────────────────────────────────────────────────

/// Fact store backed by SQLite.
///
/// Holds facts, the FTS5 index over their text, the link graph, and a small
/// key/value `meta` table.
pub struct FactStore {
    /// The writer connection.
    conn: Mutex<Connection>,
    /// Read-only connections; empty for in-memory stores.
    readers: Vec<Mutex<Connection>>,
    next_reader: AtomicUsize,
    /// TTLs used to derive expiry.
    policy: TtlPolicy,
}

impl FactStore {
    /// Open or create a fact store at the given path.
    ///
    /// `read_connections` extra read-only connections are opened alongside
    /// the writer.
    pub fn open(path: impl AsRef<Path>, read_connections: usize) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        initialize(&conn)?;

        // Readers are opened after the schema exists.
        let mut readers = Vec::with_capacity(read_connections);
        for _ in 0..read_connections {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.pragma_update(None, "foreign_keys", "ON")?;
            readers.push(Mutex::new(reader));
        }

        info!(
            path = %path.display(),
            readers = readers.len(),
            "Fact store opened"
        );
        Ok(Self {
            conn: Mutex::new(conn),
            readers,
            next_reader: AtomicUsize::new(0),
            policy: TtlPolicy::default(),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        initialize(&conn)?;

        debug!("In-memory fact store created");
        Ok(Self {
            conn: Mutex::new(conn),
            readers: Vec::new(),
            next_reader: AtomicUsize::new(0),
            policy: TtlPolicy::default(),
        })
    }

    /// Derive expiry with `policy` instead of the default TTLs.
    ///
    /// When the TTLs differ from the ones the stored expiries were derived
    /// with, every fact's expiry is derived again.
    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Result<Self> {
        self.policy = policy;
        let fingerprint = self.policy.fingerprint();
        if self.get_meta(TTL_POLICY_KEY)?.as_deref() != Some(fingerprint.as_str()) {
            let updated = self.rederive_expiry()?;
            self.set_meta(TTL_POLICY_KEY, &fingerprint)?;
            info!(updated, ttl = %fingerprint, "Expiry re-derived for new TTLs");
        }
        Ok(self)
    }

    /// The TTLs expiry is derived with.
    pub fn ttl_policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Run a read-only closure on a reader connection, or on the writer when
    /// the store has no readers.
    pub(crate) fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            let conn = self.conn.lock();
            return f(&conn);
        }

        for reader in &self.readers {
            if let Some(conn) = reader.try_lock() {
                return f(&conn);
            }
        }

        let idx = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        let conn = self.readers[idx].lock();
        f(&conn)
    }

    /// Run a closure on the writer connection.
    pub(crate) fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function within a transaction on the writer.
    ///
    /// If the closure returns an error, all changes are rolled back.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        match f(&tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            // Dropping the transaction rolls it back
            Err(e) => Err(e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Schema
// ─────────────────────────────────────────────────────────────────────────────

fn initialize(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    migrate(conn)
}

fn migrate(conn: &Connection) -> Result<()> {
    let current: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if current > SCHEMA_VERSION {
        return Err(MemoryError::Migration(format!(
            "fact store schema version {} is newer than supported version {}",
            current, SCHEMA_VERSION
        )));
    }
    if current == SCHEMA_VERSION {
        debug!("Schema up to date (version {})", current);
        return Ok(());
    }

    info!(
        "Migrating fact store schema from version {} to {}",
        current, SCHEMA_VERSION
    );

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    info!("Schema ready (version {})", SCHEMA_VERSION);
    Ok(())
}

/// Migration v1: facts, full-text index, meta.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS facts (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            text TEXT NOT NULL,
            category TEXT NOT NULL,
            entity TEXT COLLATE NOCASE,
            key TEXT COLLATE NOCASE,
            value TEXT,
            importance REAL NOT NULL,
            confidence REAL NOT NULL DEFAULT 1.0,
            decay_class TEXT NOT NULL,
            created_at TEXT NOT NULL,
            source_date TEXT,
            last_confirmed_at TEXT,
            last_accessed_at TEXT,
            expires_at TEXT,
            recall_count INTEGER NOT NULL DEFAULT 0,
            supersedes_id TEXT,
            superseded_by TEXT,
            superseded_at TEXT,
            scope_kind TEXT NOT NULL DEFAULT 'global',
            scope_target TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            summary TEXT,
            has_embedding INTEGER NOT NULL DEFAULT 0,
            effective_at TEXT GENERATED ALWAYS AS (COALESCE(source_date, created_at)) VIRTUAL
        );

        CREATE INDEX IF NOT EXISTS idx_facts_entity_key ON facts(entity, key);
        CREATE INDEX IF NOT EXISTS idx_facts_expires_at ON facts(expires_at);
        CREATE INDEX IF NOT EXISTS idx_facts_superseded_by ON facts(superseded_by);
        CREATE INDEX IF NOT EXISTS idx_facts_effective_at ON facts(effective_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
            text,
            content='facts',
            content_rowid='seq',
            tokenize='porter unicode61'
        );

        CREATE TRIGGER IF NOT EXISTS facts_fts_insert AFTER INSERT ON facts BEGIN
            INSERT INTO facts_fts(rowid, text) VALUES (new.seq, new.text);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_fts_delete AFTER DELETE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, text) VALUES ('delete', old.seq, old.text);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_fts_update AFTER UPDATE OF text ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, text) VALUES ('delete', old.seq, old.text);
            INSERT INTO facts_fts(rowid, text) VALUES (new.seq, new.text);
        END;

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    info!("Migration v1 complete");
    Ok(())
}

/// Migration v2: the link graph.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
            target_id TEXT NOT NULL REFERENCES facts(id) ON DELETE CASCADE,
            link_type TEXT NOT NULL,
            strength REAL NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(source_id, target_id, link_type)
        );

        CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_id);
        CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_id);
        "#,
    )?;
    info!("Migration v2 complete");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Utility Operations
// ─────────────────────────────────────────────────────────────────────────────

impl FactStore {
    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached("SELECT value FROM meta WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
    }

    /// Set a metadata value.
    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.write(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Get database statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        self.read(|conn| {
            let (facts, current, embedded): (i64, i64, i64) = conn.query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(superseded_by IS NULL), 0),
                        COALESCE(SUM(has_embedding), 0)
                 FROM facts",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            let links: i64 = conn.query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))?;
            let schema_version: i32 =
                conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

            Ok(StoreStats {
                facts: facts as usize,
                current: current as usize,
                superseded: (facts - current) as usize,
                embedded: embedded as usize,
                links: links as usize,
                schema_version,
            })
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row Mapping
// ─────────────────────────────────────────────────────────────────────────────

/// Column list read by [`row_to_fact`], qualified with the alias `f`.
pub(crate) const FACT_COLUMNS: &str = "f.id, f.text, f.category, f.entity, f.key, f.value, \
     f.importance, f.confidence, f.decay_class, f.created_at, f.source_date, \
     f.last_confirmed_at, f.last_accessed_at, f.expires_at, f.recall_count, \
     f.supersedes_id, f.superseded_by, f.superseded_at, f.scope_kind, f.scope_target, \
     f.tags, f.summary, f.has_embedding";

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn opt_ts(at: Option<&DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

pub(crate) fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc))
}

pub(crate) fn conversion_err<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| conversion_err(idx, e))
}

fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_ts(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<FactId> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s)
        .map(FactId::from_uuid)
        .map_err(|e| conversion_err(idx, e))
}

fn opt_id_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<FactId>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        Uuid::parse_str(&s)
            .map(FactId::from_uuid)
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

/// Map a row selected with [`FACT_COLUMNS`] (starting at column 0).
pub(crate) fn row_to_fact(row: &Row<'_>) -> rusqlite::Result<Fact> {
    let category: String = row.get(2)?;
    let decay_class: String = row.get(8)?;
    let decay_class = decay_class.parse::<DecayClass>().map_err(|e| conversion_err(8, e))?;
    let scope_kind: String = row.get(18)?;
    let scope_target: Option<String> = row.get(19)?;
    let scope = Scope::from_parts(&scope_kind, scope_target).map_err(|e| conversion_err(18, e))?;
    let tags: String = row.get(20)?;
    let tags: Vec<String> = serde_json::from_str(&tags).map_err(|e| conversion_err(20, e))?;
    let recall_count: i64 = row.get(14)?;

    Ok(Fact {
        id: id_col(row, 0)?,
        text: row.get(1)?,
        category: Category::from(category),
        entity: row.get(3)?,
        key: row.get(4)?,
        value: row.get(5)?,
        importance: row.get::<_, f64>(6)? as f32,
        confidence: row.get::<_, f64>(7)? as f32,
        decay_class,
        created_at: ts_col(row, 9)?,
        source_date: opt_ts_col(row, 10)?,
        last_confirmed_at: opt_ts_col(row, 11)?,
        last_accessed_at: opt_ts_col(row, 12)?,
        expires_at: opt_ts_col(row, 13)?,
        recall_count: recall_count.max(0) as u32,
        supersedes_id: opt_id_col(row, 15)?,
        superseded_by: opt_id_col(row, 16)?,
        superseded_at: opt_ts_col(row, 17)?,
        scope,
        tags,
        summary: row.get(21)?,
        has_embedding: row.get(22)?,
    })
}

/// JSON array of ids, for `json_each` batch statements.
pub(crate) fn ids_json(ids: &[FactId]) -> String {
    let strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    // Serializing a Vec<String> cannot fail
    serde_json::to_string(&strings).unwrap_or_else(|_| "[]".to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_migrates() {
        let store = FactStore::open_in_memory().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.facts, 0);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn test_open_file_with_readers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("facts.sqlite");
        let store = FactStore::open(&path, 2).unwrap();
        assert!(path.exists());

        store.set_meta("wal.format", "ndjson").unwrap();
        assert_eq!(
            store.get_meta("wal.format").unwrap(),
            Some("ndjson".to_string())
        );
        assert_eq!(store.get_meta("missing").unwrap(), None);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.sqlite");
        {
            let store = FactStore::open(&path, 0).unwrap();
            store.insert(&Fact::new("persisted")).unwrap();
        }
        let store = FactStore::open(&path, 1).unwrap();
        assert_eq!(store.stats().unwrap().facts, 1);
    }

    #[test]
    fn test_ttl_change_rederives_expiry() {
        use memoria_config::DecayConfig;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.sqlite");
        let created = chrono::Utc::now() - chrono::Duration::days(10);
        let fact = Fact::new("User's shell is fish").with_created_at(created);
        {
            let store = FactStore::open(&path, 0)
                .unwrap()
                .with_ttl_policy(TtlPolicy::default())
                .unwrap();
            store.insert(&fact).unwrap();
            let stored = store.get(fact.id).unwrap().unwrap();
            assert!(stored.expires_at.unwrap() > chrono::Utc::now());
        }

        let shorter = TtlPolicy::from_config(&DecayConfig {
            stable_ttl_days: 5,
            ..DecayConfig::default()
        });
        let store = FactStore::open(&path, 0)
            .unwrap()
            .with_ttl_policy(shorter.clone())
            .unwrap();
        let stored = store.get(fact.id).unwrap().unwrap();
        assert_eq!(stored.expires_at, shorter.expiry_for(&stored));
        assert!(stored.expires_at.unwrap() < chrono::Utc::now());
        assert_eq!(
            store.get_meta(TTL_POLICY_KEY).unwrap(),
            Some(shorter.fingerprint())
        );
    }

    #[test]
    fn test_newer_schema_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facts.sqlite");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .unwrap();
        }
        let err = FactStore::open(&path, 0).err().unwrap();
        assert!(matches!(err, MemoryError::Migration(_)));
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = parse_ts("2024-01-01T00:00:00Z").unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(ts(&a).len(), ts(&b).len());
        assert_eq!(parse_ts(&ts(&b)).unwrap(), b);
    }
}
