//! Vector storage and similarity search.
//!
//! [`VectorIndex`] is the seam between the engine and its nearest-neighbour
//! backend. The default backend, [`SqliteVecIndex`], keeps one sqlite-vec
//! `vec0` table with cosine distance in its own database file, so a damaged
//! index never takes the fact store down with it.
//!
//! Every backend failure is reported as [`MemoryError::VectorBackend`]; the
//! engine degrades reads around it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};
use zerocopy::IntoBytes;

use crate::error::{MemoryError, Result};
use crate::types::FactId;
use crate::validation::validate_embedding;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// File name of the index database inside the vector directory.
pub const INDEX_FILE: &str = "index.sqlite";

/// Schema version of the index database.
const INDEX_SCHEMA_VERSION: i32 = 1;

/// Largest `k` sqlite-vec accepts for a KNN query.
const MAX_KNN: usize = 4096;

// ─────────────────────────────────────────────────────────────────────────────
// Trait
// ─────────────────────────────────────────────────────────────────────────────

/// A stored vector's similarity to a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityHit {
    pub fact_id: FactId,
    /// Cosine similarity in `-1.0..=1.0`; higher is closer.
    pub similarity: f32,
}

/// Nearest-neighbour index over fact embeddings, keyed by fact id.
pub trait VectorIndex: Send + Sync {
    /// The one dimension every stored vector has.
    fn dimensions(&self) -> usize;

    /// Store or replace the vector for `id`.
    ///
    /// Fails with a dimension-mismatch validation error if the vector has the
    /// wrong length.
    fn store(&self, id: FactId, vector: &[f32]) -> Result<()>;

    /// Up to `limit` nearest vectors, most similar first, optionally
    /// dropping those below `min_score`.
    fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<SimilarityHit>>;

    /// Whether any stored vector is at least `threshold` similar.
    fn has_duplicate(&self, vector: &[f32], threshold: f32) -> Result<bool> {
        Ok(!self.search(vector, 1, Some(threshold))?.is_empty())
    }

    fn get(&self, id: FactId) -> Result<Option<Vec<f32>>>;

    /// Returns `false` if there was no vector for `id`.
    fn delete(&self, id: FactId) -> Result<bool>;

    /// Every id with a stored vector.
    fn ids(&self) -> Result<Vec<FactId>>;

    fn count(&self) -> Result<usize>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Extension
// ─────────────────────────────────────────────────────────────────────────────

static VEC_EXTENSION: Once = Once::new();

/// Register sqlite-vec for every connection opened afterwards in this
/// process.
pub fn init_vector_extension() {
    use rusqlite::ffi::sqlite3_auto_extension;
    use sqlite_vec::sqlite3_vec_init;

    VEC_EXTENSION.call_once(|| unsafe {
        #[allow(clippy::missing_transmute_annotations)]
        sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
    });
}

// ─────────────────────────────────────────────────────────────────────────────
// sqlite-vec index
// ─────────────────────────────────────────────────────────────────────────────

/// Vector index backed by a sqlite-vec `vec0` table using cosine distance.
pub struct SqliteVecIndex {
    conn: Mutex<Connection>,
    dimensions: usize,
    path: Option<PathBuf>,
}

impl SqliteVecIndex {
    /// Open or create the index in `dir` for `dimensions`-wide vectors.
    ///
    /// Fails if an existing index was built for a different dimension; use
    /// [`SqliteVecIndex::recreate`] to rebuild it.
    pub fn open(dir: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(MemoryError::vector)?;
        let path = dir.join(INDEX_FILE);

        init_vector_extension();
        let conn = Connection::open(&path).map_err(MemoryError::vector)?;
        let index = Self {
            conn: Mutex::new(conn),
            dimensions,
            path: Some(path),
        };
        index.initialize()?;

        info!(
            path = %dir.display(),
            dimensions,
            "Vector index opened"
        );
        Ok(index)
    }

    /// Create an in-memory index (useful for testing).
    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        init_vector_extension();
        let conn = Connection::open_in_memory().map_err(MemoryError::vector)?;
        let index = Self {
            conn: Mutex::new(conn),
            dimensions,
            path: None,
        };
        index.initialize()?;
        Ok(index)
    }

    /// Delete any index in `dir` and create an empty one.
    pub fn recreate(dir: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let dir = dir.as_ref();
        for suffix in ["", "-wal", "-shm"] {
            let file = dir.join(format!("{INDEX_FILE}{suffix}"));
            if file.exists() {
                fs::remove_file(&file).map_err(MemoryError::vector)?;
            }
        }
        warn!(path = %dir.display(), dimensions, "Vector index recreated");
        Self::open(dir, dimensions)
    }

    /// Location of the index database, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();
        let setup = || -> rusqlite::Result<Option<String>> {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
            )?;
            conn.query_row(
                "SELECT value FROM meta WHERE key = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()
        };
        let stored = setup().map_err(MemoryError::vector)?;

        match stored.as_deref().map(str::parse::<usize>) {
            Some(Ok(dims)) if dims != self.dimensions => {
                return Err(MemoryError::VectorBackend(format!(
                    "index was built for {} dimensions but {} are configured; rebuild the index",
                    dims, self.dimensions
                )));
            }
            Some(Err(_)) => {
                return Err(MemoryError::VectorBackend(
                    "index metadata is corrupt; rebuild the index".to_string(),
                ));
            }
            _ => {}
        }

        let dims = self.dimensions;
        let create = || -> rusqlite::Result<()> {
            conn.execute_batch(&format!(
                r#"
                CREATE VIRTUAL TABLE IF NOT EXISTS fact_vectors USING vec0(
                    fact_id TEXT PRIMARY KEY,
                    embedding float[{dims}] distance_metric=cosine
                );
                "#
            ))?;
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('dimensions', ?1)",
                params![dims.to_string()],
            )?;
            conn.pragma_update(None, "user_version", INDEX_SCHEMA_VERSION)?;
            Ok(())
        };
        create().map_err(MemoryError::vector)?;
        Ok(())
    }

    fn check_dims(&self, vector: &[f32]) -> Result<()> {
        validate_embedding(vector, self.dimensions)?;
        Ok(())
    }
}

impl VectorIndex for SqliteVecIndex {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn store(&self, id: FactId, vector: &[f32]) -> Result<()> {
        self.check_dims(vector)?;
        let conn = self.conn.lock();
        // vec0 has no upsert
        conn.execute(
            "DELETE FROM fact_vectors WHERE fact_id = ?1",
            params![id.to_string()],
        )
        .map_err(MemoryError::vector)?;
        conn.execute(
            "INSERT INTO fact_vectors (fact_id, embedding) VALUES (?1, ?2)",
            params![id.to_string(), vector.as_bytes()],
        )
        .map_err(MemoryError::vector)?;

        debug!(id = %id, "Stored vector");
        Ok(())
    }

    fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: Option<f32>,
    ) -> Result<Vec<SimilarityHit>> {
        self.check_dims(vector)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let k = limit.min(MAX_KNN) as i64;

        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                r#"
                SELECT fact_id, distance
                FROM fact_vectors
                WHERE embedding MATCH ?1 AND k = ?2
                ORDER BY distance
                "#,
            )
            .map_err(MemoryError::vector)?;
        let rows = stmt
            .query_map(params![vector.as_bytes(), k], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(MemoryError::vector)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(MemoryError::vector)?;

        let mut hits = Vec::with_capacity(rows.len());
        for (id, distance) in rows {
            let similarity = (1.0 - distance) as f32;
            if min_score.is_some_and(|min| similarity < min) {
                continue;
            }
            hits.push(SimilarityHit {
                fact_id: FactId::parse(&id)?,
                similarity,
            });
        }

        debug!(count = hits.len(), limit, "Vector search complete");
        Ok(hits)
    }

    fn get(&self, id: FactId) -> Result<Option<Vec<f32>>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM fact_vectors WHERE fact_id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(MemoryError::vector)?;

        blob.map(|bytes| decode_vector(id, &bytes)).transpose()
    }

    fn delete(&self, id: FactId) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "DELETE FROM fact_vectors WHERE fact_id = ?1",
                params![id.to_string()],
            )
            .map_err(MemoryError::vector)?;
        Ok(rows > 0)
    }

    fn ids(&self) -> Result<Vec<FactId>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT fact_id FROM fact_vectors")
            .map_err(MemoryError::vector)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(MemoryError::vector)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(MemoryError::vector)?;
        ids.iter().map(|s| FactId::parse(s)).collect()
    }

    fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fact_vectors", [], |row| row.get(0))
            .map_err(MemoryError::vector)?;
        Ok(count as usize)
    }
}

/// Decode a stored embedding blob; the inverse of `as_bytes` in `store`.
fn decode_vector(id: FactId, bytes: &[u8]) -> Result<Vec<f32>> {
    let width = size_of::<f32>();
    if bytes.len() % width != 0 {
        return Err(MemoryError::VectorBackend(format!(
            "embedding for {id} is {} bytes, not a whole number of f32s",
            bytes.len()
        )));
    }
    let mut vector = vec![0f32; bytes.len() / width];
    vector.as_mut_bytes().copy_from_slice(bytes);
    Ok(vector)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationError;

    fn index() -> SqliteVecIndex {
        SqliteVecIndex::open_in_memory(4).unwrap()
    }

    #[test]
    fn test_decode_rejects_torn_blob() {
        let id = FactId::new();
        let bytes = [0.5f32, -1.0].as_bytes().to_vec();
        assert_eq!(decode_vector(id, &bytes).unwrap(), vec![0.5, -1.0]);
        assert!(matches!(
            decode_vector(id, &bytes[..7]),
            Err(MemoryError::VectorBackend(_))
        ));
    }

    #[test]
    fn test_store_get_delete() {
        let index = index();
        let id = FactId::new();
        index.store(id, &[0.1, 0.2, 0.3, 0.4]).unwrap();

        assert_eq!(index.count().unwrap(), 1);
        assert_eq!(index.get(id).unwrap(), Some(vec![0.1, 0.2, 0.3, 0.4]));
        assert_eq!(index.ids().unwrap(), vec![id]);

        // Replacing keeps one row
        index.store(id, &[0.4, 0.3, 0.2, 0.1]).unwrap();
        assert_eq!(index.count().unwrap(), 1);

        assert!(index.delete(id).unwrap());
        assert!(!index.delete(id).unwrap());
        assert_eq!(index.get(id).unwrap(), None);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = index();
        let err = index.store(FactId::new(), &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Validation(ValidationError::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        ));
        assert!(index.search(&[1.0; 5], 3, None).is_err());
    }

    #[test]
    fn test_cosine_search_order() {
        let index = index();
        let id1 = FactId::new();
        let id2 = FactId::new();
        let id3 = FactId::new();
        index.store(id1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.store(id2, &[0.9, 0.1, 0.0, 0.0]).unwrap();
        index.store(id3, &[0.0, 0.0, 1.0, 0.0]).unwrap();

        let hits = index.search(&[2.0, 0.0, 0.0, 0.0], 10, None).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].fact_id, id1);
        // Cosine ignores magnitude
        assert!((hits[0].similarity - 1.0).abs() < 1e-4);
        assert_eq!(hits[1].fact_id, id2);
        assert_eq!(hits[2].fact_id, id3);
        assert!(hits[2].similarity.abs() < 1e-4);

        let close = index.search(&[1.0, 0.0, 0.0, 0.0], 10, Some(0.5)).unwrap();
        assert_eq!(close.len(), 2);
    }

    #[test]
    fn test_has_duplicate() {
        let index = index();
        index.store(FactId::new(), &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(index.has_duplicate(&[1.0, 0.01, 0.0, 0.0], 0.99).unwrap());
        assert!(!index.has_duplicate(&[0.0, 1.0, 0.0, 0.0], 0.5).unwrap());
    }

    #[test]
    fn test_reopen_with_other_dimensions_fails() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = SqliteVecIndex::open(dir.path(), 4).unwrap();
            index.store(FactId::new(), &[1.0, 0.0, 0.0, 0.0]).unwrap();
        }
        let err = SqliteVecIndex::open(dir.path(), 8).err().unwrap();
        assert!(matches!(err, MemoryError::VectorBackend(_)));

        let rebuilt = SqliteVecIndex::recreate(dir.path(), 8).unwrap();
        assert_eq!(rebuilt.dimensions(), 8);
        assert_eq!(rebuilt.count().unwrap(), 0);
    }

    #[test]
    fn test_reopen_keeps_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let id = FactId::new();
        {
            let index = SqliteVecIndex::open(dir.path(), 4).unwrap();
            index.store(id, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        }
        let index = SqliteVecIndex::open(dir.path(), 4).unwrap();
        assert_eq!(index.ids().unwrap(), vec![id]);
    }
}
