//! Link graph storage.
//!
//! Links live in the fact database with `ON DELETE CASCADE` foreign keys on
//! both endpoints, so deleting a fact can never leave a dangling edge.

use rusqlite::{Connection, Row, params};
use tracing::debug;

use crate::error::{MemoryError, Result};
use crate::types::{FactId, LinkId, LinkType, MemoryLink};

use super::fact_ops::exists_on;
use super::{FactStore, conversion_err, ids_json, parse_ts, ts};

const LINK_COLUMNS: &str = "id, source_id, target_id, link_type, strength, created_at";

impl FactStore {
    /// Insert a link, or update the strength of an existing link with the
    /// same `(source, target, type)`.
    ///
    /// Fails with `NotFound` if either endpoint is missing.
    pub fn insert_link(&self, link: &MemoryLink) -> Result<MemoryLink> {
        self.with_transaction(|conn| insert_link_on(conn, link))
    }

    /// Every link touching `id`, in either direction.
    pub fn links_for(&self, id: FactId) -> Result<Vec<MemoryLink>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {LINK_COLUMNS} FROM links WHERE source_id = ?1 OR target_id = ?1 \
                 ORDER BY strength DESC, created_at"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let links = stmt
                .query_map(params![id.to_string()], row_to_link)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(links)
        })
    }

    /// Every link touching any fact in `ids`, in either direction.
    pub fn links_touching(&self, ids: &[FactId]) -> Result<Vec<MemoryLink>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read(|conn| {
            let sql = format!(
                "SELECT {LINK_COLUMNS} FROM links \
                 WHERE source_id IN (SELECT value FROM json_each(?1)) \
                    OR target_id IN (SELECT value FROM json_each(?1))"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let links = stmt
                .query_map(params![ids_json(ids)], row_to_link)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(links)
        })
    }

    /// Delete links from `source` to `target`, optionally of one type only.
    ///
    /// Returns the number of links removed.
    pub fn delete_links(
        &self,
        source: FactId,
        target: FactId,
        link_type: Option<LinkType>,
    ) -> Result<usize> {
        let removed = self.write(|conn| {
            Ok(conn.execute(
                "DELETE FROM links WHERE source_id = ?1 AND target_id = ?2 \
                 AND (?3 IS NULL OR link_type = ?3)",
                params![
                    source.to_string(),
                    target.to_string(),
                    link_type.map(|t| t.as_str())
                ],
            )?)
        })?;
        debug!(%source, %target, removed, "Deleted links");
        Ok(removed)
    }

    /// Point every edge touching `from` at `to` instead.
    ///
    /// Edges that would duplicate an existing edge of `to`, or that would
    /// become self-loops, are dropped. Returns the number of edges moved.
    pub fn relink(&self, from: &[FactId], to: FactId) -> Result<usize> {
        if from.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|conn| relink_on(conn, from, to))
    }

    pub fn link_count(&self) -> Result<usize> {
        self.read(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Number of links with a missing endpoint. Always zero while
    /// foreign keys are enforced.
    pub fn dangling_link_count(&self) -> Result<usize> {
        self.read(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM links l WHERE NOT EXISTS \
                 (SELECT 1 FROM facts f WHERE f.id = l.source_id) OR NOT EXISTS \
                 (SELECT 1 FROM facts f WHERE f.id = l.target_id)",
                [],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection-level helpers
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn insert_link_on(conn: &Connection, link: &MemoryLink) -> Result<MemoryLink> {
    for endpoint in [link.source_id, link.target_id] {
        if !exists_on(conn, endpoint)? {
            return Err(MemoryError::NotFound(format!("fact {}", endpoint)));
        }
    }

    let sql = format!(
        "INSERT INTO links ({LINK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(source_id, target_id, link_type) DO UPDATE SET strength = excluded.strength \
         RETURNING {LINK_COLUMNS}"
    );
    let stored = conn.query_row(
        &sql,
        params![
            link.id.to_string(),
            link.source_id.to_string(),
            link.target_id.to_string(),
            link.link_type.as_str(),
            link.strength as f64,
            ts(&link.created_at),
        ],
        row_to_link,
    )?;

    debug!(
        source = %stored.source_id,
        target = %stored.target_id,
        link_type = %stored.link_type,
        "Stored link"
    );
    Ok(stored)
}

pub(crate) fn relink_on(conn: &Connection, from: &[FactId], to: FactId) -> Result<usize> {
    let from_json = ids_json(from);
    let to = to.to_string();

    let mut moved = conn.execute(
        "UPDATE OR IGNORE links SET source_id = ?2 WHERE source_id IN (SELECT value FROM json_each(?1))",
        params![from_json, to],
    )?;
    moved += conn.execute(
        "UPDATE OR IGNORE links SET target_id = ?2 WHERE target_id IN (SELECT value FROM json_each(?1))",
        params![from_json, to],
    )?;

    // Self-loops and edges that collided with an existing edge of `to`
    conn.execute(
        "DELETE FROM links WHERE source_id = target_id \
         OR source_id IN (SELECT value FROM json_each(?1)) \
         OR target_id IN (SELECT value FROM json_each(?1))",
        params![from_json],
    )?;

    debug!(moved, "Relinked edges");
    Ok(moved)
}

fn row_to_link(row: &Row<'_>) -> rusqlite::Result<MemoryLink> {
    let id: String = row.get(0)?;
    let source: String = row.get(1)?;
    let target: String = row.get(2)?;
    let link_type: String = row.get(3)?;
    let created_at: String = row.get(5)?;

    Ok(MemoryLink {
        id: LinkId::parse(&id).map_err(|e| conversion_err(0, e))?,
        source_id: FactId::parse(&source).map_err(|e| conversion_err(1, e))?,
        target_id: FactId::parse(&target).map_err(|e| conversion_err(2, e))?,
        link_type: link_type.parse::<LinkType>().map_err(|e| conversion_err(3, e))?,
        strength: row.get::<_, f64>(4)? as f32,
        created_at: parse_ts(&created_at).map_err(|e| conversion_err(5, e))?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fact;

    fn store_with(n: usize) -> (FactStore, Vec<FactId>) {
        let store = FactStore::open_in_memory().unwrap();
        let ids = (0..n)
            .map(|i| {
                let fact = Fact::new(format!("fact {i}"));
                store.insert(&fact).unwrap();
                fact.id
            })
            .collect();
        (store, ids)
    }

    #[test]
    fn test_insert_link_requires_endpoints() {
        let (store, ids) = store_with(1);
        let link = MemoryLink::new(ids[0], FactId::new(), LinkType::CausedBy, 0.5);
        assert!(matches!(
            store.insert_link(&link),
            Err(MemoryError::NotFound(_))
        ));
        assert_eq!(store.link_count().unwrap(), 0);
    }

    #[test]
    fn test_insert_link_upserts_strength() {
        let (store, ids) = store_with(2);
        let first = store
            .insert_link(&MemoryLink::new(ids[0], ids[1], LinkType::PartOf, 0.3))
            .unwrap();
        let second = store
            .insert_link(&MemoryLink::new(ids[0], ids[1], LinkType::PartOf, 0.9))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!((second.strength - 0.9).abs() < 1e-6);
        assert_eq!(store.link_count().unwrap(), 1);

        // Different type is a different edge
        store
            .insert_link(&MemoryLink::new(ids[0], ids[1], LinkType::DependsOn, 0.5))
            .unwrap();
        assert_eq!(store.links_for(ids[1]).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_fact_cascades_links() {
        let (store, ids) = store_with(3);
        store
            .insert_link(&MemoryLink::new(ids[0], ids[1], LinkType::RelatedTo, 0.5))
            .unwrap();
        store
            .insert_link(&MemoryLink::new(ids[2], ids[0], LinkType::CausedBy, 0.5))
            .unwrap();

        store.delete(ids[0]).unwrap();
        assert_eq!(store.link_count().unwrap(), 0);
        assert_eq!(store.dangling_link_count().unwrap(), 0);
    }

    #[test]
    fn test_delete_links_by_type() {
        let (store, ids) = store_with(2);
        store
            .insert_link(&MemoryLink::new(ids[0], ids[1], LinkType::RelatedTo, 0.5))
            .unwrap();
        store
            .insert_link(&MemoryLink::new(ids[0], ids[1], LinkType::DependsOn, 0.5))
            .unwrap();

        assert_eq!(
            store
                .delete_links(ids[0], ids[1], Some(LinkType::RelatedTo))
                .unwrap(),
            1
        );
        assert_eq!(store.delete_links(ids[0], ids[1], None).unwrap(), 1);
        assert_eq!(store.link_count().unwrap(), 0);
    }

    #[test]
    fn test_relink_moves_edges_and_drops_loops() {
        let (store, ids) = store_with(4);
        let (a, b, merged, other) = (ids[0], ids[1], ids[2], ids[3]);
        store
            .insert_link(&MemoryLink::new(a, other, LinkType::CausedBy, 0.7))
            .unwrap();
        store
            .insert_link(&MemoryLink::new(other, b, LinkType::DependsOn, 0.4))
            .unwrap();
        store
            .insert_link(&MemoryLink::new(a, b, LinkType::RelatedTo, 0.9))
            .unwrap();

        store.relink(&[a, b], merged).unwrap();

        let links = store.links_for(merged).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.source_id != l.target_id));
        assert!(store.links_touching(&[a, b]).unwrap().is_empty());
    }
}
