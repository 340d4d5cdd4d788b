//! Fact CRUD, supersession and access tracking.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;

use crate::decay::TtlPolicy;
use crate::error::{MemoryError, Result};
use crate::types::{DecayClass, Fact, FactId, LinkType, MemoryLink, Scope};
use crate::validation::ValidationError;

use super::link_ops::{insert_link_on, relink_on};
use super::{FACT_COLUMNS, FactStore, ids_json, opt_ts, row_to_fact, ts};

/// True for facts whose TTL has run out, given the stable, active, session
/// and checkpoint cutoffs as `?1`..`?4`. Mirrors [`TtlPolicy::anchor`]:
/// refreshing classes count from their latest access, confirmation or
/// creation; the others from creation.
const EXPIRED: &str = "(\
    (f.decay_class = 'stable' AND MAX(f.created_at, \
        COALESCE(f.last_accessed_at, f.created_at), \
        COALESCE(f.last_confirmed_at, f.created_at)) <= ?1) \
    OR (f.decay_class = 'active' AND MAX(f.created_at, \
        COALESCE(f.last_accessed_at, f.created_at), \
        COALESCE(f.last_confirmed_at, f.created_at)) <= ?2) \
    OR (f.decay_class = 'session' AND f.created_at <= ?3) \
    OR (f.decay_class = 'checkpoint' AND f.created_at <= ?4))";

impl FactStore {
    /// Insert a new fact.
    ///
    /// Fails with [`MemoryError::DuplicateId`] if the id is already in use.
    ///
    /// The stored expiry is derived from the fact's class and timestamps;
    /// `fact.expires_at` is ignored.
    pub fn insert(&self, fact: &Fact) -> Result<()> {
        self.with_transaction(|conn| insert_on(conn, fact, &self.policy))
    }

    /// Get a fact by ID.
    pub fn get(&self, id: FactId) -> Result<Option<Fact>> {
        self.read(|conn| get_on(conn, id))
    }

    /// Get every fact in `ids` that exists. Order is unspecified.
    pub fn get_many(&self, ids: &[FactId]) -> Result<Vec<Fact>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.read(|conn| {
            let sql = format!(
                "SELECT {FACT_COLUMNS} FROM facts f \
                 WHERE f.id IN (SELECT value FROM json_each(?1))"
            );
            let mut stmt = conn.prepare(&sql)?;
            let facts = stmt
                .query_map(params![ids_json(ids)], row_to_fact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(facts)
        })
    }

    pub fn exists(&self, id: FactId) -> Result<bool> {
        self.read(|conn| exists_on(conn, id))
    }

    /// Replace every mutable column of an existing fact.
    pub fn update(&self, fact: &Fact) -> Result<()> {
        self.write(|conn| update_on(conn, fact, &self.policy))
    }

    /// Delete a fact. Links touching it are removed by cascade.
    ///
    /// Returns `false` if the fact did not exist.
    pub fn delete(&self, id: FactId) -> Result<bool> {
        let deleted = self.write(|conn| {
            Ok(conn.execute("DELETE FROM facts WHERE id = ?1", params![id.to_string()])?)
        })?;
        if deleted > 0 {
            debug!(id = %id, "Deleted fact");
        }
        Ok(deleted > 0)
    }

    /// Delete a batch of facts in one statement, returning the ids removed.
    pub fn delete_many(&self, ids: &[FactId]) -> Result<Vec<FactId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare(
                "DELETE FROM facts WHERE id IN (SELECT value FROM json_each(?1)) RETURNING id",
            )?;
            let deleted = stmt
                .query_map(params![ids_json(ids)], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            deleted.iter().map(|s| FactId::parse(s)).collect()
        })
    }

    /// Record a retrieval of every fact in `ids` with a single statement.
    ///
    /// Bumps `recall_count` and `last_accessed_at`. Stable and active facts
    /// also get a fresh expiry and full confidence.
    pub fn touch_access(&self, ids: &[FactId], now: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let stable_expiry = opt_ts(self.policy.expires_at(DecayClass::Stable, now).as_ref());
        let active_expiry = opt_ts(self.policy.expires_at(DecayClass::Active, now).as_ref());

        let touched = self.write(|conn| {
            Ok(conn.execute(
                r#"
                UPDATE facts SET
                    recall_count = recall_count + 1,
                    last_accessed_at = ?2,
                    expires_at = CASE decay_class
                        WHEN 'stable' THEN ?3
                        WHEN 'active' THEN ?4
                        ELSE expires_at END,
                    confidence = CASE
                        WHEN decay_class IN ('stable', 'active') THEN 1.0
                        ELSE confidence END
                WHERE id IN (SELECT value FROM json_each(?1))
                "#,
                params![ids_json(ids), ts(&now), stable_expiry, active_expiry],
            )?)
        })?;

        debug!(count = touched, "Touched facts");
        Ok(touched)
    }

    /// Mark `old_ids` superseded by `new_fact` and insert it, atomically.
    ///
    /// Records a `Supersedes` link from the new fact to each old one. Fails
    /// with `NotFound` if any old fact is missing.
    pub fn supersede(&self, old_ids: &[FactId], new_fact: &Fact, now: DateTime<Utc>) -> Result<()> {
        self.with_transaction(|conn| {
            check_supersedable(conn, old_ids)?;
            insert_on(conn, new_fact, &self.policy)?;
            supersede_on(conn, old_ids, new_fact.id, now)
        })?;

        debug!(new = %new_fact.id, old = old_ids.len(), "Superseded facts");
        Ok(())
    }

    /// Rewrite an existing fact and mark `old_ids` superseded by it, atomically.
    ///
    /// Used when an edit gives a fact the `(entity, key)` of another current
    /// fact.
    pub fn update_superseding(
        &self,
        fact: &Fact,
        old_ids: &[FactId],
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.with_transaction(|conn| {
            check_supersedable(conn, old_ids)?;
            update_on(conn, fact, &self.policy)?;
            supersede_on(conn, old_ids, fact.id, now)
        })?;

        debug!(id = %fact.id, old = old_ids.len(), "Updated fact superseding others");
        Ok(())
    }

    /// The current fact for `(entity, key)` in exactly `scope`, if any.
    pub fn find_current(&self, entity: &str, key: &str, scope: &Scope) -> Result<Option<Fact>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {FACT_COLUMNS} FROM facts f \
                 WHERE f.entity = ?1 AND f.key = ?2 \
                   AND f.scope_kind = ?3 AND f.scope_target IS ?4 \
                   AND f.superseded_by IS NULL \
                 ORDER BY f.effective_at DESC, f.seq DESC LIMIT 1"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            Ok(stmt
                .query_row(
                    params![entity.trim(), key.trim(), scope.kind(), scope.target()],
                    row_to_fact,
                )
                .optional()?)
        })
    }

    /// The current fact in `scope` whose text equals `text` ignoring case and
    /// surrounding whitespace.
    pub fn find_by_text(&self, text: &str, scope: &Scope) -> Result<Option<Fact>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {FACT_COLUMNS} FROM facts f \
                 WHERE lower(trim(f.text)) = lower(trim(?1)) \
                   AND f.scope_kind = ?2 AND f.scope_target IS ?3 \
                   AND f.superseded_by IS NULL \
                 ORDER BY f.seq DESC LIMIT 1"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            Ok(stmt
                .query_row(params![text, scope.kind(), scope.target()], row_to_fact)
                .optional()?)
        })
    }

    /// Confirm an existing fact: new `last_confirmed_at`, full confidence and,
    /// when given, a new expiry.
    pub fn reinforce(
        &self,
        id: FactId,
        now: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let updated = self.write(|conn| {
            Ok(conn.execute(
                "UPDATE facts SET last_confirmed_at = ?2, confidence = 1.0, \
                 expires_at = COALESCE(?3, expires_at) WHERE id = ?1",
                params![id.to_string(), ts(&now), opt_ts(expires_at.as_ref())],
            )?)
        })?;
        if updated == 0 {
            return Err(MemoryError::NotFound(format!("fact {}", id)));
        }
        Ok(())
    }

    /// Ids of facts whose TTL has run out by `now`, judged from their class
    /// and timestamps rather than the cached expiry.
    pub fn expired_ids(&self, now: DateTime<Utc>) -> Result<Vec<FactId>> {
        let cutoffs = self.cutoffs(now);
        self.read(|conn| {
            let sql = format!("SELECT f.id FROM facts f WHERE {EXPIRED}");
            let mut stmt = conn.prepare_cached(&sql)?;
            let ids = stmt
                .query_map(params_from_iter(cutoffs.iter()), |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids.iter().map(|s| FactId::parse(s)).collect()
        })
    }

    /// Facts that will expire but have not yet.
    pub fn list_expiring(&self, now: DateTime<Utc>) -> Result<Vec<Fact>> {
        let cutoffs = self.cutoffs(now);
        self.read(|conn| {
            let sql = format!(
                "SELECT {FACT_COLUMNS} FROM facts f \
                 WHERE f.decay_class != 'permanent' AND NOT {EXPIRED}"
            );
            let mut stmt = conn.prepare(&sql)?;
            let facts = stmt
                .query_map(params_from_iter(cutoffs.iter()), row_to_fact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(facts)
        })
    }

    /// Anchor cutoffs bound to [`EXPIRED`]. A class that never expires gets
    /// an empty string, which no timestamp sorts at or before.
    fn cutoffs(&self, now: DateTime<Utc>) -> [String; 4] {
        [
            DecayClass::Stable,
            DecayClass::Active,
            DecayClass::Session,
            DecayClass::Checkpoint,
        ]
        .map(|class| opt_ts(self.policy.cutoff(class, now).as_ref()).unwrap_or_default())
    }

    /// Write the derived expiry of every fact. Returns the rows updated.
    pub(crate) fn rederive_expiry(&self) -> Result<usize> {
        let policy = &self.policy;
        self.with_transaction(|conn| {
            let facts = {
                let sql = format!("SELECT {FACT_COLUMNS} FROM facts f");
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map([], row_to_fact)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let mut stmt = conn.prepare("UPDATE facts SET expires_at = ?2 WHERE id = ?1")?;
            let mut updated = 0;
            for fact in &facts {
                updated += stmt.execute(params![
                    fact.id.to_string(),
                    opt_ts(policy.expiry_for(fact).as_ref())
                ])?;
            }
            Ok(updated)
        })
    }

    /// Write new confidence values in one transaction.
    pub fn set_confidences(&self, updates: &[(FactId, f32)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        self.with_transaction(|conn| {
            let mut stmt = conn.prepare("UPDATE facts SET confidence = ?2 WHERE id = ?1")?;
            let mut changed = 0;
            for (id, confidence) in updates {
                changed += stmt.execute(params![id.to_string(), *confidence as f64])?;
            }
            Ok(changed)
        })
    }

    /// Facts with no stored vector, oldest first.
    pub fn list_without_embedding(&self, limit: usize) -> Result<Vec<Fact>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {FACT_COLUMNS} FROM facts f WHERE f.has_embedding = 0 \
                 ORDER BY f.seq LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let facts = stmt
                .query_map(params![limit as i64], row_to_fact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(facts)
        })
    }

    /// Every current fact, oldest first.
    pub fn list_current(&self) -> Result<Vec<Fact>> {
        self.read(|conn| {
            let sql = format!(
                "SELECT {FACT_COLUMNS} FROM facts f WHERE f.superseded_by IS NULL ORDER BY f.seq"
            );
            let mut stmt = conn.prepare(&sql)?;
            let facts = stmt
                .query_map([], row_to_fact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(facts)
        })
    }

    /// Ids of every fact, or only of those flagged as embedded.
    pub fn list_ids(&self, embedded_only: bool) -> Result<Vec<FactId>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM facts WHERE (?1 = 0 OR has_embedding = 1) ORDER BY seq",
            )?;
            let ids = stmt
                .query_map(params![embedded_only], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids.iter().map(|s| FactId::parse(s)).collect()
        })
    }

    /// Replace `members` with `merged` in one transaction: insert the merged
    /// fact, move the members' links onto it, then delete the members.
    ///
    /// Returns the number of links moved.
    pub fn merge_into(&self, members: &[FactId], merged: &Fact) -> Result<usize> {
        self.with_transaction(|conn| {
            insert_on(conn, merged, &self.policy)?;
            let moved = relink_on(conn, members, merged.id)?;
            // Older versions of a member now point at the merged fact
            conn.execute(
                "UPDATE facts SET superseded_by = ?2 \
                 WHERE superseded_by IN (SELECT value FROM json_each(?1))",
                params![ids_json(members), merged.id.to_string()],
            )?;
            conn.execute(
                "DELETE FROM facts WHERE id IN (SELECT value FROM json_each(?1))",
                params![ids_json(members)],
            )?;
            debug!(merged = %merged.id, members = members.len(), moved, "Merged facts");
            Ok(moved)
        })
    }

    /// Set or clear the embedding flag for a batch of facts.
    pub fn set_has_embedding(&self, ids: &[FactId], has_embedding: bool) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.write(|conn| {
            Ok(conn.execute(
                "UPDATE facts SET has_embedding = ?2 WHERE id IN (SELECT value FROM json_each(?1))",
                params![ids_json(ids), has_embedding],
            )?)
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection-level helpers (usable inside transactions)
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn exists_on(conn: &Connection, id: FactId) -> Result<bool> {
    let mut stmt = conn.prepare_cached("SELECT 1 FROM facts WHERE id = ?1")?;
    Ok(stmt.exists(params![id.to_string()])?)
}

pub(crate) fn get_on(conn: &Connection, id: FactId) -> Result<Option<Fact>> {
    let sql = format!("SELECT {FACT_COLUMNS} FROM facts f WHERE f.id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt
        .query_row(params![id.to_string()], row_to_fact)
        .optional()?)
}

/// Every old fact must exist and still be current.
fn check_supersedable(conn: &Connection, old_ids: &[FactId]) -> Result<()> {
    for old_id in old_ids {
        let old = get_on(conn, *old_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("fact {}", old_id)))?;
        if let Some(by) = old.superseded_by {
            return Err(ValidationError::AlreadySuperseded {
                id: old_id.to_string(),
                by: by.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn supersede_on(
    conn: &Connection,
    old_ids: &[FactId],
    new_id: FactId,
    now: DateTime<Utc>,
) -> Result<()> {
    for old_id in old_ids {
        conn.execute(
            "UPDATE facts SET superseded_by = ?2, superseded_at = ?3 WHERE id = ?1",
            params![old_id.to_string(), new_id.to_string(), ts(&now)],
        )?;
        let mut link = MemoryLink::new(new_id, *old_id, LinkType::Supersedes, 1.0);
        link.created_at = now;
        insert_link_on(conn, &link)?;
    }
    Ok(())
}

pub(crate) fn insert_on(conn: &Connection, fact: &Fact, policy: &TtlPolicy) -> Result<()> {
    if exists_on(conn, fact.id)? {
        return Err(MemoryError::DuplicateId(fact.id.to_string()));
    }

    let tags = serde_json::to_string(&fact.tags)?;
    conn.execute(
        r#"
        INSERT INTO facts (id, text, category, entity, key, value, importance, confidence,
                           decay_class, created_at, source_date, last_confirmed_at,
                           last_accessed_at, expires_at, recall_count, supersedes_id,
                           superseded_by, superseded_at, scope_kind, scope_target, tags,
                           summary, has_embedding)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                ?17, ?18, ?19, ?20, ?21, ?22, ?23)
        "#,
        params![
            fact.id.to_string(),
            fact.text,
            fact.category.as_str(),
            fact.entity,
            fact.key,
            fact.value,
            fact.importance as f64,
            fact.confidence as f64,
            fact.decay_class.as_str(),
            ts(&fact.created_at),
            opt_ts(fact.source_date.as_ref()),
            opt_ts(fact.last_confirmed_at.as_ref()),
            opt_ts(fact.last_accessed_at.as_ref()),
            opt_ts(policy.expiry_for(fact).as_ref()),
            fact.recall_count,
            fact.supersedes_id.map(|id| id.to_string()),
            fact.superseded_by.map(|id| id.to_string()),
            opt_ts(fact.superseded_at.as_ref()),
            fact.scope.kind(),
            fact.scope.target(),
            tags,
            fact.summary,
            fact.has_embedding,
        ],
    )?;

    debug!(id = %fact.id, "Inserted fact");
    Ok(())
}

pub(crate) fn update_on(conn: &Connection, fact: &Fact, policy: &TtlPolicy) -> Result<()> {
    let tags = serde_json::to_string(&fact.tags)?;
    let updated = conn.execute(
        r#"
        UPDATE facts SET
            text = ?2, category = ?3, entity = ?4, key = ?5, value = ?6,
            importance = ?7, confidence = ?8, decay_class = ?9, source_date = ?10,
            last_confirmed_at = ?11, last_accessed_at = ?12, expires_at = ?13,
            recall_count = ?14, supersedes_id = ?15, superseded_by = ?16,
            superseded_at = ?17, scope_kind = ?18, scope_target = ?19, tags = ?20,
            summary = ?21, has_embedding = ?22
        WHERE id = ?1
        "#,
        params![
            fact.id.to_string(),
            fact.text,
            fact.category.as_str(),
            fact.entity,
            fact.key,
            fact.value,
            fact.importance as f64,
            fact.confidence as f64,
            fact.decay_class.as_str(),
            opt_ts(fact.source_date.as_ref()),
            opt_ts(fact.last_confirmed_at.as_ref()),
            opt_ts(fact.last_accessed_at.as_ref()),
            opt_ts(policy.expiry_for(fact).as_ref()),
            fact.recall_count,
            fact.supersedes_id.map(|id| id.to_string()),
            fact.superseded_by.map(|id| id.to_string()),
            opt_ts(fact.superseded_at.as_ref()),
            fact.scope.kind(),
            fact.scope.target(),
            tags,
            fact.summary,
            fact.has_embedding,
        ],
    )?;

    if updated == 0 {
        return Err(MemoryError::NotFound(format!("fact {}", fact.id)));
    }
    debug!(id = %fact.id, "Updated fact");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Triple};
    use chrono::{Duration, SubsecRound};
    use memoria_config::DecayConfig;

    fn store() -> FactStore {
        FactStore::open_in_memory().unwrap()
    }

    fn policy() -> TtlPolicy {
        TtlPolicy::from_config(&DecayConfig::default())
    }

    #[test]
    fn test_insert_and_get_roundtrip() {
        let store = store();
        let fact = Fact::new("User prefers dark mode")
            .with_category(Category::Preference)
            .with_triple(Triple {
                entity: "user".into(),
                key: "prefer".into(),
                value: "dark mode".into(),
            })
            .with_scope(Scope::User("alice".into()))
            .with_tag("ui");
        store.insert(&fact).unwrap();

        let loaded = store.get(fact.id).unwrap().unwrap();
        assert_eq!(loaded.text, fact.text);
        assert_eq!(loaded.category, Category::Preference);
        assert_eq!(loaded.scope, fact.scope);
        assert_eq!(loaded.tags, vec!["ui".to_string()]);
        assert_eq!(loaded.entity.as_deref(), Some("user"));
        // Microsecond precision survives storage
        assert_eq!(loaded.created_at, fact.created_at.trunc_subsecs(6));
    }

    #[test]
    fn test_insert_duplicate_id() {
        let store = store();
        let fact = Fact::new("once");
        store.insert(&fact).unwrap();
        let err = store.insert(&fact).unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateId(_)));
    }

    #[test]
    fn test_get_missing() {
        assert!(store().get(FactId::new()).unwrap().is_none());
    }

    #[test]
    fn test_update_and_missing_update() {
        let store = store();
        let mut fact = Fact::new("draft");
        store.insert(&fact).unwrap();

        fact.text = "final".to_string();
        fact.importance = 0.9;
        store.update(&fact).unwrap();
        let loaded = store.get(fact.id).unwrap().unwrap();
        assert_eq!(loaded.text, "final");
        assert!((loaded.importance - 0.9).abs() < 1e-6);

        let ghost = Fact::new("ghost");
        assert!(matches!(
            store.update(&ghost),
            Err(MemoryError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_many() {
        let store = store();
        let a = Fact::new("a");
        let b = Fact::new("b");
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();

        let deleted = store.delete_many(&[a.id, b.id, FactId::new()]).unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(store.stats().unwrap().facts, 0);
        assert!(!store.delete(a.id).unwrap());
    }

    #[test]
    fn test_touch_access_batch() {
        let store = store();
        let policy = policy();
        let old = Utc::now() - Duration::days(80);
        let stable = Fact::new("stable").with_created_at(old);
        let session = Fact::new("session")
            .with_decay_class(DecayClass::Session)
            .with_created_at(Utc::now() - Duration::hours(22));
        store.insert(&stable).unwrap();
        store.insert(&session).unwrap();
        let session_before = store.get(session.id).unwrap().unwrap();
        assert_eq!(session_before.expires_at, policy.expiry_for(&session_before));

        let now = Utc::now();
        let touched = store.touch_access(&[stable.id, session.id], now).unwrap();
        assert_eq!(touched, 2);

        let stable_after = store.get(stable.id).unwrap().unwrap();
        assert_eq!(stable_after.recall_count, 1);
        assert!(stable_after.last_accessed_at.is_some());
        assert!(stable_after.expires_at.unwrap() > now + Duration::days(89));

        // Session TTL does not reset
        let session_after = store.get(session.id).unwrap().unwrap();
        assert_eq!(session_after.recall_count, 1);
        assert_eq!(session_after.expires_at, session_before.expires_at);
        assert!(!store.expired_ids(now).unwrap().contains(&session.id));
        assert!(store.expired_ids(now + Duration::hours(3)).unwrap().contains(&session.id));
    }

    #[test]
    fn test_supersede() {
        let store = store();
        let old = Fact::new("User prefers dark mode");
        store.insert(&old).unwrap();

        let mut new = Fact::new("User prefers light mode");
        new.supersedes_id = Some(old.id);
        let now = Utc::now();
        store.supersede(&[old.id], &new, now).unwrap();

        let old_after = store.get(old.id).unwrap().unwrap();
        assert_eq!(old_after.superseded_by, Some(new.id));
        assert!(old_after.superseded_at.is_some());
        assert_eq!(store.stats().unwrap().links, 1);
        assert_eq!(store.stats().unwrap().superseded, 1);

        // A superseded fact cannot be superseded again
        let third = Fact::new("User prefers sepia");
        assert!(store.supersede(&[old.id], &third, now).is_err());
        assert!(store.get(third.id).unwrap().is_none());
    }

    #[test]
    fn test_supersede_missing_is_not_found_and_atomic() {
        let store = store();
        let new = Fact::new("replacement");
        let err = store.supersede(&[FactId::new()], &new, Utc::now()).unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
        assert!(store.get(new.id).unwrap().is_none());
    }

    #[test]
    fn test_update_superseding() {
        let store = store();
        let triple = |value: &str| Triple {
            entity: "alice".into(),
            key: "editor".into(),
            value: value.into(),
        };
        let helix = Fact::new("Alice's editor is Helix").with_triple(triple("Helix"));
        let walks = Fact::new("Bob likes long walks");
        store.insert(&helix).unwrap();
        store.insert(&walks).unwrap();

        let mut vim = walks.clone().with_triple(triple("vim"));
        vim.supersedes_id = Some(helix.id);
        store.update_superseding(&vim, &[helix.id], Utc::now()).unwrap();

        let current = store.find_current("alice", "editor", &Scope::Global).unwrap().unwrap();
        assert_eq!(current.id, walks.id);
        assert_eq!(store.get(helix.id).unwrap().unwrap().superseded_by, Some(walks.id));
        assert_eq!(store.stats().unwrap().links, 1);

        // Already superseded: nothing is written
        let mut again = vim.clone();
        again.text = "Bob edits with vim".into();
        assert!(store.update_superseding(&again, &[helix.id], Utc::now()).is_err());
        assert_eq!(store.get(walks.id).unwrap().unwrap().text, walks.text);
    }

    #[test]
    fn test_find_current_case_insensitive() {
        let store = store();
        let fact = Fact::new("Alice's editor is Helix").with_triple(Triple {
            entity: "alice".into(),
            key: "editor".into(),
            value: "Helix".into(),
        });
        store.insert(&fact).unwrap();

        let found = store
            .find_current("Alice", "EDITOR", &Scope::Global)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, fact.id);
        assert!(
            store
                .find_current("alice", "editor", &Scope::User("alice".into()))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_find_by_text() {
        let store = store();
        let fact = Fact::new("Deploys happen on Fridays");
        store.insert(&fact).unwrap();
        let found = store
            .find_by_text("  deploys happen on fridays ", &Scope::Global)
            .unwrap();
        assert_eq!(found.map(|f| f.id), Some(fact.id));
    }

    #[test]
    fn test_expired_ids_and_embedding_flags() {
        let store = store();
        let expired = Fact::new("gone")
            .with_decay_class(DecayClass::Checkpoint)
            .with_created_at(Utc::now() - Duration::hours(5));
        let permanent = Fact::new("forever")
            .with_decay_class(DecayClass::Permanent)
            .with_created_at(Utc::now() - Duration::days(4000));
        store.insert(&expired).unwrap();
        store.insert(&permanent).unwrap();

        assert_eq!(store.expired_ids(Utc::now()).unwrap(), vec![expired.id]);
        assert!(store.list_expiring(Utc::now()).unwrap().is_empty());

        store.set_has_embedding(&[permanent.id], true).unwrap();
        assert_eq!(store.list_ids(true).unwrap(), vec![permanent.id]);
        assert_eq!(store.list_without_embedding(10).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_derives_expiry_for_session_fact() {
        let store = store();
        let created = Utc::now() - Duration::days(3);
        let session = Fact::new("Tracing the flaky login test")
            .with_decay_class(DecayClass::Session)
            .with_created_at(created);
        assert!(session.expires_at.is_none());
        store.insert(&session).unwrap();

        let stored = store.get(session.id).unwrap().unwrap();
        assert_eq!(
            stored.expires_at,
            Some((created + Duration::hours(24)).trunc_subsecs(6))
        );
        assert_eq!(store.expired_ids(Utc::now()).unwrap(), vec![session.id]);
    }

    #[test]
    fn test_confirmation_refreshes_stable_expiry() {
        let store = store();
        let fact = Fact::new("Deploys go through the staging cluster")
            .with_created_at(Utc::now() - Duration::days(100));
        store.insert(&fact).unwrap();
        let now = Utc::now();
        assert_eq!(store.expired_ids(now).unwrap(), vec![fact.id]);

        store.reinforce(fact.id, now, None).unwrap();
        assert!(store.expired_ids(now).unwrap().is_empty());
        assert_eq!(store.list_expiring(now).unwrap().len(), 1);
    }

    #[test]
    fn test_reinforce() {
        let store = store();
        let mut fact = Fact::new("confirmed");
        fact.confidence = 0.4;
        store.insert(&fact).unwrap();
        store.reinforce(fact.id, Utc::now(), None).unwrap();
        let after = store.get(fact.id).unwrap().unwrap();
        assert!(after.last_confirmed_at.is_some());
        assert_eq!(after.confidence, 1.0);
        assert!(store.reinforce(FactId::new(), Utc::now(), None).is_err());
    }

    #[test]
    fn test_merge_into_moves_links_and_removes_members() {
        let store = store();
        let a = Fact::new("likes tea");
        let b = Fact::new("Likes tea.");
        let other = Fact::new("drinks coffee at work");
        for f in [&a, &b, &other] {
            store.insert(f).unwrap();
        }
        store
            .insert_link(&MemoryLink::new(a.id, other.id, LinkType::RelatedTo, 0.7))
            .unwrap();
        store
            .insert_link(&MemoryLink::new(a.id, b.id, LinkType::RelatedTo, 0.9))
            .unwrap();

        let merged = Fact::new("likes tea");
        let moved = store.merge_into(&[a.id, b.id], &merged).unwrap();
        assert!(moved >= 1);

        assert!(!store.exists(a.id).unwrap());
        assert!(!store.exists(b.id).unwrap());
        let links = store.links_for(merged.id).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target_id, other.id);
        assert_eq!(store.dangling_link_count().unwrap(), 0);
    }
}
