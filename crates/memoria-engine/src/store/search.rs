//! Exact-match lookup and BM25 full-text search.

use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use tracing::debug;

use crate::error::Result;
use crate::types::{Fact, FactId};
use crate::validation::ValidationError;

use super::query::{FtsHit, LookupOrder, LookupQuery, ScopeFilter, SearchFilter};
use super::{FACT_COLUMNS, FactStore, row_to_fact, ts};

/// Accumulates `WHERE` predicates and their positional parameters.
#[derive(Default)]
struct Predicates {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Predicates {
    fn push(&mut self, clause: &str, values: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.to_string());
        self.params.extend(values);
    }

    fn scope(&mut self, filter: &ScopeFilter) {
        let mut clause = String::from("(f.scope_kind = 'global'");
        for (kind, target) in [
            ("user", &filter.user),
            ("agent", &filter.agent),
            ("session", &filter.session),
        ] {
            if let Some(target) = target {
                clause.push_str(&format!(
                    " OR (f.scope_kind = '{kind}' AND f.scope_target = ?)"
                ));
                self.params.push(Value::Text(target.clone()));
            }
        }
        clause.push(')');
        self.clauses.push(clause);
    }

    /// Supersession and point-in-time predicates.
    fn visibility(&mut self, as_of: Option<&DateTime<Utc>>, include_superseded: bool) {
        match as_of {
            Some(at) => {
                let at = ts(at);
                self.push("f.effective_at <= ?", [Value::Text(at.clone())]);
                if !include_superseded {
                    self.push(
                        "(f.superseded_at IS NULL OR f.superseded_at > ?)",
                        [Value::Text(at)],
                    );
                }
            }
            None => {
                if !include_superseded {
                    self.push("f.superseded_by IS NULL", std::iter::empty());
                }
            }
        }
    }

    fn tag(&mut self, tag: &str) {
        self.push(
            "EXISTS (SELECT 1 FROM json_each(f.tags) WHERE json_each.value = ?)",
            [Value::Text(tag.to_string())],
        );
    }

    fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" AND {}", self.clauses.join(" AND "))
        }
    }
}

/// Turn free text into an FTS5 query: each word quoted, joined with `OR`.
///
/// Quoting neutralizes FTS5 operators and column filters in user input.
pub(crate) fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

impl FactStore {
    /// Exact-match query on entity, key and tag.
    ///
    /// Superseded facts are hidden unless `include_superseded` is set. With
    /// `as_of`, only facts whose effective date is at or before that instant
    /// are returned, and "superseded" is judged at that instant.
    pub fn lookup(&self, query: &LookupQuery) -> Result<Vec<Fact>> {
        let mut preds = Predicates::default();
        if let Some(entity) = &query.entity {
            preds.push("f.entity = ?", [Value::Text(entity.trim().to_string())]);
        }
        if let Some(key) = &query.key {
            preds.push("f.key = ?", [Value::Text(key.trim().to_string())]);
        }
        if let Some(tag) = &query.tag {
            preds.tag(tag);
        }
        if let Some(scope) = &query.scope {
            preds.scope(scope);
        }
        preds.visibility(query.as_of.as_ref(), query.include_superseded);

        let order = match query.order {
            LookupOrder::Relevance => {
                "(f.importance * f.confidence) DESC, f.effective_at DESC, f.seq DESC"
            }
            LookupOrder::EffectiveDateAsc => "f.effective_at ASC, f.seq ASC",
            LookupOrder::EffectiveDateDesc => "f.effective_at DESC, f.seq DESC",
        };
        let limit = query.limit.map(|l| l as i64).unwrap_or(-1);

        let sql = format!(
            "SELECT {FACT_COLUMNS} FROM facts f WHERE 1 = 1{} ORDER BY {order} LIMIT {limit}",
            preds.where_sql()
        );

        let facts = self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let facts = stmt
                .query_map(params_from_iter(preds.params.iter()), row_to_fact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(facts)
        })?;

        debug!(count = facts.len(), "Lookup complete");
        Ok(facts)
    }

    /// BM25-ranked full-text search over fact text.
    ///
    /// With `filter = None` the raw ranking is returned (superseded and
    /// out-of-scope facts included) so callers can filter after merging.
    pub fn search_text(
        &self,
        query: &str,
        filter: Option<&SearchFilter>,
        limit: usize,
    ) -> Result<Vec<FtsHit>> {
        let fts = fts_query(query).ok_or(ValidationError::EmptyQuery)?;

        let mut preds = Predicates::default();
        if let Some(filter) = filter {
            if let Some(scope) = &filter.scope {
                preds.scope(scope);
            }
            preds.visibility(filter.as_of.as_ref(), filter.include_superseded);
            if let Some(category) = &filter.category {
                preds.push("f.category = ?", [Value::Text(category.to_ascii_lowercase())]);
            }
            if let Some(tag) = &filter.tag {
                preds.tag(tag);
            }
        }

        let sql = format!(
            "SELECT f.id, f.text, bm25(facts_fts) AS bm25_score, f.superseded_by IS NOT NULL \
             FROM facts_fts JOIN facts f ON f.seq = facts_fts.rowid \
             WHERE facts_fts MATCH ?{} ORDER BY bm25_score, f.seq DESC LIMIT {}",
            preds.where_sql(),
            limit as i64
        );

        let mut params = Vec::with_capacity(preds.params.len() + 1);
        params.push(Value::Text(fts));
        params.extend(preds.params);

        let rows = self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        // bm25() is lower-is-better; flip it so callers see higher-is-better.
        let hits = rows
            .into_iter()
            .map(|(id, text, rank, superseded)| {
                Ok(FtsHit {
                    id: FactId::parse(&id)?,
                    text,
                    score: -rank,
                    superseded,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(query, count = hits.len(), "Full-text search complete");
        Ok(hits)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::types::{Category, Scope, Triple};
    use chrono::Duration;

    fn triple(entity: &str, key: &str, value: &str) -> Triple {
        Triple {
            entity: entity.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    fn seeded() -> (FactStore, Fact, Fact) {
        let store = FactStore::open_in_memory().unwrap();
        let t0 = Utc::now() - Duration::days(2);
        let dark = Fact::new("User prefers dark mode")
            .with_category(Category::Preference)
            .with_importance(0.6)
            .with_triple(triple("user", "prefer", "dark mode"))
            .with_created_at(t0);
        store.insert(&dark).unwrap();

        let mut light = Fact::new("User prefers light mode")
            .with_category(Category::Preference)
            .with_importance(0.6)
            .with_triple(triple("user", "prefer", "light mode"));
        light.supersedes_id = Some(dark.id);
        store
            .supersede(&[dark.id], &light, t0 + Duration::days(1))
            .unwrap();
        (store, dark, light)
    }

    #[test]
    fn test_fts_query_sanitizes() {
        assert_eq!(fts_query("mode"), Some("\"mode\"".to_string()));
        assert_eq!(
            fts_query("dark OR text:\"x\"*"),
            Some("\"dark\" OR \"or\" OR \"text\" OR \"x\"".to_string())
        );
        assert_eq!(fts_query("  ?! "), None);
    }

    #[test]
    fn test_lookup_hides_superseded_by_default() {
        let (store, _dark, light) = seeded();
        let facts = store
            .lookup(&LookupQuery::entity("user").with_key("prefer"))
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, light.id);
    }

    #[test]
    fn test_lookup_include_superseded_orders() {
        let (store, dark, light) = seeded();
        let query = LookupQuery::entity("USER")
            .with_key("prefer")
            .include_superseded(true);

        let default_order = store.lookup(&query).unwrap();
        assert_eq!(
            default_order.iter().map(|f| f.id).collect::<Vec<_>>(),
            vec![light.id, dark.id]
        );

        let ascending = store
            .lookup(&query.clone().order(LookupOrder::EffectiveDateAsc))
            .unwrap();
        assert_eq!(
            ascending.iter().map(|f| f.id).collect::<Vec<_>>(),
            vec![dark.id, light.id]
        );
    }

    #[test]
    fn test_lookup_as_of_before_supersession() {
        let (store, dark, _light) = seeded();
        let before = dark.created_at + Duration::hours(12);

        let facts = store
            .lookup(
                &LookupQuery::entity("user")
                    .with_key("prefer")
                    .include_superseded(true)
                    .as_of(before),
            )
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, dark.id);

        // Without include_superseded the fact current at that instant is returned
        let facts = store
            .lookup(&LookupQuery::entity("user").with_key("prefer").as_of(before))
            .unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, dark.id);
    }

    #[test]
    fn test_lookup_scope_and_tag() {
        let store = FactStore::open_in_memory().unwrap();
        let global = Fact::new("Team uses Rust")
            .with_triple(triple("team", "language", "rust"))
            .with_tag("lang");
        let alice = Fact::new("Alice uses Go")
            .with_triple(triple("team", "language", "go"))
            .with_scope(Scope::User("alice".into()));
        store.insert(&global).unwrap();
        store.insert(&alice).unwrap();

        let bob = store
            .lookup(&LookupQuery::entity("team").with_scope(ScopeFilter::default().with_user("bob")))
            .unwrap();
        assert_eq!(bob.len(), 1);

        let alice_view = store
            .lookup(
                &LookupQuery::entity("team").with_scope(ScopeFilter::default().with_user("alice")),
            )
            .unwrap();
        assert_eq!(alice_view.len(), 2);

        let unscoped = store.lookup(&LookupQuery::entity("team")).unwrap();
        assert_eq!(unscoped.len(), 2);

        let tagged = store
            .lookup(&LookupQuery::default().with_tag("lang"))
            .unwrap();
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].id, global.id);
    }

    #[test]
    fn test_search_text_ranks_and_filters() {
        let (store, dark, light) = seeded();
        store
            .insert(&Fact::new("Deploys happen on Fridays"))
            .unwrap();

        let raw = store.search_text("mode", None, 10).unwrap();
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().any(|h| h.id == dark.id && h.superseded));

        let filtered = store
            .search_text("mode", Some(&SearchFilter::default()), 10)
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, light.id);
        assert!(!filtered[0].superseded);
    }

    #[test]
    fn test_search_text_bm25_prefers_denser_match() {
        let store = FactStore::open_in_memory().unwrap();
        let dense = Fact::new("rust rust rust");
        let sparse = Fact::new("rust is one of many languages used by the platform team");
        store.insert(&sparse).unwrap();
        store.insert(&dense).unwrap();

        let hits = store.search_text("rust", None, 10).unwrap();
        assert_eq!(hits[0].id, dense.id);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_search_text_empty_query() {
        let store = FactStore::open_in_memory().unwrap();
        let err = store.search_text("***", None, 10).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Validation(ValidationError::EmptyQuery)
        ));
    }

    #[test]
    fn test_fts_tracks_text_updates() {
        let store = FactStore::open_in_memory().unwrap();
        let mut fact = Fact::new("original wording");
        store.insert(&fact).unwrap();
        fact.text = "rewritten sentence".to_string();
        store.update(&fact).unwrap();

        assert!(store.search_text("original", None, 10).unwrap().is_empty());
        assert_eq!(store.search_text("rewritten", None, 10).unwrap().len(), 1);

        store.delete(fact.id).unwrap();
        assert!(store.search_text("rewritten", None, 10).unwrap().is_empty());
    }
}
