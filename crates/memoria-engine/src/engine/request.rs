//! Request and result types for the engine's public operations.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fusion::HitSource;
use crate::store::{SearchFilter, StoreStats};
use crate::types::{Category, DecayClass, Fact, FactId, Scope, Triple};

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Input to [`MemoryEngine::store`](super::MemoryEngine::store).
///
/// Only `text` is required. Anything left unset is inferred by the
/// classifier (category, decay class, triple) or taken from the category
/// defaults (importance).
#[derive(Debug, Clone, Default)]
pub struct StoreRequest {
    pub text: String,
    pub category: Option<Category>,
    pub entity: Option<String>,
    pub key: Option<String>,
    /// Defaults to the fact text when `entity` and `key` are given.
    pub value: Option<String>,
    pub importance: Option<f32>,
    pub decay_class: Option<DecayClass>,
    pub scope: Scope,
    pub tags: Vec<String>,
    pub summary: Option<String>,
    pub source_date: Option<DateTime<Utc>>,
    /// Facts this one explicitly replaces.
    pub supersedes: Vec<FactId>,
    /// Caller-assigned id; a fresh one otherwise.
    pub id: Option<FactId>,
}

impl StoreRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_triple(
        mut self,
        entity: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.entity = Some(entity.into());
        self.key = Some(key.into());
        self.value = Some(value.into());
        self
    }

    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn with_decay_class(mut self, class: DecayClass) -> Self {
        self.decay_class = Some(class);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_source_date(mut self, date: DateTime<Utc>) -> Self {
        self.source_date = Some(date);
        self
    }

    pub fn supersedes(mut self, id: FactId) -> Self {
        self.supersedes.push(id);
        self
    }

    pub fn with_id(mut self, id: FactId) -> Self {
        self.id = Some(id);
        self
    }

    /// The caller-supplied triple, if `entity` and `key` are both set.
    pub(crate) fn explicit_triple(&self) -> Option<Triple> {
        let entity = self.entity.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let key = self.key.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let value = self
            .value
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.text.trim());
        Some(Triple {
            entity: entity.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// What a store call did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StoreAction {
    /// A new fact was written.
    Created,
    /// A new fact was written and replaced these.
    Superseded { previous: Vec<FactId> },
    /// An equivalent current fact already existed and was confirmed instead.
    Reinforced,
}

/// Result of a store call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOutcome {
    /// The new fact, or the existing one for [`StoreAction::Reinforced`].
    pub fact: Fact,
    pub action: StoreAction,
    /// Whether a vector was stored for the fact.
    pub embedded: bool,
    /// Why no embedding was computed, when a provider was configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_error: Option<String>,
    /// Set when the vector index rejected the vector. The fact is durable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_error: Option<String>,
    /// `RelatedTo` links created by auto-linking.
    pub links_created: usize,
}

impl StoreOutcome {
    /// Whether the store completed with the vector index unavailable.
    pub fn degraded(&self) -> bool {
        self.vector_error.is_some()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Update
// ─────────────────────────────────────────────────────────────────────────────

/// In-place changes to an existing fact. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct FactPatch {
    pub text: Option<String>,
    pub category: Option<Category>,
    pub importance: Option<f32>,
    pub decay_class: Option<DecayClass>,
    pub tags: Option<Vec<String>>,
    pub summary: Option<String>,
    pub triple: Option<Triple>,
}

impl FactPatch {
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.category.is_none()
            && self.importance.is_none()
            && self.decay_class.is_none()
            && self.tags.is_none()
            && self.summary.is_none()
            && self.triple.is_none()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    pub fn decay_class(mut self, class: DecayClass) -> Self {
        self.decay_class = Some(class);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn triple(mut self, triple: Triple) -> Self {
        self.triple = Some(triple);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────────────────────────────────────

/// A hybrid search request.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    /// `None` uses `search.default_limit`.
    pub limit: Option<usize>,
    pub filter: SearchFilter,
    /// Append facts linked to the hits, up to this many hops.
    pub expand_links: Option<usize>,
    /// Rewrite the query with the completion provider before embedding it.
    /// `None` follows `completion.rewrite_queries`.
    pub rewrite: Option<bool>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            limit: None,
            filter: SearchFilter::default(),
            expand_links: None,
            rewrite: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn expand_links(mut self, depth: usize) -> Self {
        self.expand_links = Some(depth);
        self
    }

    pub fn rewrite(mut self, rewrite: bool) -> Self {
        self.rewrite = Some(rewrite);
        self
    }
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub fact: Fact,
    pub score: f64,
    pub source: HitSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_text_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_rank: Option<usize>,
    /// For link-expanded hits: the ranked hit the path started from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub via: Option<FactId>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    /// The semantic half of the search was skipped or failed.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewritten_query: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of an embedding backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    /// Facts that lacked a vector.
    pub scanned: usize,
    pub embedded: usize,
    pub failed: usize,
    /// Whether the index was recreated first.
    pub rebuilt: bool,
}

/// Outcome of WAL replay at open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub replayed: usize,
    /// Entries whose effect was already in the store.
    pub skipped: usize,
    /// Entries older than `wal.max_age_secs`.
    pub discarded: usize,
    pub failed: usize,
}

/// Outcome of the vector/fact cross-check at open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Vectors removed because their fact no longer exists.
    pub orphan_vectors: usize,
    /// Facts whose embedding flag was cleared because the vector is missing.
    pub flags_cleared: usize,
    /// Facts whose embedding flag was set because a vector exists.
    pub flags_set: usize,
}

/// Engine-wide statistics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub data_dir: PathBuf,
    pub vector_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_count: Option<usize>,
    pub dimensions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completer: Option<String>,
    pub classifier: String,
    pub wal_pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_triple_defaults_value_to_text() {
        let req = StoreRequest {
            entity: Some("user".into()),
            key: Some("editor".into()),
            ..StoreRequest::new("  Uses Helix  ")
        };
        let triple = req.explicit_triple().unwrap();
        assert_eq!(triple.value, "Uses Helix");

        let partial = StoreRequest {
            entity: Some("user".into()),
            ..StoreRequest::new("x")
        };
        assert!(partial.explicit_triple().is_none());
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(FactPatch::default().is_empty());
        assert!(!FactPatch::default().importance(0.3).is_empty());
    }

    #[test]
    fn test_store_action_serializes_tagged() {
        let json = serde_json::to_value(StoreAction::Reinforced).unwrap();
        assert_eq!(json["kind"], "reinforced");
    }
}
