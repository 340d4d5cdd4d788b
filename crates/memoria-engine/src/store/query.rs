//! Query and result types for fact store reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Fact, FactId, Scope};

// ─────────────────────────────────────────────────────────────────────────────
// Scope Filter
// ─────────────────────────────────────────────────────────────────────────────

/// The caller's identity for scope filtering.
///
/// Global facts are always visible. A scoped fact is visible only when the
/// filter names its target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeFilter {
    pub user: Option<String>,
    pub agent: Option<String>,
    pub session: Option<String>,
}

impl ScopeFilter {
    /// A filter that only admits global facts.
    pub fn global_only() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Build the filter that admits exactly `scope` (plus global).
    pub fn for_scope(scope: &Scope) -> Self {
        match scope {
            Scope::Global => Self::default(),
            Scope::User(t) => Self::default().with_user(t.clone()),
            Scope::Agent(t) => Self::default().with_agent(t.clone()),
            Scope::Session(t) => Self::default().with_session(t.clone()),
        }
    }

    pub fn matches(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Global => true,
            Scope::User(t) => self.user.as_deref() == Some(t.as_str()),
            Scope::Agent(t) => self.agent.as_deref() == Some(t.as_str()),
            Scope::Session(t) => self.session.as_deref() == Some(t.as_str()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lookup
// ─────────────────────────────────────────────────────────────────────────────

/// Result ordering for lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOrder {
    /// `importance * confidence` descending, then effective date descending.
    #[default]
    Relevance,
    EffectiveDateAsc,
    EffectiveDateDesc,
}

/// Exact-match query over the structured triple and tags.
#[derive(Debug, Clone, Default)]
pub struct LookupQuery {
    /// Matched case-insensitively.
    pub entity: Option<String>,
    /// Matched case-insensitively.
    pub key: Option<String>,
    pub tag: Option<String>,
    /// `None` disables scope filtering.
    pub scope: Option<ScopeFilter>,
    /// Point-in-time read: only facts effective at this instant.
    pub as_of: Option<DateTime<Utc>>,
    pub include_superseded: bool,
    pub order: LookupOrder,
    pub limit: Option<usize>,
}

impl LookupQuery {
    pub fn entity(entity: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.into()),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    pub fn include_superseded(mut self, include: bool) -> Self {
        self.include_superseded = include;
        self
    }

    pub fn order(mut self, order: LookupOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Full-text search
// ─────────────────────────────────────────────────────────────────────────────

/// Visibility filters shared by full-text search and the merged search path.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub scope: Option<ScopeFilter>,
    pub as_of: Option<DateTime<Utc>>,
    pub include_superseded: bool,
    pub category: Option<String>,
    pub tag: Option<String>,
}

impl SearchFilter {
    pub fn with_scope(mut self, scope: ScopeFilter) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn include_superseded(mut self, include: bool) -> Self {
        self.include_superseded = include;
        self
    }

    pub fn as_of(mut self, at: DateTime<Utc>) -> Self {
        self.as_of = Some(at);
        self
    }

    /// Whether `fact` passes every filter. Mirrors the SQL predicates used by
    /// full-text search so the merged path filters identically.
    pub fn admits(&self, fact: &Fact) -> bool {
        if let Some(scope) = &self.scope
            && !scope.matches(&fact.scope)
        {
            return false;
        }
        match self.as_of {
            Some(at) => {
                if fact.effective_date() > at {
                    return false;
                }
                if !self.include_superseded && !fact.was_current_at(at) {
                    return false;
                }
            }
            None => {
                if !self.include_superseded && !fact.is_current() {
                    return false;
                }
            }
        }
        if let Some(category) = &self.category
            && !fact.category.as_str().eq_ignore_ascii_case(category)
        {
            return false;
        }
        if let Some(tag) = &self.tag
            && !fact.tags.iter().any(|t| t == tag)
        {
            return false;
        }
        true
    }
}

/// A full-text match with its BM25-derived score (higher is better).
#[derive(Debug, Clone, PartialEq)]
pub struct FtsHit {
    pub id: FactId,
    pub text: String,
    pub score: f64,
    /// Whether the fact has been superseded.
    pub superseded: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Fact store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub facts: usize,
    pub current: usize,
    pub superseded: usize,
    pub embedded: usize,
    pub links: usize,
    pub schema_version: i32,
}
