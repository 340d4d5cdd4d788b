//! Reads: get, lookup, hybrid search, traversal.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};
use crate::fusion::{HitSource, RankedCandidate, normalize_text};
use crate::graph::{TraversalHit, traverse};
use crate::prompt::{RewritePrompt, clean_completion};
use crate::store::{LookupQuery, SearchFilter};
use crate::types::{Fact, FactId, MemoryLink};
use crate::validation::{ValidationError, validate_depth, validate_limit};
use crate::vector::SimilarityHit;

use super::request::{SearchHit, SearchQuery, SearchResults};
use super::{EngineInner, MemoryEngine, now};

impl MemoryEngine {
    /// Get a fact by id. Does not count as a recall.
    pub fn get(&self, id: FactId) -> Result<Option<Fact>> {
        self.inner.store.get(id)
    }

    pub fn get_many(&self, ids: &[FactId]) -> Result<Vec<Fact>> {
        self.inner.store.get_many(ids)
    }

    /// Exact-match lookup on entity, key and tag.
    ///
    /// Expired facts that the sweep has not removed yet are hidden. Every
    /// returned fact counts as a recall.
    pub fn lookup(&self, query: &LookupQuery) -> Result<Vec<Fact>> {
        let now = now();
        let facts: Vec<Fact> = self
            .inner
            .store
            .lookup(query)?
            .into_iter()
            .filter(|f| !self.inner.policy.is_expired(f, now))
            .collect();

        let ids: Vec<FactId> = facts.iter().map(|f| f.id).collect();
        self.inner.record_access(&ids, now);
        Ok(facts)
    }

    /// Hybrid search: full-text and vector candidates merged with RRF, then
    /// filtered, then optionally extended along the link graph.
    ///
    /// The vector half degrades silently (with `degraded` set) when the
    /// index or the embedding provider fails.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResults> {
        let inner = &self.inner;
        let limit = query.limit.unwrap_or(inner.config.search.default_limit);
        validate_limit(limit)?;
        if query.text.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        if let Some(depth) = query.expand_links {
            validate_depth(depth, inner.config.graph.max_depth)?;
        }
        let candidates = limit.saturating_mul(inner.config.search.candidate_multiplier);

        // Unfiltered on purpose: filtering happens after ranks are assigned
        let fts_hits = inner.store.search_text(&query.text, None, candidates)?;

        let mut results = SearchResults::default();
        let vector_hits = inner.semantic_candidates(query, candidates, &mut results).await;

        let mut ids: Vec<FactId> = fts_hits
            .iter()
            .map(|h| h.id)
            .chain(vector_hits.iter().map(|h| h.fact_id))
            .collect();
        ids.sort();
        ids.dedup();
        let facts: HashMap<FactId, Fact> = inner
            .store
            .get_many(&ids)?
            .into_iter()
            .map(|f| (f.id, f))
            .collect();

        let full_text: Vec<RankedCandidate> = fts_hits
            .iter()
            .map(|h| RankedCandidate::new(h.id, h.text.clone()))
            .collect();
        let vector: Vec<RankedCandidate> = vector_hits
            .iter()
            .filter_map(|h| facts.get(&h.fact_id))
            .map(|f| RankedCandidate::new(f.id, f.text.clone()))
            .collect();

        let superseded = if !query.filter.include_superseded && query.filter.as_of.is_none() {
            superseded_texts(facts.values())
        } else {
            HashSet::new()
        };

        let now = now();
        let mut hits: Vec<SearchHit> = inner
            .merger
            .merge(&full_text, &vector, &superseded)
            .into_iter()
            .filter_map(|fused| {
                let fact = facts.get(&fused.id)?;
                inner.visible(fact, &query.filter, now).then(|| SearchHit {
                    fact: fact.clone(),
                    score: fused.score,
                    source: fused.source(),
                    full_text_rank: fused.full_text_rank,
                    vector_rank: fused.vector_rank,
                    via: None,
                })
            })
            .take(limit)
            .collect();

        if let Some(depth) = query.expand_links
            && depth > 0
            && !hits.is_empty()
        {
            let expanded = inner.expand_hits(&hits, depth, &query.filter, now, limit)?;
            hits.extend(expanded);
        }

        let touched: Vec<FactId> = hits.iter().map(|h| h.fact.id).collect();
        inner.record_access(&touched, now);

        debug!(
            query = %query.text,
            full_text = fts_hits.len(),
            vector = vector_hits.len(),
            returned = hits.len(),
            degraded = results.degraded,
            "Search complete"
        );
        results.hits = hits;
        Ok(results)
    }

    /// Facts reachable from `start` within `depth` hops (default
    /// `graph.default_depth`), strongest path first.
    pub fn traverse(&self, start: &[FactId], depth: Option<usize>) -> Result<Vec<TraversalHit>> {
        let graph = &self.inner.config.graph;
        let depth = depth.unwrap_or(graph.default_depth);
        validate_depth(depth, graph.max_depth)?;

        for id in start {
            if !self.inner.store.exists(*id)? {
                return Err(MemoryError::NotFound(format!("fact {}", id)));
            }
        }

        let hits = traverse(start, depth, |ids| self.inner.store.links_touching(ids))?;
        let ids: Vec<FactId> = hits.iter().map(|h| h.fact_id).collect();
        let existing: HashSet<FactId> = self
            .inner
            .store
            .get_many(&ids)?
            .into_iter()
            .map(|f| f.id)
            .collect();
        Ok(hits
            .into_iter()
            .filter(|h| existing.contains(&h.fact_id))
            .collect())
    }

    /// Every link touching `id`.
    pub fn links(&self, id: FactId) -> Result<Vec<MemoryLink>> {
        self.inner.store.links_for(id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search internals
// ─────────────────────────────────────────────────────────────────────────────

impl EngineInner {
    /// Vector candidates for `query`, or none if the semantic path is off or
    /// failed. Failures set `results.degraded`.
    async fn semantic_candidates(
        &self,
        query: &SearchQuery,
        limit: usize,
        results: &mut SearchResults,
    ) -> Vec<SimilarityHit> {
        if self.embedder.is_none() {
            return Vec::new();
        }
        let Some(index) = self.vector_index() else {
            warn!("Vector index unavailable, returning full-text results only");
            results.degraded = true;
            return Vec::new();
        };

        let mut semantic_text = query.text.clone();
        if query.rewrite.unwrap_or(self.config.completion.rewrite_queries) && self.completer.is_some()
        {
            match self.rewrite_query(&query.text).await {
                Some(rewritten) => {
                    semantic_text = rewritten.clone();
                    results.rewritten_query = Some(rewritten);
                }
                None => results.degraded = true,
            }
        }

        let vector = match self.embed(&semantic_text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, returning full-text results only");
                results.degraded = true;
                return Vec::new();
            }
        };
        match index.search(&vector, limit, Some(self.config.search.min_similarity)) {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Vector search failed, returning full-text results only");
                results.degraded = true;
                Vec::new()
            }
        }
    }

    /// HyDE: a hypothetical memory that would answer the query.
    async fn rewrite_query(&self, query: &str) -> Option<String> {
        let prompt = RewritePrompt::build(query)?;
        let raw = self.complete("rewrite", &prompt).await?;
        let rewritten = clean_completion(&raw)?;
        debug!(original = %query, rewritten = %rewritten, "Rewrote query");
        Some(rewritten)
    }

    /// Whether a candidate survives the post-merge filters.
    fn visible(&self, fact: &Fact, filter: &SearchFilter, now: DateTime<Utc>) -> bool {
        filter.admits(fact) && !self.policy.is_expired(fact, now)
    }

    /// Linked facts not already in `hits`, scored by parent score times path
    /// strength, best first, at most `limit` of them.
    fn expand_hits(
        &self,
        hits: &[SearchHit],
        depth: usize,
        filter: &SearchFilter,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let scores: HashMap<FactId, f64> = hits.iter().map(|h| (h.fact.id, h.score)).collect();
        let start: Vec<FactId> = hits.iter().map(|h| h.fact.id).collect();

        let reached = traverse(&start, depth, |ids| self.store.links_touching(ids))?;
        let ids: Vec<FactId> = reached.iter().map(|r| r.fact_id).collect();
        let facts: HashMap<FactId, Fact> = self
            .store
            .get_many(&ids)?
            .into_iter()
            .map(|f| (f.id, f))
            .collect();

        let mut expanded: Vec<SearchHit> = reached
            .iter()
            .filter_map(|r| {
                let fact = facts.get(&r.fact_id)?;
                let parent = scores.get(&r.origin)?;
                self.visible(fact, filter, now).then(|| SearchHit {
                    fact: fact.clone(),
                    score: parent * r.strength as f64,
                    source: HitSource::Graph,
                    full_text_rank: None,
                    vector_rank: None,
                    via: Some(r.origin),
                })
            })
            .collect();
        expanded.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.fact.id.cmp(&b.fact.id))
        });
        expanded.truncate(limit);
        Ok(expanded)
    }

    /// Count a recall of `ids`. Failure is logged, never surfaced.
    pub(crate) fn record_access(&self, ids: &[FactId], now: DateTime<Utc>) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.store.touch_access(ids, now) {
            warn!(count = ids.len(), error = %e, "Failed to record access");
        }
    }
}

/// Normalized texts of the superseded candidates, minus any text a current
/// candidate also carries.
fn superseded_texts<'a>(facts: impl Iterator<Item = &'a Fact>) -> HashSet<String> {
    let mut superseded = HashSet::new();
    let mut current = HashSet::new();
    for fact in facts {
        let key = normalize_text(&fact.text);
        if fact.is_current() {
            current.insert(key);
        } else {
            superseded.insert(key);
        }
    }
    superseded.retain(|t| !current.contains(t));
    superseded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superseded_texts_keeps_current_restatements() {
        let old = {
            let mut f = Fact::new("User prefers dark mode");
            f.superseded_by = Some(FactId::new());
            f
        };
        let restated_old = {
            let mut f = Fact::new("Uses vim");
            f.superseded_by = Some(FactId::new());
            f
        };
        let current = Fact::new("uses VIM");
        let texts = superseded_texts([&old, &restated_old, &current].into_iter());
        assert!(texts.contains(&normalize_text("User prefers dark mode")));
        assert!(!texts.contains(&normalize_text("Uses vim")));
    }
}
