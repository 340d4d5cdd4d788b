//! Reciprocal Rank Fusion of full-text and vector result lists.
//!
//! BM25 scores and cosine similarities are not comparable, so only rank
//! positions are used:
//!
//! ```text
//! score(x) = Σ 1 / (k + rank_i(x))     over every list containing x
//! ```
//!
//! Ranks are 1-based positions in each backend's original list. Duplicates
//! are resolved before scoring:
//!
//! 1. A candidate whose text matches a superseded fact's text is dropped.
//! 2. The same id in both lists is kept once; the full-text occurrence is
//!    canonical and both ranks contribute.
//! 3. Distinct ids with identical text (ignoring case and surrounding
//!    whitespace) keep only the full-text occurrence, or the better-ranked
//!    one when both come from the same list.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::types::FactId;

/// Default smoothing constant.
pub const DEFAULT_RRF_K: u32 = 60;

/// One entry of a backend's ranked list.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub id: FactId,
    pub text: String,
}

impl RankedCandidate {
    pub fn new(id: FactId, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

/// Which backends contributed to a fused hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HitSource {
    FullText,
    Vector,
    Both,
    /// Reached by link traversal from another hit.
    Graph,
}

/// A merged result with its RRF score and per-backend ranks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub id: FactId,
    pub score: f64,
    pub full_text_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

impl FusedHit {
    pub fn source(&self) -> HitSource {
        match (self.full_text_rank, self.vector_rank) {
            (Some(_), Some(_)) => HitSource::Both,
            (Some(_), None) => HitSource::FullText,
            _ => HitSource::Vector,
        }
    }
}

/// Text key used for duplicate detection.
pub fn normalize_text(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Reciprocal Rank Fusion with a fixed `k`.
#[derive(Debug, Clone, Copy)]
pub struct RrfMerger {
    k: f64,
}

impl Default for RrfMerger {
    fn default() -> Self {
        Self::new(DEFAULT_RRF_K)
    }
}

impl RrfMerger {
    pub fn new(k: u32) -> Self {
        Self { k: k as f64 }
    }

    fn contribution(&self, rank: usize) -> f64 {
        1.0 / (self.k + rank as f64)
    }

    /// Merge two ranked lists, best first.
    ///
    /// `superseded_texts` holds normalized texts of superseded facts; pass an
    /// empty set to keep them.
    ///
    /// Ties on score are broken by the better vector rank, then the better
    /// full-text rank, then id, so the order is fully deterministic.
    pub fn merge(
        &self,
        full_text: &[RankedCandidate],
        vector: &[RankedCandidate],
        superseded_texts: &HashSet<String>,
    ) -> Vec<FusedHit> {
        let mut hits: Vec<FusedHit> = Vec::new();
        let mut by_id: HashMap<FactId, usize> = HashMap::new();
        // normalized text -> index of the hit that owns it
        let mut by_text: HashMap<String, usize> = HashMap::new();

        for (pos, cand) in full_text.iter().enumerate() {
            let key = normalize_text(&cand.text);
            if superseded_texts.contains(&key)
                || by_id.contains_key(&cand.id)
                || by_text.contains_key(&key)
            {
                continue;
            }
            by_id.insert(cand.id, hits.len());
            by_text.insert(key, hits.len());
            hits.push(FusedHit {
                id: cand.id,
                score: 0.0,
                full_text_rank: Some(pos + 1),
                vector_rank: None,
            });
        }

        for (pos, cand) in vector.iter().enumerate() {
            let rank = pos + 1;
            if let Some(&idx) = by_id.get(&cand.id) {
                let hit = &mut hits[idx];
                if hit.vector_rank.is_none() {
                    hit.vector_rank = Some(rank);
                }
                continue;
            }
            let key = normalize_text(&cand.text);
            if superseded_texts.contains(&key) || by_text.contains_key(&key) {
                continue;
            }
            by_id.insert(cand.id, hits.len());
            by_text.insert(key, hits.len());
            hits.push(FusedHit {
                id: cand.id,
                score: 0.0,
                full_text_rank: None,
                vector_rank: Some(rank),
            });
        }

        for hit in &mut hits {
            hit.score = hit.full_text_rank.map_or(0.0, |r| self.contribution(r))
                + hit.vector_rank.map_or(0.0, |r| self.contribution(r));
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| rank_cmp(a.vector_rank, b.vector_rank))
                .then_with(|| rank_cmp(a.full_text_rank, b.full_text_rank))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits
    }
}

/// Present ranks sort before absent ones; lower ranks first.
fn rank_cmp(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cands(items: &[(FactId, &str)]) -> Vec<RankedCandidate> {
        items
            .iter()
            .map(|(id, text)| RankedCandidate::new(*id, *text))
            .collect()
    }

    #[test]
    fn test_rrf_scores_match_formula() {
        let (a, b, c, d) = (FactId::new(), FactId::new(), FactId::new(), FactId::new());
        let fts = cands(&[(a, "a"), (b, "b"), (c, "c")]);
        let vec = cands(&[(b, "b"), (a, "a"), (d, "d")]);

        let merged = RrfMerger::default().merge(&fts, &vec, &HashSet::new());
        let order: Vec<_> = merged.iter().map(|h| h.id).collect();
        assert_eq!(order, vec![b, a, d, c]);

        let score = |id| merged.iter().find(|h| h.id == id).unwrap().score;
        let expected_ab = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((score(a) - expected_ab).abs() < 1e-12);
        assert!((score(b) - expected_ab).abs() < 1e-12);
        assert!((score(c) - 1.0 / 63.0).abs() < 1e-12);
        assert!((score(d) - 1.0 / 63.0).abs() < 1e-12);
        assert!(score(b) > score(c));
    }

    #[test]
    fn test_merge_is_deterministic() {
        let ids: Vec<_> = (0..6).map(|_| FactId::new()).collect();
        let fts = cands(&[(ids[0], "zero"), (ids[1], "one"), (ids[2], "two")]);
        let vec = cands(&[(ids[3], "three"), (ids[4], "four"), (ids[5], "five")]);
        let merger = RrfMerger::new(60);
        let first = merger.merge(&fts, &vec, &HashSet::new());
        for _ in 0..10 {
            assert_eq!(merger.merge(&fts, &vec, &HashSet::new()), first);
        }
    }

    #[test]
    fn test_same_id_in_both_lists_kept_once() {
        let a = FactId::new();
        let merged = RrfMerger::default().merge(
            &cands(&[(a, "alpha")]),
            &cands(&[(a, "alpha")]),
            &HashSet::new(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].full_text_rank, Some(1));
        assert_eq!(merged[0].vector_rank, Some(1));
        assert_eq!(merged[0].source(), HitSource::Both);
    }

    #[test]
    fn test_identical_text_prefers_full_text() {
        let (a, b) = (FactId::new(), FactId::new());
        let merged = RrfMerger::default().merge(
            &cands(&[(a, "User prefers dark mode")]),
            &cands(&[(b, "  user prefers DARK mode ")]),
            &HashSet::new(),
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, a);
        assert_eq!(merged[0].source(), HitSource::FullText);
    }

    #[test]
    fn test_identical_text_within_vector_list_keeps_better_rank() {
        let (a, b) = (FactId::new(), FactId::new());
        let merged =
            RrfMerger::default().merge(&[], &cands(&[(a, "same"), (b, "Same")]), &HashSet::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, a);
    }

    #[test]
    fn test_superseded_text_dropped() {
        let (a, b) = (FactId::new(), FactId::new());
        let superseded: HashSet<String> = [normalize_text("User prefers dark mode")].into();
        let merged = RrfMerger::default().merge(
            &cands(&[(a, "User prefers dark mode"), (b, "User prefers light mode")]),
            &cands(&[(a, "User prefers dark mode")]),
            &superseded,
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, b);
        // Rank positions come from the original list
        assert_eq!(merged[0].full_text_rank, Some(2));
    }

    #[test]
    fn test_k_changes_scores() {
        let a = FactId::new();
        let merged = RrfMerger::new(1).merge(&cands(&[(a, "x")]), &[], &HashSet::new());
        assert!((merged[0].score - 0.5).abs() < 1e-12);
    }
}
