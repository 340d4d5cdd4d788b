//! Depth-bounded traversal of the link graph.
//!
//! Traversal is a breadth-first walk over links in both directions. A path's
//! strength is the product of its link strengths; a fact reached along
//! several paths keeps the strongest one. No embeddings are involved.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::Result;
use crate::types::{FactId, LinkType, MemoryLink};

/// Default number of hops.
pub const DEFAULT_DEPTH: usize = 2;

/// A fact reached from the start set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraversalHit {
    pub fact_id: FactId,
    /// Hops along the strongest path.
    pub depth: usize,
    /// Product of link strengths along the strongest path.
    pub strength: f32,
    /// The start fact the strongest path begins at.
    pub origin: FactId,
    /// The fact one hop before this one on that path.
    pub via: FactId,
    /// Type of the last link on that path.
    pub link_type: LinkType,
}

/// Walk up to `max_depth` hops from `start`.
///
/// `neighbors` returns every link touching any of the given facts. Start
/// facts are never reported. Results are ordered by strength (descending),
/// then depth, then id.
pub fn traverse<F>(start: &[FactId], max_depth: usize, mut neighbors: F) -> Result<Vec<TraversalHit>>
where
    F: FnMut(&[FactId]) -> Result<Vec<MemoryLink>>,
{
    let origins: HashSet<FactId> = start.iter().copied().collect();
    // Strength and origin of the best known path to each node, start nodes included
    let mut best: HashMap<FactId, (f32, FactId)> =
        origins.iter().map(|id| (*id, (1.0, *id))).collect();
    let mut hits: HashMap<FactId, TraversalHit> = HashMap::new();

    let mut frontier: Vec<FactId> = origins.iter().copied().collect();
    frontier.sort();

    for depth in 1..=max_depth {
        if frontier.is_empty() {
            break;
        }
        // Paths in this layer extend the previous layer only, never each other
        let layer: HashMap<FactId, (f32, FactId)> = frontier
            .iter()
            .filter_map(|id| best.get(id).map(|known| (*id, *known)))
            .collect();
        let links = neighbors(&frontier)?;
        let mut next: Vec<FactId> = Vec::new();

        for link in &links {
            for from in [link.source_id, link.target_id] {
                let Some(&(from_strength, origin)) = layer.get(&from) else {
                    continue;
                };
                let Some(to) = link.other_end(from) else {
                    continue;
                };
                if to == from || origins.contains(&to) {
                    continue;
                }
                let strength = from_strength * link.strength;

                let improves = best.get(&to).is_none_or(|(known, _)| strength > *known);
                if !improves {
                    continue;
                }
                best.insert(to, (strength, origin));
                hits.insert(
                    to,
                    TraversalHit {
                        fact_id: to,
                        depth,
                        strength,
                        origin,
                        via: from,
                        link_type: link.link_type,
                    },
                );
                next.push(to);
            }
        }

        next.sort();
        next.dedup();
        frontier = next;
    }

    let mut out: Vec<TraversalHit> = hits.into_values().collect();
    out.sort_by(|a, b| {
        b.strength
            .total_cmp(&a.strength)
            .then(a.depth.cmp(&b.depth))
            .then(a.fact_id.cmp(&b.fact_id))
    });
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
