//! HNSW query-time traversal, plus the brute-force oracle used as a fallback
//! and as the correctness baseline in tests.

use super::{dot, HnswGraph, VectorSource};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub id: u32,
    pub score: f32,
}

fn by_score_desc(a: &SearchHit, b: &SearchHit) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(a.id.cmp(&b.id))
}

/// Search `graph` for the `k` nearest rows to `query`. `ef_default` is the
/// caller's `max(64, 4M)` per spec §4.6; the effective beam width used here is
/// `max(ef_default, 10k)`. Falls back to exhaustive search when the graph has
/// no entry point.
pub fn search(
    graph: &HnswGraph,
    vectors: &dyn VectorSource,
    query: &[f32],
    k: usize,
    ef_default: usize,
) -> Vec<SearchHit> {
    if graph.is_empty() || graph.levels.is_empty() {
        return brute_force(vectors, query, k);
    }

    let mut ep = graph.entry_point as u32;
    let mut ep_score = dot(query, vectors.vector(ep));

    for level in (1..=graph.max_level.max(0) as usize).rev() {
        if level >= graph.levels.len() {
            continue;
        }
        loop {
            let mut improved = false;
            for &nb in graph.levels[level].neighbors(ep) {
                let score = dot(query, vectors.vector(nb));
                if score > ep_score {
                    ep_score = score;
                    ep = nb;
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
    }

    let ef = ef_default.max(10 * k).max(1);
    let level0 = &graph.levels[0];

    let mut visited = std::collections::HashSet::new();
    visited.insert(ep);
    let mut candidates = vec![SearchHit { id: ep, score: ep_score }];
    let mut result = vec![SearchHit { id: ep, score: ep_score }];

    loop {
        candidates.sort_by(by_score_desc);
        let Some(current) = candidates.first().copied() else {
            break;
        };
        candidates.remove(0);

        result.sort_by(by_score_desc);
        if result.len() >= ef && current.score < result[ef.min(result.len()) - 1].score {
            break;
        }

        for &nb in level0.neighbors(current.id) {
            if visited.insert(nb) {
                let score = dot(query, vectors.vector(nb));
                candidates.push(SearchHit { id: nb, score });
                result.push(SearchHit { id: nb, score });
            }
        }
        if result.len() > ef {
            result.sort_by(by_score_desc);
            result.truncate(ef);
        }
        if candidates.is_empty() {
            break;
        }
    }

    result.sort_by(by_score_desc);
    result.truncate(k);
    result
}

/// Exhaustive dot-product search, used when the graph is absent and as the
/// recall oracle in tests.
pub fn brute_force(vectors: &dyn VectorSource, query: &[f32], k: usize) -> Vec<SearchHit> {
    let mut all: Vec<SearchHit> = (0..vectors.len() as u32)
        .map(|row| SearchHit {
            id: row,
            score: dot(query, vectors.vector(row)),
        })
        .collect();
    all.sort_by(by_score_desc);
    all.truncate(k);
    all
}
