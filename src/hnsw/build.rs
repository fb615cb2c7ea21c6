//! HNSW graph construction: random level assignment, greedy descent, and
//! heuristic neighbor selection with pruning, per the standard Malkov &
//! Yashunin algorithm.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use super::{dot, HnswGraph, LevelGraph, VectorSource};

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: u32,
    score: f32,
}

fn by_score_desc(a: &Candidate, b: &Candidate) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(a.id.cmp(&b.id))
}

/// Build an HNSW graph over `vectors`. `m` is the per-node edge budget at
/// every level except level 0, where the budget is `2m`.
pub fn build_graph(vectors: &dyn VectorSource, m: usize, ef_construction: usize) -> HnswGraph {
    let n = vectors.len();
    let m0 = m * 2;

    if n == 0 {
        return HnswGraph {
            m,
            m0,
            ef_construction,
            entry_point: -1,
            max_level: -1,
            levels: Vec::new(),
        };
    }

    let ml = 1.0 / (m.max(2) as f64).ln();
    let mut rng = rand::rng();

    let mut adjacency: Vec<HashMap<u32, Vec<u32>>> = vec![HashMap::new()];
    let mut entry_point: i64 = -1;
    let mut max_level: i32 = -1;

    for row in 0..n as u32 {
        let level = assign_level(&mut rng, ml);
        if adjacency.len() <= level as usize {
            adjacency.resize_with(level as usize + 1, HashMap::new);
        }
        for lvl in adjacency.iter_mut().take(level as usize + 1) {
            lvl.entry(row).or_default();
        }

        if entry_point < 0 {
            entry_point = row as i64;
            max_level = level;
            continue;
        }

        let q = vectors.vector(row).to_vec();
        let mut ep = entry_point as u32;
        let mut ep_score = dot(&q, vectors.vector(ep));

        for lc in (level + 1..=max_level).rev() {
            let lvl = lc as usize;
            if lvl >= adjacency.len() {
                continue;
            }
            loop {
                let mut improved = false;
                if let Some(neighbors) = adjacency[lvl].get(&ep) {
                    for &cand in neighbors {
                        let score = dot(&q, vectors.vector(cand));
                        if score > ep_score {
                            ep_score = score;
                            ep = cand;
                            improved = true;
                        }
                    }
                }
                if !improved {
                    break;
                }
            }
        }

        let start_level = level.min(max_level);
        for lc in (0..=start_level).rev() {
            let lvl = lc as usize;
            let candidates = search_layer(vectors, &adjacency[lvl], &q, ep, ef_construction);
            let budget = if lvl == 0 { m0 } else { m };
            let selected = select_neighbors_heuristic(vectors, candidates.clone(), budget);

            adjacency[lvl]
                .entry(row)
                .or_default()
                .extend(selected.iter().map(|c| c.id));

            for cand in &selected {
                let back = adjacency[lvl].entry(cand.id).or_default();
                if !back.contains(&row) {
                    back.push(row);
                }
                if back.len() > budget {
                    let cand_vec = vectors.vector(cand.id).to_vec();
                    let mut scored: Vec<(f32, u32)> = back
                        .iter()
                        .map(|&nb| (dot(&cand_vec, vectors.vector(nb)), nb))
                        .collect();
                    scored.sort_by(|a, b| {
                        b.0.partial_cmp(&a.0)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.1.cmp(&b.1))
                    });
                    scored.truncate(budget);
                    *back = scored.into_iter().map(|(_, id)| id).collect();
                }
            }

            if let Some(best) = candidates.first() {
                ep = best.id;
            }
        }

        if level > max_level {
            max_level = level;
            entry_point = row as i64;
        }
    }

    for level in adjacency.iter_mut() {
        symmetrize(level);
    }
    let levels = adjacency
        .into_iter()
        .map(|map| finalize_level(map, n))
        .collect();

    HnswGraph {
        m,
        m0,
        ef_construction,
        entry_point,
        max_level,
        levels,
    }
}

fn assign_level(rng: &mut impl Rng, ml: f64) -> i32 {
    let u: f64 = rng.random::<f64>().clamp(f64::MIN_POSITIVE, 1.0 - f32::EPSILON as f64);
    (-u.ln() * ml).floor() as i32
}

/// `ef`-bounded beam search within a single level, matching spec §4.6's
/// descending-priority candidate list / size-capped result list description.
fn search_layer(
    vectors: &dyn VectorSource,
    level_adj: &HashMap<u32, Vec<u32>>,
    q: &[f32],
    entry: u32,
    ef: usize,
) -> Vec<Candidate> {
    let mut visited = HashSet::new();
    visited.insert(entry);

    let entry_score = dot(q, vectors.vector(entry));
    let mut candidates = vec![Candidate { id: entry, score: entry_score }];
    let mut result = vec![Candidate { id: entry, score: entry_score }];

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

        if let Some(neighbors) = level_adj.get(&current.id) {
            for &nb in neighbors {
                if visited.insert(nb) {
                    let score = dot(q, vectors.vector(nb));
                    candidates.push(Candidate { id: nb, score });
                    result.push(Candidate { id: nb, score });
                }
            }
        }
        if result.len() > ef.max(1) {
            result.sort_by(by_score_desc);
            result.truncate(ef.max(1));
        }
        if candidates.is_empty() {
            break;
        }
    }

    result.sort_by(by_score_desc);
    result
}

/// Keep a candidate only if no already-selected neighbor is closer to it than
/// it is to the query — the standard HNSW heuristic — then backfill with the
/// closest leftovers if the heuristic filtered below budget.
fn select_neighbors_heuristic(
    vectors: &dyn VectorSource,
    candidates: Vec<Candidate>,
    budget: usize,
) -> Vec<Candidate> {
    let mut sorted = candidates;
    sorted.sort_by(by_score_desc);

    let mut selected: Vec<Candidate> = Vec::with_capacity(budget);
    let mut leftover = Vec::new();
    for cand in sorted {
        if selected.len() >= budget {
            leftover.push(cand);
            continue;
        }
        let cand_vec = vectors.vector(cand.id);
        let dominated = selected
            .iter()
            .any(|s| dot(vectors.vector(s.id), cand_vec) > cand.score);
        if dominated {
            leftover.push(cand);
        } else {
            selected.push(cand);
        }
    }
    for cand in leftover {
        if selected.len() >= budget {
            break;
        }
        selected.push(cand);
    }
    selected
}

fn symmetrize(map: &mut HashMap<u32, Vec<u32>>) {
    let pairs: Vec<(u32, u32)> = map
        .iter()
        .flat_map(|(&n, neighbors)| neighbors.iter().map(move |&nb| (n, nb)))
        .collect();
    for (a, b) in pairs {
        let entry = map.entry(b).or_default();
        if !entry.contains(&a) && a != b {
            entry.push(a);
        }
    }
}

fn finalize_level(map: HashMap<u32, Vec<u32>>, rows: usize) -> LevelGraph {
    let mut indptr = Vec::with_capacity(rows + 1);
    let mut indices = Vec::new();
    indptr.push(0u32);
    for row in 0..rows as u32 {
        if let Some(neighbors) = map.get(&row) {
            let mut ns: Vec<u32> = neighbors.iter().copied().filter(|&x| x != row).collect();
            ns.sort_unstable();
            ns.dedup();
            indices.extend(ns);
        }
        indptr.push(indices.len() as u32);
    }
    LevelGraph { indptr, indices }
}
