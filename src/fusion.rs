//! Chunk-to-document aggregation and Reciprocal Rank Fusion of the lexical
//! and semantic rankings into one final ordering.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::hnsw::SearchHit;
use crate::lexical::{FieldHits, LexicalIndex};
use crate::manifest::ChunkMeta;
use crate::math::score_to_percent;

/// RRF constant, matching the standard formula used throughout.
const RRF_K: f32 = 60.0;
const TITLE_BOOST: f32 = 1.5;
const TOP_N: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Lexical,
    Semantic,
}

/// The lexical/semantic weight pair used per mode. A policy, not an
/// algorithmic constant — first-class config rather than buried literals.
#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct FusionWeights {
    pub lexical_mode_w_lex: f32,
    pub lexical_mode_w_sem: f32,
    pub semantic_mode_w_lex: f32,
    pub semantic_mode_w_sem: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            lexical_mode_w_lex: 1.0,
            lexical_mode_w_sem: 0.3,
            semantic_mode_w_lex: 0.3,
            semantic_mode_w_sem: 1.0,
        }
    }
}

impl FusionWeights {
    fn for_mode(&self, mode: Mode, semantic_present: bool) -> (f32, f32) {
        match mode {
            Mode::Lexical => {
                let w_sem = if semantic_present { self.lexical_mode_w_sem } else { 0.0 };
                (self.lexical_mode_w_lex, w_sem)
            }
            Mode::Semantic => (self.semantic_mode_w_lex, self.semantic_mode_w_sem),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FusedResult {
    pub doc_id: String,
    pub score: f32,
    /// `max_sem(doc)` mapped to a display percentage, when semantic hits
    /// exist for this document.
    pub max_sem_percent: Option<f32>,
}

/// A chunk slug absent from `chunk_metadata` is its own parent document.
pub fn parent_of(slug: &str, chunk_metadata: Option<&HashMap<String, ChunkMeta>>) -> String {
    chunk_metadata
        .and_then(|m| m.get(slug))
        .map(|meta| meta.parent_slug.clone())
        .unwrap_or_else(|| slug.to_string())
}

/// Group chunk-granularity semantic hits by parent document, computing
/// `rrf_sem(doc) = Σ 1/(60+r)` over the document's own chunk ranks and
/// `max_sem(doc)`, the raw score of that document's best-ranked chunk.
fn aggregate_semantic(
    hits: &[SearchHit],
    chunk_ids: &[String],
    chunk_metadata: Option<&HashMap<String, ChunkMeta>>,
) -> HashMap<String, (f32, f32)> {
    let mut per_doc: HashMap<String, Vec<f32>> = HashMap::new();
    for hit in hits {
        let Some(slug) = chunk_ids.get(hit.id as usize) else { continue };
        let parent = parent_of(slug, chunk_metadata);
        per_doc.entry(parent).or_default().push(hit.score);
    }

    per_doc
        .into_iter()
        .map(|(doc, mut scores)| {
            scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
            let rrf: f32 = scores.iter().enumerate().map(|(r, _)| 1.0 / (RRF_K + r as f32)).sum();
            let max_sem = scores[0];
            (doc, (rrf, max_sem))
        })
        .collect()
}

/// Union ids across fields preserving per-field order as the lexical rank,
/// applying a title-match boost to documents sharing a query token with
/// their title. Rows are resolved to document ids via `index`.
fn aggregate_lexical(
    index: &LexicalIndex,
    field_hits: &[FieldHits],
    query_tokens: &[String],
) -> HashMap<String, f32> {
    let mut rank_of: HashMap<u32, usize> = HashMap::new();
    let mut next_rank = 0usize;
    for fh in field_hits {
        for &row in &fh.rows {
            rank_of.entry(row).or_insert_with(|| {
                let r = next_rank;
                next_rank += 1;
                r
            });
        }
    }

    rank_of
        .into_iter()
        .map(|(row, rank)| {
            let title = index.title_tokens(row);
            let boosted = query_tokens.iter().any(|qt| title.iter().any(|tt| tt.starts_with(qt.as_str())));
            let boost = if boosted { TITLE_BOOST } else { 1.0 };
            (index.row_id(row).to_string(), (1.0 / (1.0 + rank as f32)) * boost)
        })
        .collect()
}

/// Combine lexical field hits and semantic chunk hits into the final ranked
/// document list, per the mode-dependent weights.
pub fn fuse(
    mode: Mode,
    weights: &FusionWeights,
    index: &LexicalIndex,
    field_hits: &[FieldHits],
    query_tokens: &[String],
    semantic_hits: &[SearchHit],
    chunk_ids: &[String],
    chunk_metadata: Option<&HashMap<String, ChunkMeta>>,
) -> Vec<FusedResult> {
    let lexical_by_doc = aggregate_lexical(index, field_hits, query_tokens);
    let semantic_by_doc = aggregate_semantic(semantic_hits, chunk_ids, chunk_metadata);

    let (w_lex, w_sem) = weights.for_mode(mode, !semantic_by_doc.is_empty());

    let mut doc_ids: Vec<&String> = lexical_by_doc.keys().collect();
    for id in semantic_by_doc.keys() {
        if !lexical_by_doc.contains_key(id) {
            doc_ids.push(id);
        }
    }

    let mut results: Vec<FusedResult> = doc_ids
        .into_iter()
        .map(|doc_id| {
            let lex_score = lexical_by_doc.get(doc_id).copied().unwrap_or(0.0);
            let semantic = semantic_by_doc.get(doc_id);
            let rrf_sem = semantic.map(|(rrf, _)| *rrf).unwrap_or(0.0);
            let score = w_lex * lex_score + w_sem * rrf_sem;
            let max_sem_percent = semantic.map(|(_, max_sem)| score_to_percent(*max_sem));
            FusedResult { doc_id: doc_id.clone(), score, max_sem_percent }
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
    results.truncate(TOP_N);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexical::{DocumentFields, Field};

    fn chunk_meta(parent: &str, chunk_id: u32) -> ChunkMeta {
        ChunkMeta { parent_slug: parent.to_string(), chunk_id }
    }

    #[test]
    fn parent_of_falls_back_to_own_slug_when_metadata_absent() {
        assert_eq!(parent_of("intro", None), "intro");
        assert_eq!(parent_of("intro#2", None), "intro#2");
    }

    #[test]
    fn parent_of_resolves_chunk_to_its_document() {
        let mut meta = HashMap::new();
        meta.insert("intro#2".to_string(), chunk_meta("intro", 2));
        assert_eq!(parent_of("intro#2", Some(&meta)), "intro");
        assert_eq!(parent_of("intro", Some(&meta)), "intro");
    }

    #[test]
    fn aggregate_semantic_sums_rrf_over_document_chunk_ranks() {
        let chunk_ids = vec!["a#0".to_string(), "a#1".to_string(), "b#0".to_string()];
        let mut meta = HashMap::new();
        meta.insert("a#0".to_string(), chunk_meta("a", 0));
        meta.insert("a#1".to_string(), chunk_meta("a", 1));
        meta.insert("b#0".to_string(), chunk_meta("b", 0));

        let hits = vec![
            SearchHit { id: 0, score: 0.9 },
            SearchHit { id: 2, score: 0.8 },
            SearchHit { id: 1, score: 0.7 },
        ];
        let agg = aggregate_semantic(&hits, &chunk_ids, Some(&meta));

        let (rrf_a, max_a) = agg["a"];
        assert!((max_a - 0.9).abs() < 1e-6);
        assert!((rrf_a - (1.0 / 60.0 + 1.0 / 61.0)).abs() < 1e-6);

        let (rrf_b, max_b) = agg["b"];
        assert!((max_b - 0.8).abs() < 1e-6);
        assert!((rrf_b - 1.0 / 60.0).abs() < 1e-6);
    }

    fn sample_lexical_index() -> LexicalIndex {
        let ids = vec!["rust-guide".to_string(), "other-doc".to_string()];
        let tags = vec!["rust".to_string()];
        let docs = vec![
            DocumentFields { title: "Rust Guide", content: "how to use rust", tags: &tags, aliases: &[] },
            DocumentFields { title: "Other Doc", content: "unrelated content", tags: &[], aliases: &[] },
        ];
        LexicalIndex::build(ids, &docs)
    }

    #[test]
    fn title_matching_document_gets_boosted_lexical_score() {
        let idx = sample_lexical_index();
        let field_hits = vec![FieldHits { field: Field::Title, rows: vec![0, 1] }];
        let scored = aggregate_lexical(&idx, &field_hits, &["rust".to_string()]);
        assert!(scored["rust-guide"] > scored["other-doc"]);
    }

    #[test]
    fn lexical_mode_drops_semantic_term_when_no_semantic_hits() {
        let idx = sample_lexical_index();
        let field_hits = vec![FieldHits { field: Field::Title, rows: vec![0] }];
        let results = fuse(Mode::Lexical, &FusionWeights::default(), &idx, &field_hits, &["rust".to_string()], &[], &[], None);
        assert_eq!(results[0].doc_id, "rust-guide");
        assert!(results[0].max_sem_percent.is_none());
    }

    #[test]
    fn semantic_mode_weights_semantic_over_lexical() {
        let idx = sample_lexical_index();
        let field_hits = vec![FieldHits { field: Field::Title, rows: vec![1] }];
        let chunk_ids = vec!["rust-guide".to_string()];
        let hits = vec![SearchHit { id: 0, score: 0.95 }];

        let results = fuse(Mode::Semantic, &FusionWeights::default(), &idx, &field_hits, &["rust".to_string()], &hits, &chunk_ids, None);
        assert_eq!(results[0].doc_id, "rust-guide");
        assert!(results[0].max_sem_percent.unwrap() > 90.0);
    }

    #[test]
    fn results_are_truncated_to_top_ten() {
        let ids: Vec<String> = (0..20).map(|i| format!("doc-{i}")).collect();
        let docs: Vec<DocumentFields> = (0..20)
            .map(|_| DocumentFields { title: "x", content: "y", tags: &[], aliases: &[] })
            .collect();
        let idx = LexicalIndex::build(ids.clone(), &docs);

        let rows: Vec<u32> = (0..20).collect();
        let field_hits = vec![FieldHits { field: Field::Content, rows }];
        let results = fuse(Mode::Lexical, &FusionWeights::default(), &idx, &field_hits, &[], &[], &[], None);
        assert_eq!(results.len(), 10);
    }
}
