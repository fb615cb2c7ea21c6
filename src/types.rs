//! Core data model: documents, chunks, and embedding rows.
//!
//! A `Document` is an immutable input to the build pipeline; `Chunk`s are
//! derived from it and are the unit the embedder and HNSW graph operate on.

use serde::{Deserialize, Serialize};

/// An identified document from the corpus (the markdown pipeline's output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable slug, unique within the corpus.
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Full plain-text rendering of the document body.
    pub body: String,
}

/// A contiguous substring of a document's body, identified by
/// `(parent_slug, chunk_id)` where `chunk_id` is 0-based within the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub parent_slug: String,
    pub chunk_id: u32,
    pub text: String,
}

impl Chunk {
    /// The slug used to identify this chunk as a row in the manifest's `ids` array.
    ///
    /// Single-chunk documents (chunking disabled, or a document short enough to
    /// fit in one window) reuse the parent slug directly so they remain their
    /// own document under the `chunkMetadata` fallback (see `fusion::parent_of`).
    pub fn slug(&self) -> String {
        if self.chunk_id == 0 {
            self.parent_slug.clone()
        } else {
            format!("{}#{}", self.parent_slug, self.chunk_id)
        }
    }
}

/// A dense embedding row of dimension `d`, expected to be L2-normalized
/// (`‖v‖₂ = 1 ± 1e-5`) by the time it reaches the HNSW builder or searcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Vector(Vec<f32>);

impl Vector {
    pub fn new(data: Vec<f32>) -> Self {
        Self(data)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn norm(&self) -> f32 {
        self.0.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// L2-normalize in place. A zero vector is left untouched.
    pub fn normalize(&mut self) {
        let norm = self.norm();
        if norm > 0.0 {
            for x in &mut self.0 {
                *x /= norm;
            }
        }
    }

    pub fn dot(&self, other: &Vector) -> f32 {
        debug_assert_eq!(self.0.len(), other.0.len());
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}
