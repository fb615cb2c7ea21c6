//! Hierarchical Navigable Small World (HNSW) graph: build, search, and
//! binary persistence in the CSR wire format the manifest describes.
//!
//! Every level's `indptr` is sized `rows + 1` rather than the level's node
//! count, so a neighbor lookup is a direct index by row id at every level
//! instead of a binary search over a sparse node list — rows absent from a
//! level simply own a zero-length slice. This keeps the reader free of any
//! side-channel "which rows are on this level" table while still satisfying
//! `max(indices) < rows` and monotone `indptr`.

mod build;
mod persist;
mod search;

pub use build::build_graph;
pub use persist::{read_graph_blob, write_graph_blob, ByteRange, GraphBlob, LevelByteRange};
pub use search::{brute_force, search, SearchHit};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HnswError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("graph blob is malformed: {0}")]
    Malformed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A vector source addressed by row id. Implemented over the asset loader's
/// contiguous fp32 buffer at query time and over an in-memory slice at build time.
pub trait VectorSource {
    fn dim(&self) -> usize;
    fn len(&self) -> usize;
    fn vector(&self, row: u32) -> &[f32];
}

/// A flat contiguous fp32 buffer, `dim` floats per row — the shape the asset
/// loader assembles shards into (`src/loader.rs`) and the shape the builder
/// consumes after embedding (`src/embedder.rs`).
pub struct FlatVectors<'a> {
    data: &'a [f32],
    dim: usize,
}

impl<'a> FlatVectors<'a> {
    pub fn new(data: &'a [f32], dim: usize) -> Self {
        debug_assert_eq!(data.len() % dim.max(1), 0);
        Self { data, dim }
    }
}

impl VectorSource for FlatVectors<'_> {
    fn dim(&self) -> usize {
        self.dim
    }

    fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    fn vector(&self, row: u32) -> &[f32] {
        let start = row as usize * self.dim;
        &self.data[start..start + self.dim]
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// One level's adjacency, CSR-encoded with `indptr` of length `rows + 1`.
#[derive(Debug, Clone)]
pub struct LevelGraph {
    pub indptr: Vec<u32>,
    pub indices: Vec<u32>,
}

impl LevelGraph {
    pub fn neighbors(&self, row: u32) -> &[u32] {
        let i = row as usize;
        if i + 1 >= self.indptr.len() {
            return &[];
        }
        let s = self.indptr[i] as usize;
        let e = self.indptr[i + 1] as usize;
        &self.indices[s..e]
    }
}

/// A built or loaded HNSW graph, ready to search.
#[derive(Debug, Clone)]
pub struct HnswGraph {
    pub m: usize,
    pub m0: usize,
    pub ef_construction: usize,
    /// -1 when the graph is empty (no entry point).
    pub entry_point: i64,
    /// -1 when the graph is empty.
    pub max_level: i32,
    /// `levels[l]` is the adjacency at level `l`, for `l` in `0..=max_level`.
    pub levels: Vec<LevelGraph>,
}

impl HnswGraph {
    pub fn is_empty(&self) -> bool {
        self.entry_point < 0
    }
}
