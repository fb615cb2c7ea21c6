//! Manifest JSON schema and the build-side writer that emits shards, the
//! graph blob, and the manifest itself (written last, so its presence on
//! disk signals a complete build).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::hnsw::{write_graph_blob, ByteRange, HnswError, HnswGraph, LevelByteRange};

pub const MANIFEST_VERSION: u32 = 1;
const FP32_BYTES: u64 = 4;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graph blob error: {0}")]
    Graph(#[from] HnswError),
    #[error("{ids} ids but {vectors} vector rows were supplied")]
    RowMismatch { ids: usize, vectors: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub dims: usize,
    pub dtype: String,
    pub normalized: bool,
    pub rows: usize,
    #[serde(rename = "shardSizeRows")]
    pub shard_size_rows: usize,
    pub vectors: VectorsSection,
    pub ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub titles: Option<Vec<String>>,
    #[serde(rename = "chunkMetadata", skip_serializing_if = "Option::is_none")]
    pub chunk_metadata: Option<HashMap<String, ChunkMeta>>,
    pub hnsw: HnswDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(rename = "parentSlug")]
    pub parent_slug: String,
    #[serde(rename = "chunkId")]
    pub chunk_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorsSection {
    pub dtype: String,
    pub rows: usize,
    pub dims: usize,
    pub shards: Vec<ShardDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub path: String,
    pub rows: usize,
    #[serde(rename = "rowOffset")]
    pub row_offset: usize,
    #[serde(rename = "byteLength")]
    pub byte_length: u64,
    #[serde(rename = "byteStride")]
    pub byte_stride: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswDescriptor {
    #[serde(rename = "M")]
    pub m: usize,
    #[serde(rename = "efConstruction")]
    pub ef_construction: usize,
    #[serde(rename = "entryPoint")]
    pub entry_point: i64,
    #[serde(rename = "maxLevel")]
    pub max_level: i32,
    pub graph: GraphDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub path: String,
    pub sha256: String,
    pub levels: Vec<GraphLevelDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphLevelDescriptor {
    pub level: usize,
    pub indptr: RangeDescriptor,
    pub indices: RangeDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub offset: u64,
    pub elements: u64,
    #[serde(rename = "byteLength")]
    pub byte_length: u64,
}

impl From<ByteRange> for RangeDescriptor {
    fn from(b: ByteRange) -> Self {
        Self {
            offset: b.offset,
            elements: b.elements,
            byte_length: b.byte_length,
        }
    }
}

impl From<RangeDescriptor> for ByteRange {
    fn from(r: RangeDescriptor) -> Self {
        Self {
            offset: r.offset,
            elements: r.elements,
            byte_length: r.byte_length,
        }
    }
}

impl From<LevelByteRange> for GraphLevelDescriptor {
    fn from(l: LevelByteRange) -> Self {
        Self {
            level: l.level,
            indptr: l.indptr.into(),
            indices: l.indices.into(),
        }
    }
}

impl From<GraphLevelDescriptor> for LevelByteRange {
    fn from(g: GraphLevelDescriptor) -> Self {
        Self {
            level: g.level,
            indptr: g.indptr.into(),
            indices: g.indices.into(),
        }
    }
}

/// Everything the writer needs: row-major, already L2-normalized vectors and
/// the graph built over them.
pub struct BuildOutput<'a> {
    pub dims: usize,
    pub shard_size_rows: usize,
    pub ids: Vec<String>,
    pub titles: Option<Vec<String>>,
    pub chunk_metadata: Option<HashMap<String, ChunkMeta>>,
    pub vectors: &'a [f32],
    pub graph: &'a HnswGraph,
}

/// Write shards, the graph blob, and finally the manifest into `dir`.
pub fn write_build_output(dir: &Path, out: &BuildOutput) -> Result<Manifest, ManifestError> {
    let rows = out.ids.len();
    if out.dims > 0 && out.vectors.len() != rows * out.dims {
        return Err(ManifestError::RowMismatch {
            ids: rows,
            vectors: out.vectors.len() / out.dims.max(1),
        });
    }
    std::fs::create_dir_all(dir)?;

    let mut shards = Vec::new();
    let byte_stride = out.dims as u64 * FP32_BYTES;
    let mut row_offset = 0usize;
    let mut shard_idx = 0usize;
    while row_offset < rows {
        let shard_rows = out.shard_size_rows.min(rows - row_offset);
        let start = row_offset * out.dims;
        let end = (row_offset + shard_rows) * out.dims;
        let slice = &out.vectors[start..end];

        let mut bytes = Vec::with_capacity(slice.len() * 4);
        for &v in slice {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let sha256 = sha256_hex(&bytes);
        let path = format!("shard-{shard_idx}.bin");
        std::fs::write(dir.join(&path), &bytes)?;

        shards.push(ShardDescriptor {
            path,
            rows: shard_rows,
            row_offset,
            byte_length: bytes.len() as u64,
            byte_stride,
            sha256,
        });

        row_offset += shard_rows;
        shard_idx += 1;
    }

    let blob = write_graph_blob(out.graph);
    let graph_sha256 = sha256_hex(&blob.bytes);
    std::fs::write(dir.join("graph.bin"), &blob.bytes)?;

    let manifest = Manifest {
        version: MANIFEST_VERSION,
        dims: out.dims,
        dtype: "fp32".to_string(),
        normalized: true,
        rows,
        shard_size_rows: out.shard_size_rows,
        vectors: VectorsSection {
            dtype: "fp32".to_string(),
            rows,
            dims: out.dims,
            shards,
        },
        ids: out.ids.clone(),
        titles: out.titles.clone(),
        chunk_metadata: out.chunk_metadata.clone(),
        hnsw: HnswDescriptor {
            m: out.graph.m,
            ef_construction: out.graph.ef_construction,
            entry_point: out.graph.entry_point,
            max_level: out.graph.max_level,
            graph: GraphDescriptor {
                path: "graph.bin".to_string(),
                sha256: graph_sha256,
                levels: blob.levels.into_iter().map(Into::into).collect(),
            },
        },
    };

    // Last write: presence of manifest.json is the completeness signal.
    let json = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(dir.join("manifest.json"), json)?;

    Ok(manifest)
}

pub fn read_manifest(path: &Path) -> Result<Manifest, ManifestError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Reconstruct the HNSW graph from manifest-declared level ranges and the
/// graph blob's raw bytes (fetched separately by the asset loader).
pub fn graph_from_manifest(manifest: &Manifest, graph_bytes: &[u8]) -> Result<HnswGraph, HnswError> {
    let levels: Vec<LevelByteRange> = manifest
        .hnsw
        .graph
        .levels
        .iter()
        .cloned()
        .map(Into::into)
        .collect();
    crate::hnsw::read_graph_blob(
        graph_bytes,
        &levels,
        manifest.hnsw.m,
        manifest.hnsw.ef_construction,
        manifest.hnsw.entry_point,
        manifest.hnsw.max_level,
    )
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
