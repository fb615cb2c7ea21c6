//! Binary graph blob layout: per level, `indptr` (uint32 LE) then `indices`
//! (uint32 LE), levels concatenated in ascending order. The manifest records
//! each section's absolute byte offset, element count, and byte length so a
//! reader can slice the blob without re-deriving layout.

use super::{HnswError, HnswGraph, LevelGraph};

#[derive(Debug, Clone, PartialEq)]
pub struct ByteRange {
    pub offset: u64,
    pub elements: u64,
    pub byte_length: u64,
}

#[derive(Debug, Clone)]
pub struct LevelByteRange {
    pub level: usize,
    pub indptr: ByteRange,
    pub indices: ByteRange,
}

/// The raw graph blob plus the per-level byte ranges destined for the manifest.
#[derive(Debug, Clone)]
pub struct GraphBlob {
    pub bytes: Vec<u8>,
    pub levels: Vec<LevelByteRange>,
}

/// Serialize a graph to its wire layout. Section offsets fall out of simple
/// concatenation since every element is already 4 bytes wide.
pub fn write_graph_blob(graph: &HnswGraph) -> GraphBlob {
    let mut bytes = Vec::new();
    let mut levels = Vec::with_capacity(graph.levels.len());

    for (level, lg) in graph.levels.iter().enumerate() {
        let indptr_offset = bytes.len() as u64;
        for &v in &lg.indptr {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let indptr_byte_length = (bytes.len() as u64) - indptr_offset;

        let indices_offset = bytes.len() as u64;
        for &v in &lg.indices {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let indices_byte_length = (bytes.len() as u64) - indices_offset;

        levels.push(LevelByteRange {
            level,
            indptr: ByteRange {
                offset: indptr_offset,
                elements: lg.indptr.len() as u64,
                byte_length: indptr_byte_length,
            },
            indices: ByteRange {
                offset: indices_offset,
                elements: lg.indices.len() as u64,
                byte_length: indices_byte_length,
            },
        });
    }

    GraphBlob { bytes, levels }
}

/// Reconstruct a graph from a blob and the manifest's level descriptors.
/// `m`/`ef_construction`/`entry_point`/`max_level` come from the manifest's
/// `hnsw` object directly, not from the blob.
pub fn read_graph_blob(
    bytes: &[u8],
    levels_desc: &[LevelByteRange],
    m: usize,
    ef_construction: usize,
    entry_point: i64,
    max_level: i32,
) -> Result<HnswGraph, HnswError> {
    let mut levels = Vec::with_capacity(levels_desc.len());
    for desc in levels_desc {
        let indptr = read_u32_range(bytes, &desc.indptr)?;
        let indices = read_u32_range(bytes, &desc.indices)?;
        if indptr.is_empty() {
            return Err(HnswError::Malformed(format!(
                "level {} has an empty indptr section",
                desc.level
            )));
        }
        for w in indptr.windows(2) {
            if w[1] < w[0] {
                return Err(HnswError::Malformed(format!(
                    "level {} indptr is not monotone non-decreasing",
                    desc.level
                )));
            }
        }
        let last = *indptr.last().unwrap() as usize;
        if last != indices.len() {
            return Err(HnswError::Malformed(format!(
                "level {} indptr tail ({last}) does not match indices length ({})",
                desc.level,
                indices.len()
            )));
        }
        levels.push(LevelGraph { indptr, indices });
    }

    Ok(HnswGraph {
        m,
        m0: m * 2,
        ef_construction,
        entry_point,
        max_level,
        levels,
    })
}

fn read_u32_range(bytes: &[u8], range: &ByteRange) -> Result<Vec<u32>, HnswError> {
    if range.byte_length % 4 != 0 {
        return Err(HnswError::Malformed(
            "graph blob byte range is not 4-byte aligned".into(),
        ));
    }
    let start = range.offset as usize;
    let end = start
        .checked_add(range.byte_length as usize)
        .ok_or_else(|| HnswError::Malformed("graph blob byte range overflows".into()))?;
    let slice = bytes
        .get(start..end)
        .ok_or_else(|| HnswError::Malformed("graph blob byte range out of bounds".into()))?;

    let mut out = Vec::with_capacity(range.elements as usize);
    for chunk in slice.chunks_exact(4) {
        out.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}
