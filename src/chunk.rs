//! Size+overlap chunker with whitespace snapping.
//!
//! Grounded on the teacher's token-window splitter (`embedder::split_into_windows`),
//! generalized from a tokenizer-bound window to the spec's character-bound window
//! with whitespace-aware boundary snapping.

use crate::types::Chunk;

/// Chunking parameters. `size` and `overlap` are in characters.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub size: usize,
    pub overlap: usize,
    pub disabled: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 512,
            overlap: 128,
            disabled: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("chunk overlap ({overlap}) must be strictly between 0 and chunk size ({size})")]
    InvalidOverlap { size: usize, overlap: usize },
}

impl ChunkConfig {
    fn validate(&self) -> Result<(), ChunkerError> {
        if self.disabled {
            return Ok(());
        }
        if self.overlap == 0 || self.overlap >= self.size {
            return Err(ChunkerError::InvalidOverlap {
                size: self.size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }
}

/// Fraction of `size` within which a window boundary may snap to whitespace.
const SNAP_FRACTION: f64 = 0.10;

/// Split a document body into an ordered list of chunks. Chunk order defines
/// row order for the entire build pipeline — callers must preserve it.
pub fn chunk_body(parent_slug: &str, body: &str, cfg: &ChunkConfig) -> Result<Vec<Chunk>, ChunkerError> {
    cfg.validate()?;

    if cfg.disabled || body.is_empty() {
        return Ok(vec![Chunk {
            parent_slug: parent_slug.to_string(),
            chunk_id: 0,
            text: body.to_string(),
        }]);
    }

    let bytes = body.as_bytes();
    let len = bytes.len();
    let stride = cfg.size.saturating_sub(cfg.overlap).max(1);
    let snap_window = ((cfg.size as f64) * SNAP_FRACTION) as usize;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chunk_id = 0u32;

    while start < len {
        let target_end = (start + cfg.size).min(len);
        let end = if target_end >= len {
            len
        } else {
            snap_to_whitespace(body, target_end, snap_window)
        };

        let snapped_start = if start == 0 {
            0
        } else {
            snap_to_whitespace(body, start, snap_window)
        };

        let text = body[snapped_start..end].to_string();
        if !text.is_empty() {
            chunks.push(Chunk {
                parent_slug: parent_slug.to_string(),
                chunk_id,
                text,
            });
            chunk_id += 1;
        }

        if end >= len {
            break;
        }
        // Advance from the *unsnapped* start by stride, never letting the
        // stride guarantee (stride >= 1) be violated by snapping.
        let next = start + stride;
        start = next.max(start + 1);
    }

    if chunks.is_empty() {
        chunks.push(Chunk {
            parent_slug: parent_slug.to_string(),
            chunk_id: 0,
            text: body.to_string(),
        });
    }

    Ok(chunks)
}

/// Snap a byte offset to the nearest whitespace character within `window` bytes,
/// preferring the closest match on either side. Falls back to `pos` (and, failing
/// that, the nearest char boundary) if no whitespace is found in range.
fn snap_to_whitespace(body: &str, pos: usize, window: usize) -> usize {
    if window == 0 || pos == 0 || pos >= body.len() {
        return floor_char_boundary(body, pos);
    }
    let lo = pos.saturating_sub(window);
    let hi = (pos + window).min(body.len());

    let bytes = body.as_bytes();
    let mut best: Option<(usize, usize)> = None; // (distance, index)
    for i in lo..hi {
        if bytes[i].is_ascii_whitespace() && body.is_char_boundary(i) {
            let dist = pos.abs_diff(i);
            if best.is_none_or(|(d, _)| dist < d) {
                best = Some((dist, i));
            }
        }
    }
    match best {
        Some((_, i)) => i,
        None => floor_char_boundary(body, pos),
    }
}

fn floor_char_boundary(body: &str, mut pos: usize) -> usize {
    pos = pos.min(body.len());
    while pos > 0 && !body.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}
