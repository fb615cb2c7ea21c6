//! Query scheduler: a monotonically increasing sequence counter plus
//! edit-kind-dependent debounce delays. Supersession is checked by comparing
//! a captured token against the counter's current value at each suspension
//! point in the engine, not by this module directly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    /// Current term is longer and the previous term is a prefix of it.
    Extension,
    /// Neither term is a prefix of the other.
    Replacement,
    /// Current term is shorter and is itself a prefix of the previous term.
    Retraction,
    Other,
}

/// Classify an edit from the previous and current query text.
pub fn classify_edit(prev: &str, current: &str) -> EditKind {
    if current.len() > prev.len() && current.starts_with(prev) {
        EditKind::Extension
    } else if current.len() < prev.len() && prev.starts_with(current) {
        EditKind::Retraction
    } else if !current.starts_with(prev) && !prev.starts_with(current) {
        EditKind::Replacement
    } else {
        EditKind::Other
    }
}

/// Debounce delay for an edit of the given kind and resulting query length.
/// `semantic_enabled` adds the semantic-mode surcharge where the table calls
/// for one. A guard that fails (e.g. an Extension of length ≤ 2) falls
/// through to the "otherwise" bucket, per the table's structure.
pub fn debounce_delay(kind: EditKind, len: usize, semantic_enabled: bool) -> Duration {
    let ms: u64 = match kind {
        EditKind::Extension if len > 2 => 200 + if semantic_enabled { 60 } else { 0 },
        EditKind::Replacement if len > 3 => 120,
        EditKind::Retraction => 90,
        _ => 200 + if semantic_enabled { 40 } else { 0 },
    };
    Duration::from_millis(ms)
}

/// A monotonically increasing token source shared between the UI and the
/// background query worker. Each keystroke mints a new token; a response is
/// rendered only if its token is still the latest at every await checkpoint.
#[derive(Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next token. The first call returns 1, so token 0 never
    /// collides with an unset "no query yet" sentinel.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.current() == token
    }
}
