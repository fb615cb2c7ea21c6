//! Vector similarity helpers shared by the brute-force fallback and fusion math.

/// Cosine similarity between two equal-length vectors. Returns 0.0 for a
/// zero-length vector rather than producing NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Affine map from a clamped cosine score in `[-1, 1]` to a display percentage
/// in `[0, 100]`, per the fusion module's `max_sem` display rule.
pub fn score_to_percent(score: f32) -> f32 {
    (score.clamp(-1.0, 1.0) + 1.0) / 2.0 * 100.0
}
