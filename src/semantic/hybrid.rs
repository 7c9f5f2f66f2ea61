//! Hybrid ranking combining semantic and lexical scores.
//!
//! A file's final score is a weighted sum:
//!   score = w * semantic + (1 - w) * lexical
//!
//! The semantic weight (w) controls the balance:
//! - w=0.0: pure keyword ranking
//! - w=0.6: 60% semantic, 40% lexical (default)
//! - w=1.0: pure cosine ranking over embedded files

use std::cmp::Ordering;

/// Default semantic weight for hybrid search.
pub const DEFAULT_SEMANTIC_WEIGHT: f32 = 0.6;

/// Per-file inputs to the blend.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored<T> {
    pub item: T,
    pub lexical: f32,
    /// Cosine against the query; `None` when the file has no vector
    pub semantic: Option<f32>,
    pub score: f32,
}

/// Whether a file may appear in results at all.
///
/// Files without a vector can only surface through keywords, and a pure
/// semantic query never surfaces them.
pub fn is_candidate(semantic: Option<f32>, lexical: f32, weight: f32) -> bool {
    (semantic.is_some() && weight > 0.0) || (lexical > 0.0 && weight < 1.0)
}

pub fn blend(semantic: Option<f32>, lexical: f32, weight: f32) -> f32 {
    let weight = weight.clamp(0.0, 1.0);
    weight * semantic.unwrap_or(0.0) + (1.0 - weight) * lexical
}

/// Blend, filter and rank. `key` provides the ascending tie-break.
pub fn rank<T, K: Ord>(
    inputs: impl IntoIterator<Item = (T, Option<f32>, f32)>,
    weight: f32,
    top_k: usize,
    key: impl Fn(&T) -> K,
) -> Vec<Scored<T>> {
    let weight = weight.clamp(0.0, 1.0);

    let mut results: Vec<Scored<T>> = inputs
        .into_iter()
        .filter(|(_, semantic, lexical)| is_candidate(*semantic, *lexical, weight))
        .map(|(item, semantic, lexical)| Scored {
            score: blend(semantic, lexical, weight),
            item,
            lexical,
            semantic,
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| key(&a.item).cmp(&key(&b.item)))
    });
    results.truncate(top_k);
    results
}
