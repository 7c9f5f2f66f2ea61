//! Vector math shared by clustering, similarity grouping and search.

use crate::records::{FileRecord, RecordTable};
use crate::semantic::cache::CacheSnapshot;

/// Compute L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in [-1, 1]. Zero-norm input scores 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Scale to unit length in place; zero vectors are left alone.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm >= f32::EPSILON {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Component-wise mean. `None` for an empty set.
pub fn mean<'a>(vectors: impl IntoIterator<Item = &'a [f32]>, dimensions: usize) -> Option<Vec<f32>> {
    let mut sum = vec![0.0f32; dimensions];
    let mut count = 0usize;
    for v in vectors {
        sum.iter_mut().zip(v).for_each(|(s, x)| *s += x);
        count += 1;
    }
    if count == 0 {
        return None;
    }
    sum.iter_mut().for_each(|s| *s /= count as f32);
    Some(sum)
}

/// A file record paired with its cached vector, if it has one.
#[derive(Debug, Clone, Copy)]
pub struct IndexedFile<'a> {
    pub record: &'a FileRecord,
    pub vector: Option<&'a [f32]>,
}

/// Join records with the vectors for their current fingerprint, ordered by path.
pub fn join<'a>(table: &'a RecordTable, cache: &'a CacheSnapshot) -> Vec<IndexedFile<'a>> {
    table
        .iter()
        .map(|record| IndexedFile {
            record,
            vector: cache.vector(&record.fingerprint),
        })
        .collect()
}
