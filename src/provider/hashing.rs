//! Offline feature-hashing embedder.
//!
//! Words and character trigrams are hashed into a fixed number of signed
//! buckets and the result is L2-normalized. Identical text always yields the
//! identical vector, and texts sharing vocabulary land close together. No
//! model, no network.

use super::{EmbeddingProvider, ProviderError};
use crate::semantic::vectors::normalize;

const PROVIDER: &str = "hashing";
const MAX_BATCH_SIZE: usize = 64;
/// Seed of the second hash that picks a bucket's sign
const SIGN_SEED: u32 = 0x9e37_79b9;
const TRIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingProvider {
    dimensions: usize,
    model: String,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> Self {
        HashingProvider {
            dimensions: dimensions.max(1),
            model: format!("hash-{dimensions}"),
        }
    }

    fn add(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let bucket = crc32fast::hash(feature.as_bytes()) as usize % self.dimensions;
        let mut sign_hasher = crc32fast::Hasher::new_with_initial(SIGN_SEED);
        sign_hasher.update(feature.as_bytes());
        let sign = if sign_hasher.finalize() & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
        {
            self.add(&mut vector, &word, 1.0);

            let padded: Vec<char> = format!("^{word}$").chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add(&mut vector, &gram, TRIGRAM_WEIGHT);
            }
        }

        normalize(&mut vector);
        vector
    }
}

impl EmbeddingProvider for HashingProvider {
    fn id(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH_SIZE
    }

    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(inputs.iter().map(|text| self.embed_text(text)).collect())
    }
}
