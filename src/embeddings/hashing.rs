use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::{normalize, Embedder};
use crate::cache::EmbeddingCache;
use crate::error::Result;

const TRIGRAM_WEIGHT: f32 = 0.5;

/// Local, deterministic feature-hashing embedder.
///
/// Each lowercase word and each of its character trigrams is hashed into a
/// signed bucket; the result is L2-normalized. Texts that share words score
/// high under cosine similarity, which is enough for offline use and tests.
pub struct HashingEmbedder {
    dimensions: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bucket = [0u8; 8];
        bucket.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[index] += sign * weight;
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimensions];
        let lowered = text.to_lowercase();

        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.add_feature(&mut vector, word, 1.0);

            let chars: Vec<char> = word.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let trigram: String = window.iter().collect();
                    self.add_feature(&mut vector, &format!("#{}", trigram), TRIGRAM_WEIGHT);
                }
            }
        }

        normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                return Ok(cached);
            }
        }
        let vector = self.embed_text(text);
        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "hashing"
    }
}
