//! Embedding service seam.

mod hashing;
mod openai;

pub use hashing::HashingEmbedder;
pub use openai::OpenAIEmbedder;

use async_trait::async_trait;
use std::sync::Arc;

use crate::cache::EmbeddingCache;
use crate::config::EmbeddingsConfig;
use crate::error::{KgragError, Result};

/// Turns text into fixed-width vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `texts`, returning one vector per input in input order.
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query. Implementations may cache.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| KgragError::Embedding("Empty embedding response".to_string()))
    }

    fn dimensions(&self) -> usize;

    fn name(&self) -> &str;
}

/// Build the configured embedder. Query embeddings go through an LRU cache
/// of `cache_capacity` entries.
pub fn from_config(config: &EmbeddingsConfig) -> Result<Arc<dyn Embedder>> {
    let cache = Arc::new(EmbeddingCache::new(config.cache_capacity));
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimensions).with_cache(cache))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config, Some(cache))?)),
        other => Err(KgragError::Config(format!(
            "Unknown embeddings provider '{}' (expected 'openai' or 'hashing')",
            other
        ))),
    }
}

/// Scale `vector` to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_hashing() {
        let config = EmbeddingsConfig {
            dimensions: 64,
            ..EmbeddingsConfig::default()
        };
        let embedder = from_config(&config).unwrap();
        assert_eq!(embedder.dimensions(), 64);
        assert_eq!(embedder.name(), "hashing");
    }

    #[test]
    fn test_from_config_unknown_provider() {
        let config = EmbeddingsConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingsConfig::default()
        };
        let err = from_config(&config).err().unwrap();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
