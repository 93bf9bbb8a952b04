use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::Embedder;
use crate::cache::EmbeddingCache;
use crate::config::EmbeddingsConfig;
use crate::error::{KgragError, Result};

/// OpenAI's per-request input limit
const MAX_BATCH: usize = 2048;
const MAX_RETRIES: usize = 3;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Error from one request, tagged with whether a retry could help.
struct RequestError {
    retryable: bool,
    error: KgragError,
}

/// OpenAI-compatible embeddings client
///
/// Splits input into `batch_size` requests, retries rate-limit and server
/// errors with exponential backoff, and checks every returned vector against
/// the configured dimension.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    batch_size: usize,
    dimensions: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingsConfig, cache: Option<Arc<EmbeddingCache>>) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.is_empty() && config.base_url.contains("api.openai.com") {
            return Err(KgragError::Config(format!(
                "Environment variable {} not set",
                config.api_key_env
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KgragError::Embedding(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            batch_size: config.batch_size.clamp(1, MAX_BATCH),
            dimensions: config.dimensions,
            cache,
        })
    }

    async fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RequestError> {
        // Only the text-embedding-3 family accepts a requested width.
        let dimensions = self.model.starts_with("text-embedding-3").then_some(self.dimensions);
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions,
        };

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await.map_err(|e| RequestError {
            retryable: e.is_timeout() || e.is_connect(),
            error: KgragError::Embedding(format!("Network error: {}", e)),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(RequestError {
                retryable: status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
                error: KgragError::Embedding(format!("Embedding API error {}: {}", status, body)),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| RequestError {
            retryable: false,
            error: KgragError::Embedding(format!("Failed to parse response: {}", e)),
        })?;
        parsed.data.sort_by_key(|d| d.index);

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if vectors.len() != texts.len() {
            return Err(RequestError {
                retryable: false,
                error: KgragError::Embedding(format!(
                    "Expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                )),
            });
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(RequestError {
                retryable: false,
                error: KgragError::Embedding(format!(
                    "Unexpected embedding dimension: expected {}, got {}",
                    self.dimensions,
                    bad.len()
                )),
            });
        }
        Ok(vectors)
    }

    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.request(texts).await {
                Ok(vectors) => {
                    log::debug!(
                        "Embedded {} texts in {:?} (attempt {})",
                        texts.len(),
                        start.elapsed(),
                        attempt + 1
                    );
                    return Ok(vectors);
                }
                Err(e) if e.retryable && attempt < MAX_RETRIES => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, MAX_RETRIES, e.error);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e.error),
            }
        }
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            all.extend(self.request_with_retry(chunk).await?);

            // Small pause between full batches to stay under rate limits
            if chunk.len() == self.batch_size {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(all)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("Cache hit for query: {}", text);
                return Ok(cached);
            }
        }

        let mut vectors = self.request_with_retry(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| KgragError::Embedding("Empty response from embedding API".to_string()))?;

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), vector.clone());
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.model
    }
}
