//! Embedding capability and an OpenAI-compatible HTTP implementation.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Turns text into vectors.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed multiple texts; the result has one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding returned"))
    }

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embedder for any `/embeddings` endpoint speaking the OpenAI format.
pub struct HttpEmbedder {
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    client: Client,
    endpoint: String,
    max_retries: u32,
}

impl HttpEmbedder {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        dimensions: usize,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            api_key,
            model: model.into(),
            dimensions,
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            max_retries: 3,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send embedding request with retry logic for rate limits.
    async fn send_request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let mut retry_count = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                "Sending embedding request for {} texts to {}",
                texts.len(),
                self.endpoint
            );

            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(ref key) = self.api_key {
                request = request.bearer_auth(key);
            }
            let response = request
                .send()
                .await
                .map_err(|e| anyhow!("Network error: {}", e))?;

            let status = response.status();

            if status.is_success() {
                let parsed: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| anyhow!("Failed to parse response: {}", e))?;
                return self.order_and_check(parsed, texts.len());
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > self.max_retries {
                    return Err(anyhow!("Rate limited after {} retries", self.max_retries));
                }

                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    "Rate limited, retrying after {} seconds (attempt {}/{})",
                    retry_after, retry_count, self.max_retries
                );

                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("API error ({}): {}", status.as_u16(), error_body));
        }
    }

    fn order_and_check(&self, response: EmbeddingResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
        let mut embeddings: Vec<(usize, Vec<f32>)> = response
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        embeddings.sort_by_key(|(idx, _)| *idx);

        if embeddings.len() != expected {
            return Err(anyhow!(
                "Expected {} embeddings, got {}",
                expected,
                embeddings.len()
            ));
        }
        if let Some((_, v)) = embeddings.iter().find(|(_, v)| v.len() != self.dimensions) {
            return Err(anyhow!(
                "Model {} returned {} dimensions, configured for {}",
                self.model,
                v.len(),
                self.dimensions
            ));
        }
        Ok(embeddings.into_iter().map(|(_, emb)| emb).collect())
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size()) {
            debug!("Embedding batch of {} texts", batch.len());
            all.extend(self.send_request(batch).await?);
        }
        Ok(all)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
