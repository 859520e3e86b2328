//! Embedding providers.
//!
//! Supports OpenAI-compatible embedding endpoints (including self-hosted
//! servers that speak the same protocol) and a deterministic local hashing
//! embedder.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{EmbeddingError, Result};
use crate::similarity::normalize;
use crate::{Embedding, PROBE_TEXT};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Trait for embedding providers.
///
/// Implementations must be stateless with respect to the text they embed:
/// the same input always yields the same vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Get the model this provider embeds with.
    fn model(&self) -> &str;

    /// Generate an embedding for the given text.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Generate embeddings for multiple texts, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Check if the provider is available (API key set, etc.).
    fn is_available(&self) -> bool {
        true
    }
}

/// Determine a provider's output dimension by embedding [`PROBE_TEXT`].
pub async fn probe_dimension(provider: &dyn EmbeddingProvider) -> Result<usize> {
    let probe = provider.embed(PROBE_TEXT).await?;
    if probe.is_empty() {
        return Err(EmbeddingError::InvalidResponse(format!(
            "provider {} returned an empty probe embedding",
            provider.name()
        )));
    }
    debug!("Provider {} embeds into {} dimensions", provider.name(), probe.len());
    Ok(probe.len())
}

/// OpenAI-compatible embedding provider.
pub struct OpenAIProvider {
    /// API key.
    api_key: Option<String>,

    /// API base URL.
    base_url: String,

    /// HTTP client.
    client: reqwest::Client,

    /// Model to request.
    model: String,

    /// Output dimensions (if supported by the model).
    dimensions: Option<usize>,
}

impl OpenAIProvider {
    /// Create a new OpenAI provider.
    pub fn new() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            base_url: OPENAI_BASE_URL.to_string(),
            client: reqwest::Client::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
        }
    }

    /// Set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Request a specific output dimension.
    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    /// Self-hosted endpoints usually run without a key; the hosted API does not.
    fn requires_api_key(&self) -> bool {
        self.base_url == OPENAI_BASE_URL
    }

    async fn request(&self, input: serde_json::Value) -> Result<Vec<Embedding>> {
        if self.requires_api_key() && self.api_key.is_none() {
            return Err(EmbeddingError::ProviderNotConfigured);
        }

        let mut body = serde_json::json!({
            "input": input,
            "model": self.model,
        });
        if let Some(dims) = self.dimensions {
            body["dimensions"] = serde_json::json!(dims);
        }

        let mut request = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(60);

            return Err(EmbeddingError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ApiRequest(format!(
                "API error ({status}): {error_text}"
            )));
        }

        let mut result: OpenAIEmbeddingResponse = response.json().await?;
        // Servers are allowed to return items out of order.
        result.data.sort_by_key(|item| item.index);

        Ok(result.data.into_iter().map(|item| item.embedding).collect())
    }
}

impl Default for OpenAIProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        debug!("Generating embedding with model: {}", self.model);

        self.request(serde_json::json!(text))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("No embedding in response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            "Generating batch embeddings for {} texts with model: {}",
            texts.len(),
            self.model
        );

        let embeddings = self.request(serde_json::json!(texts)).await?;
        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidResponse(format!(
                "requested {} embeddings, received {}",
                texts.len(),
                embeddings.len()
            )));
        }

        info!("Generated {} batch embeddings", embeddings.len());
        Ok(embeddings)
    }

    fn is_available(&self) -> bool {
        !self.requires_api_key() || self.api_key.is_some()
    }
}

/// OpenAI API response format.
#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Deterministic local embedder based on feature hashing.
///
/// Character unigrams and bigrams are hashed into a fixed number of signed
/// buckets and the result is normalized to unit length. Identical texts map
/// to identical vectors, which makes this provider suitable for offline
/// catalogs and tests. It carries no semantic knowledge.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    /// Create a hashing provider with the given output dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Output dimension.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_sync(&self, text: &str) -> Embedding {
        let mut embedding = vec![0.0f32; self.dimension];
        let chars: Vec<char> = text.chars().collect();

        for (i, c) in chars.iter().enumerate() {
            self.accumulate(&mut embedding, &[*c]);
            if let Some(next) = chars.get(i + 1) {
                self.accumulate(&mut embedding, &[*c, *next]);
            }
        }

        normalize(&mut embedding);
        embedding
    }

    fn accumulate(&self, embedding: &mut [f32], gram: &[char]) {
        let hash = fnv1a(gram);
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
        embedding[bucket] += sign;
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(gram: &[char]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for c in gram {
        let mut buf = [0u8; 4];
        for byte in c.encode_utf8(&mut buf).as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        "char-bigram-hashing"
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|text| self.embed_sync(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::squared_l2;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_hashing_provider_is_deterministic() {
        let provider = HashingProvider::new(64);
        let a = provider.embed("开发者没有配置背板图").await.unwrap();
        let b = provider.embed("开发者没有配置背板图").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(squared_l2(&a, &b).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_hashing_provider_separates_texts() {
        let provider = HashingProvider::new(64);
        let a = provider.embed("甲方提供背板图").await.unwrap();
        let b = provider.embed("completely different").await.unwrap();
        assert!(squared_l2(&a, &b).unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_probe_dimension() {
        let provider = HashingProvider::new(32);
        assert_eq!(probe_dimension(&provider).await.unwrap(), 32);
    }

    #[test]
    fn test_openai_requires_key_only_for_hosted_api() {
        let hosted = OpenAIProvider {
            api_key: None,
            ..OpenAIProvider::new()
        };
        assert!(!hosted.is_available());

        let local = OpenAIProvider {
            api_key: None,
            ..OpenAIProvider::new()
        }
        .with_base_url("http://localhost:8000/v1/");
        assert!(local.is_available());
        assert_eq!(local.base_url, "http://localhost:8000/v1");
    }
}
