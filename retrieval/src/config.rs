//! Configuration for the exemplar retrieval service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{Result, RetrievalError};

/// Configuration for the retrieval service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding the persisted catalog.
    pub catalog_dir: PathBuf,

    /// Knowledge-base JSON used by `build`.
    pub knowledge_base_path: PathBuf,

    /// Admission control limits.
    pub admission: AdmissionConfig,

    /// Query defaults and limits.
    pub query: QueryConfig,

    /// Embedding provider configuration.
    pub embedding: EmbeddingConfig,
}

impl ServiceConfig {
    /// Create a new configuration with default values.
    pub fn new(catalog_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog_dir: catalog_dir.into(),
            knowledge_base_path: PathBuf::from("results/complete_knowledge_base.json"),
            admission: AdmissionConfig::default(),
            query: QueryConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| RetrievalError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            RetrievalError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject limits the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.admission.max_concurrent == 0 {
            return Err(RetrievalError::Config(
                "admission.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.admission.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(RetrievalError::Config(format!(
                "admission.max_concurrent must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.query.default_top_k == 0 {
            return Err(RetrievalError::Config(
                "query.default_top_k must be at least 1".to_string(),
            ));
        }
        if self.query.default_top_k > self.query.max_top_k {
            return Err(RetrievalError::Config(format!(
                "query.default_top_k ({}) exceeds query.max_top_k ({})",
                self.query.default_top_k, self.query.max_top_k
            )));
        }
        if self.embedding.provider == EmbeddingProviderType::Hashing
            && self.embedding.hashing_dimension == 0
        {
            return Err(RetrievalError::Config(
                "embedding.hashing_dimension must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the knowledge-base path.
    pub fn with_knowledge_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.knowledge_base_path = path.into();
        self
    }

    /// Set the admission configuration.
    pub fn with_admission(mut self, config: AdmissionConfig) -> Self {
        self.admission = config;
        self
    }

    /// Set the query configuration.
    pub fn with_query(mut self, config: QueryConfig) -> Self {
        self.query = config;
        self
    }

    /// Set the embedding configuration.
    pub fn with_embedding(mut self, config: EmbeddingConfig) -> Self {
        self.embedding = config;
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new("vector_db")
    }
}

/// Limits for concurrent pipeline access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Requests allowed to run at once.
    pub max_concurrent: usize,

    /// Requests allowed to wait for a slot.
    pub max_queue_depth: usize,

    /// How long a waiting request may wait before it is turned away.
    pub wait_timeout_secs: u64,
}

impl AdmissionConfig {
    /// Wait timeout as a [`Duration`].
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Set the concurrency limit.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the queue depth.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the wait timeout in seconds.
    pub fn with_wait_timeout_secs(mut self, secs: u64) -> Self {
        self.wait_timeout_secs = secs;
        self
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            max_queue_depth: 64,
            wait_timeout_secs: 15,
        }
    }
}

/// Query defaults and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// `top_k` used when a request does not set one.
    pub default_top_k: usize,

    /// Largest `top_k` a request may ask for.
    pub max_top_k: usize,

    /// Results kept per polarity after reranking.
    pub rerank_top_k: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: 36,
            max_top_k: 100,
            rerank_top_k: 5,
        }
    }
}

/// Configuration for the embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Which provider to use.
    pub provider: EmbeddingProviderType,

    /// Base URL of an OpenAI-compatible endpoint. Hosted OpenAI when unset.
    pub base_url: Option<String>,

    /// Model name sent with embedding requests.
    pub model: Option<String>,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Output dimension of the hashing provider.
    pub hashing_dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderType::OpenAI,
            base_url: None,
            model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            hashing_dimension: 256,
        }
    }
}

/// Type of embedding provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderType {
    /// OpenAI-compatible embeddings API.
    #[serde(rename = "openai")]
    OpenAI,
    /// Deterministic local feature hashing.
    Hashing,
}
