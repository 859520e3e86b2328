//! Service façade: catalog lifecycle plus admission-gated retrieval and answering.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use exemplar_embeddings::{EmbeddingProvider, HashingProvider, OpenAIProvider};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::admission::{Admission, AdmissionController, AdmissionStats};
use crate::catalog::{CatalogHandle, IndexCatalog, RuleSummary};
use crate::config::{EmbeddingConfig, EmbeddingProviderType, ServiceConfig};
use crate::engine::{RankedExemplar, RetrievalEngine, RetrievalResults};
use crate::error::{Result, RetrievalError};
use crate::exemplar::ExemplarStore;
use crate::generation::{Reranker, TextGenerator, collect_stream, render_prompt, rerank};
use crate::knowledge_base::load_knowledge_base;

/// A retrieval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub rule_id: String,
    pub query: String,

    /// Results per polarity. The configured default when unset.
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl RetrievalRequest {
    /// Create a request that uses the default `top_k`.
    pub fn new(rule_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            query: query.into(),
            top_k: None,
        }
    }

    /// Set `top_k`.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

/// Response to a [`RetrievalRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResponse {
    pub rule_id: String,
    pub query: String,
    pub positive: Vec<RankedExemplar>,
    pub negative: Vec<RankedExemplar>,
    pub total_results: usize,
    pub processing_time_ms: u64,
}

/// Generated answer with the exemplars it was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub rule_id: String,
    pub query: String,
    pub answer: String,
    pub positive: Vec<RankedExemplar>,
    pub negative: Vec<RankedExemplar>,
    pub processing_time_ms: u64,
}

/// Service health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub catalog_loaded: bool,
    pub rules: usize,
    pub dimension: Option<usize>,
    pub embedder: String,
    pub admission: AdmissionStats,
}

/// Build an embedder from configuration.
pub fn embedder_from_config(config: &EmbeddingConfig) -> Arc<dyn EmbeddingProvider> {
    match config.provider {
        EmbeddingProviderType::OpenAI => {
            let mut provider = OpenAIProvider::new();
            if let Ok(key) = std::env::var(&config.api_key_env) {
                provider = provider.with_api_key(key);
            }
            if let Some(base_url) = &config.base_url {
                provider = provider.with_base_url(base_url);
            }
            if let Some(model) = &config.model {
                provider = provider.with_model(model);
            }
            Arc::new(provider)
        }
        EmbeddingProviderType::Hashing => Arc::new(HashingProvider::new(config.hashing_dimension)),
    }
}

/// Exemplar retrieval service.
///
/// Owns the active catalog, the admission gate and the optional generation
/// backends. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RagService {
    config: ServiceConfig,
    engine: RetrievalEngine,
    admission: AdmissionController,
    generator: Option<Arc<dyn TextGenerator>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl RagService {
    /// Create a service with no catalog loaded.
    pub fn new(config: ServiceConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        let admission = AdmissionController::new(&config.admission);
        Self {
            engine: RetrievalEngine::new(CatalogHandle::new(), embedder),
            admission,
            config,
            generator: None,
            reranker: None,
        }
    }

    /// Create a service with the embedder named in `config`.
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let embedder = embedder_from_config(&config.embedding);
        Ok(Self::new(config, embedder))
    }

    /// Set the text generator used by [`RagService::answer`].
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Set the reranker used by [`RagService::answer`].
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// The service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// The active catalog handle.
    pub fn catalog(&self) -> &CatalogHandle {
        self.engine.catalog()
    }

    /// The admission controller.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Build a catalog from a knowledge-base file and make it active.
    ///
    /// Returns the number of rules. On failure the active catalog is unchanged.
    pub async fn build(&self, knowledge_base: impl AsRef<Path>) -> Result<usize> {
        let store = load_knowledge_base(knowledge_base).await?;
        self.build_from_store(store).await
    }

    /// Build a catalog from an in-memory store and make it active.
    pub async fn build_from_store(&self, store: ExemplarStore) -> Result<usize> {
        let catalog = IndexCatalog::build(store, self.engine.embedder().as_ref()).await?;
        let rules = catalog.len();
        self.catalog().swap(catalog).await;
        Ok(rules)
    }

    /// Load a persisted catalog and make it active.
    pub async fn load(&self, path: impl AsRef<Path>) -> Result<usize> {
        let catalog = IndexCatalog::load(path).await?;
        let rules = catalog.len();
        self.catalog().swap(catalog).await;
        Ok(rules)
    }

    /// Persist the active catalog.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let catalog = self
            .catalog()
            .current()
            .await
            .ok_or(RetrievalError::CatalogNotLoaded)?;
        catalog.save(path).await
    }

    /// Retrieve exemplars for a request, gated by admission control.
    pub async fn retrieve(&self, request: RetrievalRequest) -> Result<Admission<RetrievalResponse>> {
        let started = Instant::now();
        let top_k = self.resolve_top_k(request.top_k)?;

        self.admission
            .run(async {
                let results = self
                    .engine
                    .retrieve(&request.rule_id, &request.query, top_k)
                    .await?;
                let total_results = results.len();
                debug!(
                    "Retrieved {total_results} exemplars for rule {}",
                    request.rule_id
                );

                Ok::<_, RetrievalError>(RetrievalResponse {
                    rule_id: request.rule_id.clone(),
                    query: request.query.clone(),
                    positive: results.positive,
                    negative: results.negative,
                    total_results,
                    processing_time_ms: elapsed_ms(started),
                })
            })
            .await
            .transpose()
    }

    /// Retrieve, optionally rerank, and generate an answer under one admission slot.
    pub async fn answer(&self, request: RetrievalRequest) -> Result<Admission<AnswerResponse>> {
        let started = Instant::now();
        let top_k = self.resolve_top_k(request.top_k)?;
        let generator = self
            .generator
            .clone()
            .ok_or_else(|| RetrievalError::Generation("no text generator configured".to_string()))?;

        self.admission
            .run(async {
                let mut results = self
                    .engine
                    .retrieve(&request.rule_id, &request.query, top_k)
                    .await?;
                if let Some(reranker) = &self.reranker {
                    results = rerank(
                        reranker.as_ref(),
                        &request.query,
                        results,
                        self.config.query.rerank_top_k,
                    )
                    .await?;
                }

                let prompt = render_prompt(&request.rule_id, &request.query, &results);
                debug!("Generating with {} ({} chars of prompt)", generator.name(), prompt.len());
                let answer = collect_stream(generator.generate(&prompt).await?).await?;

                let RetrievalResults { positive, negative } = results;
                Ok::<_, RetrievalError>(AnswerResponse {
                    rule_id: request.rule_id.clone(),
                    query: request.query.clone(),
                    answer,
                    positive,
                    negative,
                    processing_time_ms: elapsed_ms(started),
                })
            })
            .await
            .transpose()
    }

    /// Per-rule exemplar counts of the active catalog.
    pub async fn rules(&self) -> Result<Vec<RuleSummary>> {
        let catalog = self
            .catalog()
            .current()
            .await
            .ok_or(RetrievalError::CatalogNotLoaded)?;
        Ok(catalog.summaries())
    }

    /// Current service health.
    pub async fn health(&self) -> HealthStatus {
        let (catalog_loaded, rules, dimension) = match self.catalog().current().await {
            Some(catalog) => (true, catalog.len(), Some(catalog.dimension())),
            None => (false, 0, None),
        };
        HealthStatus {
            catalog_loaded,
            rules,
            dimension,
            embedder: self.engine.embedder().name().to_string(),
            admission: self.admission.stats(),
        }
    }

    fn resolve_top_k(&self, requested: Option<usize>) -> Result<usize> {
        let top_k = requested.unwrap_or(self.config.query.default_top_k);
        if top_k == 0 || top_k > self.config.query.max_top_k {
            return Err(RetrievalError::InvalidTopK(top_k));
        }
        Ok(top_k)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
