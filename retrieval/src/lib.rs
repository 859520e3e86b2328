//! # Exemplar Retrieval
//!
//! Rule-scoped retrieval of labeled review exemplars:
//!
//! - **Knowledge Base**: Parse rule-keyed exemplar JSON into an [`ExemplarStore`]
//! - **Catalog**: Per-rule, per-polarity exact-search indices with
//!   crash-safe persistence
//! - **Admission**: Bounded FIFO gate in front of the pipeline
//! - **Generation**: Optional rerank and streamed answer generation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          RagService                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  request ──► AdmissionController ──► RetrievalEngine            │
//! │                 (slot / deny)             │                     │
//! │                                           ▼                     │
//! │                 CatalogHandle ──► IndexCatalog                  │
//! │                                   ├─ rule_<id>/positive.index   │
//! │                                   ├─ rule_<id>/negative.index   │
//! │                                   └─ exemplars.json             │
//! │                                           │                     │
//! │                                           ▼                     │
//! │                    Reranker? ──► render_prompt ──► TextGenerator │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use exemplar_retrieval::{Admission, RagService, RetrievalRequest, ServiceConfig};
//!
//! let service = RagService::from_config(ServiceConfig::default())?;
//! service.load("vector_db").await?;
//!
//! match service.retrieve(RetrievalRequest::new("6", "建议补充背板图").with_top_k(5)).await? {
//!     Admission::Granted(response) => println!("{} results", response.total_results),
//!     Admission::Denied(denial) => eprintln!("{denial}"),
//! }
//! ```

pub mod admission;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod exemplar;
pub mod generation;
pub mod knowledge_base;
pub mod service;

pub use admission::{Admission, AdmissionController, AdmissionStats, Denial, SlotGuard};
pub use catalog::{CatalogHandle, IndexCatalog, RuleEntry, RuleIndex, RuleSummary};
pub use config::{AdmissionConfig, EmbeddingConfig, EmbeddingProviderType, QueryConfig, ServiceConfig};
pub use engine::{RankedExemplar, RetrievalEngine, RetrievalResults};
pub use error::{Result, RetrievalError};
pub use exemplar::{
    AcceptedExemplar, ExemplarRecord, ExemplarStore, Polarity, RejectedExemplar, RuleExemplars,
    SourceSentence, StoredExemplar,
};
pub use generation::{Reranker, TextGenerator, TokenStream, render_prompt};
pub use knowledge_base::{load_knowledge_base, parse_knowledge_base};
pub use service::{
    AnswerResponse, HealthStatus, RagService, RetrievalRequest, RetrievalResponse,
    embedder_from_config,
};

// Re-export from dependencies for convenience
pub use exemplar_embeddings::{EmbeddingProvider, FlatL2Index, HashingProvider, OpenAIProvider};
