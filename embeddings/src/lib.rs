//! # Embeddings
//!
//! Embedding generation and exact nearest-neighbour search for the exemplar
//! retrieval system.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors through an
//!   [`EmbeddingProvider`]
//! - **Exact Search**: [`FlatL2Index`] scans every stored vector by squared
//!   Euclidean distance
//! - **Persistence**: Indices round-trip through a compact binary format
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EmbeddingProvider ──► Embedding ──► FlatL2Index               │
//! │       │                    │              │                     │
//! │       ▼                    ▼              ▼                     │
//! │  OpenAI/Hashing     squared_l2      write_to / read_from       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod index;
pub mod provider;
pub mod similarity;

pub use error::{EmbeddingError, Result};
pub use index::{FlatL2Index, Neighbor};
pub use provider::{EmbeddingProvider, HashingProvider, OpenAIProvider, probe_dimension};
pub use similarity::{similarity_from_distance, squared_l2};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;

/// Text used to probe an embedder for its output dimension.
pub const PROBE_TEXT: &str = "1";
