//! Per-rule vector index catalog.
//!
//! An [`IndexCatalog`] pairs every rule with two [`FlatL2Index`]es, one per
//! [`Polarity`], plus the [`ExemplarStore`] the vectors were built from.
//! Catalogs are immutable once built or loaded; updates go through
//! [`CatalogHandle::swap`].
//!
//! On disk a catalog is a directory:
//!
//! ```text
//! <root>/exemplars.json
//! <root>/rule_<id>/positive.index
//! <root>/rule_<id>/negative.index
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use exemplar_embeddings::{EmbeddingError, EmbeddingProvider, FlatL2Index, probe_dimension};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RetrievalError};
use crate::exemplar::{ExemplarStore, Polarity, RuleExemplars};
use crate::knowledge_base::validate_rule_id;

/// Name of the metadata document inside a catalog directory.
pub const METADATA_FILE: &str = "exemplars.json";

/// The two indices of one rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleIndex {
    pub positive: FlatL2Index,
    pub negative: FlatL2Index,
}

impl RuleIndex {
    /// The index for one polarity.
    pub fn index(&self, polarity: Polarity) -> &FlatL2Index {
        match polarity {
            Polarity::Positive => &self.positive,
            Polarity::Negative => &self.negative,
        }
    }
}

/// Everything the catalog holds for one rule.
#[derive(Debug, Clone, Copy)]
pub struct RuleEntry<'a> {
    pub rule_id: &'a str,
    pub indices: &'a RuleIndex,
    pub exemplars: &'a RuleExemplars,
}

/// Exemplar counts of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub rule_id: String,
    pub rule_name: String,
    pub positive: usize,
    pub negative: usize,
}

/// Storage format for the metadata document.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    /// Version of the storage format.
    version: u32,

    /// Dimension of every index in the catalog.
    dimension: usize,

    /// All rules with their exemplars, in catalog order.
    rules: ExemplarStore,
}

impl CatalogDocument {
    const CURRENT_VERSION: u32 = 1;
}

/// Rule-keyed collection of exact-search indices and their exemplars.
#[derive(Debug, Clone)]
pub struct IndexCatalog {
    indices: IndexMap<String, RuleIndex>,
    store: ExemplarStore,
    dimension: usize,
}

impl IndexCatalog {
    /// Build a catalog by embedding every exemplar in `store`.
    ///
    /// The embedder is probed once to fix the dimension. Any embedder
    /// failure aborts the whole build.
    pub async fn build(store: ExemplarStore, embedder: &dyn EmbeddingProvider) -> Result<Self> {
        if store.is_empty() {
            return Err(RetrievalError::EmptyKnowledgeBase);
        }

        let dimension = probe_dimension(embedder).await.map_err(|e| {
            error!("Failed to probe embedder {}: {e}", embedder.name());
            RetrievalError::from(e)
        })?;

        info!(
            "Building catalog for {} rules with {} ({dimension} dimensions)",
            store.len(),
            embedder.name()
        );

        let mut indices = IndexMap::with_capacity(store.len());
        for (rule_id, rule) in store.iter() {
            validate_rule_id(rule_id)?;
            let positive = embed_group(embedder, rule_id, rule, Polarity::Positive, dimension).await?;
            let negative = embed_group(embedder, rule_id, rule, Polarity::Negative, dimension).await?;
            debug!(
                "Indexed rule {rule_id}: {} positive, {} negative",
                positive.len(),
                negative.len()
            );
            indices.insert(rule_id.to_string(), RuleIndex { positive, negative });
        }

        info!("Built catalog with {} rules", indices.len());
        Ok(Self {
            indices,
            store,
            dimension,
        })
    }

    /// Persist the catalog under `path`.
    ///
    /// Everything is written to `<path>.staging` first and renamed into
    /// place at the end, so a failed save leaves an existing catalog at
    /// `path` untouched.
    ///
    /// The old catalog is moved to `<path>.previous` before the new one is
    /// renamed in, so `path` is briefly absent. [`IndexCatalog::load`] falls
    /// back to `<path>.previous` when that happens.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let target = path.as_ref();
        let staging = sibling(target, "staging")?;
        let previous = sibling(target, "previous")?;

        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        for (rule_id, indices) in &self.indices {
            let rule_dir = staging.join(rule_dir_name(rule_id));
            fs::create_dir_all(&rule_dir).await?;
            for polarity in Polarity::ALL {
                indices
                    .index(polarity)
                    .write_to(rule_dir.join(index_file_name(polarity)))
                    .await
                    .map_err(|e| index_error(&rule_dir, e))?;
            }
        }

        let document = CatalogDocument {
            version: CatalogDocument::CURRENT_VERSION,
            dimension: self.dimension,
            rules: self.store.clone(),
        };
        fs::write(
            staging.join(METADATA_FILE),
            serde_json::to_string_pretty(&document)?,
        )
        .await?;

        if fs::try_exists(target).await? {
            if fs::try_exists(&previous).await? {
                fs::remove_dir_all(&previous).await?;
            }
            fs::rename(target, &previous).await?;
            if let Err(e) = fs::rename(&staging, target).await {
                error!("Failed to move new catalog into {}: {e}", target.display());
                fs::rename(&previous, target).await?;
                return Err(e.into());
            }
            if let Err(e) = fs::remove_dir_all(&previous).await {
                warn!("Failed to remove previous catalog {}: {e}", previous.display());
            }
        } else {
            fs::rename(&staging, target).await?;
        }

        info!(
            "Saved catalog with {} rules to {}",
            self.indices.len(),
            target.display()
        );
        Ok(())
    }

    /// Load a catalog saved by [`IndexCatalog::save`].
    ///
    /// Rules whose index directory or either index file is missing are
    /// skipped with a warning. If `path` does not exist but a
    /// `<path>.previous` left by an interrupted save does, that is loaded.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let requested = path.as_ref();
        let root = if fs::try_exists(requested).await? {
            requested.to_path_buf()
        } else {
            let previous = sibling(requested, "previous")
                .map_err(|_| RetrievalError::NotFound(requested.display().to_string()))?;
            if !fs::try_exists(&previous).await? {
                return Err(RetrievalError::NotFound(requested.display().to_string()));
            }
            warn!(
                "Catalog {} missing, loading interrupted save from {}",
                requested.display(),
                previous.display()
            );
            previous
        };
        let root = root.as_path();

        let content = fs::read_to_string(root.join(METADATA_FILE)).await?;
        let document: CatalogDocument = serde_json::from_str(&content)?;
        if document.version != CatalogDocument::CURRENT_VERSION {
            return Err(RetrievalError::CorruptIndex {
                path: root.join(METADATA_FILE).display().to_string(),
                reason: format!("unsupported catalog version {}", document.version),
            });
        }

        let mut store = document.rules;
        let mut indices = IndexMap::with_capacity(store.len());
        for (rule_id, rule) in store.iter() {
            let rule_dir = root.join(rule_dir_name(rule_id));
            if !fs::try_exists(&rule_dir).await? {
                warn!(
                    "Skipping rule {rule_id}: no index directory at {}",
                    rule_dir.display()
                );
                continue;
            }

            let mut missing = Vec::new();
            for polarity in Polarity::ALL {
                if !fs::try_exists(rule_dir.join(index_file_name(polarity))).await? {
                    missing.push(polarity.label());
                }
            }
            if !missing.is_empty() {
                warn!(
                    "Skipping rule {rule_id}: missing {} index in {}",
                    missing.join(" and "),
                    rule_dir.display()
                );
                continue;
            }

            let positive = read_index(&rule_dir, Polarity::Positive).await?;
            let negative = read_index(&rule_dir, Polarity::Negative).await?;
            for (polarity, index) in [(Polarity::Positive, &positive), (Polarity::Negative, &negative)] {
                if index.dimension() != document.dimension {
                    return Err(RetrievalError::CorruptIndex {
                        path: rule_dir.display().to_string(),
                        reason: format!(
                            "{polarity} index has dimension {}, catalog declares {}",
                            index.dimension(),
                            document.dimension
                        ),
                    });
                }
                let exemplars = rule.group(polarity).len();
                if index.len() != exemplars {
                    warn!(
                        "Rule {rule_id} {polarity} index holds {} vectors for {exemplars} exemplars",
                        index.len()
                    );
                }
            }

            indices.insert(rule_id.to_string(), RuleIndex { positive, negative });
        }
        store.retain(|rule_id| indices.contains_key(rule_id));

        info!(
            "Loaded catalog from {} with {} rules",
            root.display(),
            indices.len()
        );
        Ok(Self {
            indices,
            store,
            dimension: document.dimension,
        })
    }

    /// Look up a rule's indices and exemplars.
    pub fn lookup(&self, rule_id: &str) -> Result<RuleEntry<'_>> {
        let (rule_id, indices) = self
            .indices
            .get_key_value(rule_id)
            .ok_or_else(|| RetrievalError::UnknownRule(rule_id.to_string()))?;
        let exemplars = self
            .store
            .rule(rule_id)
            .ok_or_else(|| RetrievalError::UnknownRule(rule_id.to_string()))?;

        Ok(RuleEntry {
            rule_id,
            indices,
            exemplars,
        })
    }

    /// Check whether a rule is present.
    pub fn contains(&self, rule_id: &str) -> bool {
        self.indices.contains_key(rule_id)
    }

    /// Rule IDs in catalog order.
    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.indices.keys().map(String::as_str)
    }

    /// Exemplar counts per rule, in catalog order.
    pub fn summaries(&self) -> Vec<RuleSummary> {
        self.store
            .iter()
            .map(|(rule_id, rule)| RuleSummary {
                rule_id: rule_id.to_string(),
                rule_name: rule.rule_name.clone(),
                positive: rule.positive.len(),
                negative: rule.negative.len(),
            })
            .collect()
    }

    /// The exemplars backing the catalog.
    pub fn store(&self) -> &ExemplarStore {
        &self.store
    }

    /// Embedding dimension the catalog was built with.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Check if the catalog has no rules.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Owned, swappable reference to the active catalog.
///
/// Readers clone the inner `Arc` and keep using it even if a new catalog is
/// swapped in while they work.
#[derive(Debug, Clone, Default)]
pub struct CatalogHandle {
    current: Arc<RwLock<Option<Arc<IndexCatalog>>>>,
}

impl CatalogHandle {
    /// Create a handle with no catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active catalog, if any.
    pub async fn current(&self) -> Option<Arc<IndexCatalog>> {
        self.current.read().await.clone()
    }

    /// Replace the active catalog, returning the previous one.
    pub async fn swap(&self, catalog: IndexCatalog) -> Option<Arc<IndexCatalog>> {
        let catalog = Arc::new(catalog);
        let previous = self.current.write().await.replace(catalog);
        debug!("Swapped active catalog");
        previous
    }

    /// Check if a catalog is active.
    pub async fn is_loaded(&self) -> bool {
        self.current.read().await.is_some()
    }
}

async fn embed_group(
    embedder: &dyn EmbeddingProvider,
    rule_id: &str,
    rule: &RuleExemplars,
    polarity: Polarity,
    dimension: usize,
) -> Result<FlatL2Index> {
    let texts = rule.texts(polarity);
    if texts.is_empty() {
        return Ok(FlatL2Index::new(dimension));
    }

    let vectors = embedder.embed_batch(&texts).await.map_err(|e| {
        error!("Embedding failed for rule {rule_id} ({polarity}): {e}");
        RetrievalError::from(e)
    })?;
    if vectors.len() != texts.len() {
        return Err(RetrievalError::Embedding(EmbeddingError::InvalidResponse(
            format!(
                "rule {rule_id} ({polarity}): requested {} embeddings, received {}",
                texts.len(),
                vectors.len()
            ),
        )));
    }

    Ok(FlatL2Index::from_vectors(dimension, &vectors)?)
}

async fn read_index(rule_dir: &Path, polarity: Polarity) -> Result<FlatL2Index> {
    FlatL2Index::read_from(rule_dir.join(index_file_name(polarity)))
        .await
        .map_err(|e| index_error(rule_dir, e))
}

fn index_error(rule_dir: &Path, err: EmbeddingError) -> RetrievalError {
    match err {
        EmbeddingError::CorruptIndex(reason) => RetrievalError::CorruptIndex {
            path: rule_dir.display().to_string(),
            reason,
        },
        EmbeddingError::Io(e) => RetrievalError::Io(e),
        other => RetrievalError::from(other),
    }
}

fn rule_dir_name(rule_id: &str) -> String {
    format!("rule_{rule_id}")
}

fn index_file_name(polarity: Polarity) -> String {
    format!("{}.index", polarity.label())
}

fn sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        RetrievalError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("catalog path {} has no final component", path.display()),
        ))
    })?;
    let mut sibling_name = OsString::from(name);
    sibling_name.push(format!(".{suffix}"));
    Ok(path.with_file_name(sibling_name))
}
