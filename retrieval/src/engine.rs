//! Rule-scoped similarity retrieval over the active catalog.

use std::sync::Arc;

use exemplar_embeddings::{EmbeddingError, EmbeddingProvider, similarity_from_distance};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::catalog::{CatalogHandle, RuleIndex};
use crate::error::{Result, RetrievalError};
use crate::exemplar::{ExemplarRecord, Polarity, RuleExemplars};

/// An exemplar with its similarity to the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedExemplar {
    pub exemplar: ExemplarRecord,

    /// `1 / (1 + d)` for squared L2 distance `d`; in (0, 1].
    pub similarity: f32,
}

/// Ranked exemplars of both polarities, most similar first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResults {
    /// Rejected suggestions.
    pub positive: Vec<RankedExemplar>,

    /// Accepted suggestions.
    pub negative: Vec<RankedExemplar>,
}

impl RetrievalResults {
    /// Results of one polarity.
    pub fn group(&self, polarity: Polarity) -> &[RankedExemplar] {
        match polarity {
            Polarity::Positive => &self.positive,
            Polarity::Negative => &self.negative,
        }
    }

    fn group_mut(&mut self, polarity: Polarity) -> &mut Vec<RankedExemplar> {
        match polarity {
            Polarity::Positive => &mut self.positive,
            Polarity::Negative => &mut self.negative,
        }
    }

    /// Total number of results across both polarities.
    pub fn len(&self) -> usize {
        self.positive.len() + self.negative.len()
    }

    /// Check if there are no results.
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }
}

/// Embeds queries and searches the active catalog.
#[derive(Clone)]
pub struct RetrievalEngine {
    catalog: CatalogHandle,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl RetrievalEngine {
    /// Create an engine over a catalog handle.
    pub fn new(catalog: CatalogHandle, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { catalog, embedder }
    }

    /// The catalog handle the engine reads from.
    pub fn catalog(&self) -> &CatalogHandle {
        &self.catalog
    }

    /// The embedder used for queries.
    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// Retrieve up to `top_k` exemplars per polarity for `query` under `rule_id`.
    pub async fn retrieve(&self, rule_id: &str, query: &str, top_k: usize) -> Result<RetrievalResults> {
        if top_k == 0 {
            return Err(RetrievalError::InvalidTopK(top_k));
        }

        let catalog = self
            .catalog
            .current()
            .await
            .ok_or(RetrievalError::CatalogNotLoaded)?;
        catalog.lookup(rule_id)?;

        debug!("Retrieving top {top_k} for rule {rule_id}");

        let query_embedding = self
            .embedder
            .embed_batch(&[query.to_string()])
            .await
            .map_err(|e| {
                error!("Query embedding failed for rule {rule_id}: {e}");
                RetrievalError::from(e)
            })?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RetrievalError::Embedding(EmbeddingError::InvalidResponse(
                    "no embedding returned for query".to_string(),
                ))
            })?;

        let rule_id = rule_id.to_string();
        tokio::task::spawn_blocking(move || {
            let entry = catalog.lookup(&rule_id)?;
            search_rule(entry.indices, entry.exemplars, &query_embedding, top_k)
        })
        .await?
    }
}

/// Search both polarity indices of a rule and map hits back to exemplars.
///
/// Hits whose position has no matching exemplar are dropped.
pub fn search_rule(
    indices: &RuleIndex,
    exemplars: &RuleExemplars,
    query: &[f32],
    top_k: usize,
) -> Result<RetrievalResults> {
    let mut results = RetrievalResults::default();

    for polarity in Polarity::ALL {
        let index = indices.index(polarity);
        if index.is_empty() {
            continue;
        }

        let neighbors = index.search(query, top_k).map_err(|e| {
            error!("Search failed for {polarity} index: {e}");
            RetrievalError::from(e)
        })?;

        let group = exemplars.group(polarity);
        let hits = neighbors.len();
        let ranked = results.group_mut(polarity);
        ranked.extend(neighbors.into_iter().filter_map(|neighbor| {
            group.get(neighbor.position).map(|stored| RankedExemplar {
                exemplar: stored.record.clone(),
                similarity: similarity_from_distance(neighbor.distance),
            })
        }));

        if ranked.len() < hits {
            debug!(
                "Dropped {} {polarity} hits beyond {} exemplars",
                hits - ranked.len(),
                group.len()
            );
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::{AcceptedExemplar, SourceSentence, StoredExemplar};
    use exemplar_embeddings::FlatL2Index;
    use pretty_assertions::assert_eq;

    fn accepted(text: &str) -> StoredExemplar {
        StoredExemplar {
            text: text.to_string(),
            record: ExemplarRecord::Accepted(AcceptedExemplar {
                source: SourceSentence {
                    rule_name: "r".to_string(),
                    sentence: text.to_string(),
                    reference_sentence: String::new(),
                    line_number: 1,
                    context: String::new(),
                },
                accepted_suggestion: text.to_string(),
                accepted_revision: String::new(),
                trigger_condition: String::new(),
            }),
        }
    }

    #[test]
    fn test_search_rule_drops_positions_without_exemplars() {
        let indices = RuleIndex {
            positive: FlatL2Index::new(2),
            negative: FlatL2Index::from_vectors(2, &[vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 0.0]])
                .unwrap(),
        };
        let exemplars = RuleExemplars {
            rule_name: "r".to_string(),
            positive: Vec::new(),
            negative: vec![accepted("a"), accepted("b")],
        };

        let results = search_rule(&indices, &exemplars, &[0.0, 0.0], 3).unwrap();

        assert!(results.positive.is_empty());
        assert_eq!(results.negative.len(), 2);
        assert_eq!(results.negative[0].exemplar.suggestion(), "a");
        assert_eq!(results.negative[0].similarity, 1.0);
        assert_eq!(results.negative[1].exemplar.suggestion(), "b");
        assert!((results.negative[1].similarity - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_search_rule_dimension_mismatch() {
        let indices = RuleIndex {
            positive: FlatL2Index::from_vectors(2, &[vec![0.0, 0.0]]).unwrap(),
            negative: FlatL2Index::new(2),
        };
        let exemplars = RuleExemplars {
            rule_name: "r".to_string(),
            positive: vec![accepted("a")],
            negative: Vec::new(),
        };

        assert!(matches!(
            search_rule(&indices, &exemplars, &[0.0, 0.0, 0.0], 1),
            Err(RetrievalError::EmbeddingDimensionMismatch {
                expected: 2,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_results_len() {
        let mut results = RetrievalResults::default();
        assert!(results.is_empty());
        results.negative.push(RankedExemplar {
            exemplar: accepted("a").record,
            similarity: 1.0,
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results.group(Polarity::Negative).len(), 1);
    }
}
