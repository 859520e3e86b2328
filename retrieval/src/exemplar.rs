//! Exemplar records and the rule-keyed store that holds them.
//!
//! Records are grouped by rule and [`Polarity`]. Within a group the order is
//! insertion order, and a record's position is the position of its vector in
//! the matching [`exemplar_embeddings::FlatL2Index`].

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Which suggestion group an exemplar belongs to.
///
/// Naming follows the knowledge base: suggestions users rejected are
/// "positive" examples, suggestions they accepted are "negative" ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Rejected suggestions.
    Positive,
    /// Accepted suggestions.
    Negative,
}

impl Polarity {
    /// Both polarities, positive first.
    pub const ALL: [Polarity; 2] = [Polarity::Positive, Polarity::Negative];

    /// Lowercase label, also used for index file names.
    pub fn label(self) -> &'static str {
        match self {
            Polarity::Positive => "positive",
            Polarity::Negative => "negative",
        }
    }
}

impl fmt::Display for Polarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The flagged sentence an exemplar was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSentence {
    /// Human-readable name of the rule.
    pub rule_name: String,

    /// The sentence the rule flagged.
    pub sentence: String,

    /// Related sentence the check compared against, if any.
    pub reference_sentence: String,

    /// Line number of the flagged sentence.
    pub line_number: u64,

    /// Surrounding lines as `"line: text"` rows in line order.
    pub context: String,
}

/// A suggestion the user rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedExemplar {
    pub source: SourceSentence,

    /// The rejected suggestion. This is the text that gets embedded.
    pub rejected_suggestion: String,

    /// The rewrite that came with the suggestion.
    pub rejected_revision: String,

    /// What to watch out for before making this kind of suggestion again.
    pub caution: String,
}

/// A suggestion the user accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedExemplar {
    pub source: SourceSentence,

    /// The accepted suggestion. This is the text that gets embedded.
    pub accepted_suggestion: String,

    /// The rewrite the user kept.
    pub accepted_revision: String,

    /// When the rule should fire.
    pub trigger_condition: String,
}

/// A labeled exemplar of either polarity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExemplarRecord {
    Rejected(RejectedExemplar),
    Accepted(AcceptedExemplar),
}

impl ExemplarRecord {
    /// Polarity implied by the record kind.
    pub fn polarity(&self) -> Polarity {
        match self {
            ExemplarRecord::Rejected(_) => Polarity::Positive,
            ExemplarRecord::Accepted(_) => Polarity::Negative,
        }
    }

    /// The sentence the record was taken from.
    pub fn source(&self) -> &SourceSentence {
        match self {
            ExemplarRecord::Rejected(r) => &r.source,
            ExemplarRecord::Accepted(a) => &a.source,
        }
    }

    /// The suggestion text.
    pub fn suggestion(&self) -> &str {
        match self {
            ExemplarRecord::Rejected(r) => &r.rejected_suggestion,
            ExemplarRecord::Accepted(a) => &a.accepted_suggestion,
        }
    }

    /// The caution (rejected) or trigger condition (accepted) note.
    pub fn note(&self) -> &str {
        match self {
            ExemplarRecord::Rejected(r) => &r.caution,
            ExemplarRecord::Accepted(a) => &a.trigger_condition,
        }
    }
}

/// An exemplar together with the text its vector was computed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredExemplar {
    pub text: String,
    pub record: ExemplarRecord,
}

/// All exemplars of one rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleExemplars {
    pub rule_name: String,

    #[serde(default)]
    pub positive: Vec<StoredExemplar>,

    #[serde(default)]
    pub negative: Vec<StoredExemplar>,
}

impl RuleExemplars {
    /// Exemplars of one polarity, in insertion order.
    pub fn group(&self, polarity: Polarity) -> &[StoredExemplar] {
        match polarity {
            Polarity::Positive => &self.positive,
            Polarity::Negative => &self.negative,
        }
    }

    /// Texts to embed for one polarity, in insertion order.
    pub fn texts(&self, polarity: Polarity) -> Vec<String> {
        self.group(polarity).iter().map(|e| e.text.clone()).collect()
    }
}

/// Rule-keyed exemplar table. Rule order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExemplarStore {
    rules: IndexMap<String, RuleExemplars>,
}

impl ExemplarStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a rule's exemplars.
    pub fn insert(&mut self, rule_id: impl Into<String>, exemplars: RuleExemplars) {
        self.rules.insert(rule_id.into(), exemplars);
    }

    /// Get the exemplars of a rule.
    pub fn rule(&self, rule_id: &str) -> Option<&RuleExemplars> {
        self.rules.get(rule_id)
    }

    /// Look up a single record by (rule, polarity, position).
    pub fn get(&self, rule_id: &str, polarity: Polarity, position: usize) -> Option<&ExemplarRecord> {
        self.rules
            .get(rule_id)
            .and_then(|rule| rule.group(polarity).get(position))
            .map(|stored| &stored.record)
    }

    /// Rule IDs in insertion order.
    pub fn rule_ids(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }

    /// Iterate over rules in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RuleExemplars)> {
        self.rules.iter().map(|(id, rule)| (id.as_str(), rule))
    }

    /// Keep only the rules for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.rules.retain(|id, _| keep(id.as_str()));
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the store has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn source(sentence: &str) -> SourceSentence {
        SourceSentence {
            rule_name: "背板图配置".to_string(),
            sentence: sentence.to_string(),
            reference_sentence: String::new(),
            line_number: 3,
            context: String::new(),
        }
    }

    #[test]
    fn test_record_accessors() {
        let rejected = ExemplarRecord::Rejected(RejectedExemplar {
            source: source("s"),
            rejected_suggestion: "sugg".to_string(),
            rejected_revision: "rev".to_string(),
            caution: "careful".to_string(),
        });

        assert_eq!(rejected.polarity(), Polarity::Positive);
        assert_eq!(rejected.suggestion(), "sugg");
        assert_eq!(rejected.note(), "careful");
        assert_eq!(rejected.source().line_number, 3);
    }

    #[test]
    fn test_record_serialization_is_tagged() {
        let accepted = ExemplarRecord::Accepted(AcceptedExemplar {
            source: source("s"),
            accepted_suggestion: "a".to_string(),
            accepted_revision: "b".to_string(),
            trigger_condition: "c".to_string(),
        });

        let value = serde_json::to_value(&accepted).unwrap();
        assert_eq!(value["kind"], "accepted");

        let back: ExemplarRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, accepted);
    }

    #[test]
    fn test_store_lookup_by_position() {
        let mut store = ExemplarStore::new();
        let record = ExemplarRecord::Rejected(RejectedExemplar {
            source: source("s"),
            rejected_suggestion: "x".to_string(),
            rejected_revision: String::new(),
            caution: String::new(),
        });
        store.insert(
            "6",
            RuleExemplars {
                rule_name: "r".to_string(),
                positive: vec![StoredExemplar {
                    text: "x".to_string(),
                    record: record.clone(),
                }],
                negative: Vec::new(),
            },
        );

        assert_eq!(store.get("6", Polarity::Positive, 0), Some(&record));
        assert_eq!(store.get("6", Polarity::Positive, 1), None);
        assert_eq!(store.get("6", Polarity::Negative, 0), None);
        assert_eq!(store.get("7", Polarity::Positive, 0), None);
    }

    #[test]
    fn test_store_preserves_rule_order() {
        let mut store = ExemplarStore::new();
        for id in ["9", "2", "15"] {
            store.insert(id, RuleExemplars::default());
        }

        let json = serde_json::to_string(&store).unwrap();
        let back: ExemplarStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rule_ids().collect::<Vec<_>>(), vec!["9", "2", "15"]);
    }
}
