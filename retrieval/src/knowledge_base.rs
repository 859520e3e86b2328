//! Parsing of the knowledge-base JSON produced by the feedback pipeline.
//!
//! The document is an object keyed by rule ID. Each rule carries a name, a
//! list of rejected suggestions (`正面示例`) and a list of accepted ones
//! (`反面示例`). Records are validated into typed [`ExemplarRecord`]s here so
//! that nothing downstream has to deal with missing fields.

use std::path::Path;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, RetrievalError};
use crate::exemplar::{
    AcceptedExemplar, ExemplarRecord, ExemplarStore, Polarity, RejectedExemplar, RuleExemplars,
    SourceSentence, StoredExemplar,
};

#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(rename = "规则名称", alias = "rule_name", default)]
    rule_name: Option<String>,

    #[serde(rename = "正面示例", alias = "positive_examples", default)]
    positive: Vec<Value>,

    #[serde(rename = "反面示例", alias = "negative_examples", default)]
    negative: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    #[serde(alias = "original_sentence")]
    sentence: String,

    #[serde(default)]
    reference_sentence: Option<String>,

    #[serde(rename = "line_num", alias = "line_number")]
    line_number: Value,

    #[serde(default)]
    context: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawRejected {
    #[serde(flatten)]
    source: RawSource,

    #[serde(rename = "用户拒绝的建议", alias = "rejected_suggestion")]
    suggestion: String,

    #[serde(rename = "用户拒绝的修改", alias = "rejected_revision", default)]
    revision: Option<String>,

    #[serde(rename = "注意事项", alias = "caution", default)]
    caution: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAccepted {
    #[serde(flatten)]
    source: RawSource,

    #[serde(rename = "修改建议", alias = "suggestion")]
    suggestion: String,

    #[serde(rename = "更改后示例", alias = "revision", default)]
    revision: Option<String>,

    #[serde(rename = "触发条件", alias = "trigger_condition", default)]
    trigger_condition: Option<String>,
}

/// Parse a knowledge-base document into an [`ExemplarStore`].
pub fn parse_knowledge_base(json: &str) -> Result<ExemplarStore> {
    let raw: IndexMap<String, RawRule> = serde_json::from_str(json)?;
    if raw.is_empty() {
        return Err(RetrievalError::EmptyKnowledgeBase);
    }

    let mut store = ExemplarStore::new();
    for (rule_id, rule) in raw {
        validate_rule_id(&rule_id)?;
        let rule_name = rule.rule_name.unwrap_or_default();

        let positive = rule
            .positive
            .into_iter()
            .enumerate()
            .map(|(position, value)| {
                let ctx = RecordContext::new(&rule_id, Polarity::Positive, position);
                let raw: RawRejected = ctx.decode(value)?;
                let source = ctx.source(&rule_name, raw.source)?;
                let text = ctx.embed_text(raw.suggestion)?;
                Ok(StoredExemplar {
                    record: ExemplarRecord::Rejected(RejectedExemplar {
                        source,
                        rejected_suggestion: text.clone(),
                        rejected_revision: raw.revision.unwrap_or_default(),
                        caution: raw.caution.unwrap_or_default(),
                    }),
                    text,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let negative = rule
            .negative
            .into_iter()
            .enumerate()
            .map(|(position, value)| {
                let ctx = RecordContext::new(&rule_id, Polarity::Negative, position);
                let raw: RawAccepted = ctx.decode(value)?;
                let source = ctx.source(&rule_name, raw.source)?;
                let text = ctx.embed_text(raw.suggestion)?;
                Ok(StoredExemplar {
                    record: ExemplarRecord::Accepted(AcceptedExemplar {
                        source,
                        accepted_suggestion: text.clone(),
                        accepted_revision: raw.revision.unwrap_or_default(),
                        trigger_condition: raw.trigger_condition.unwrap_or_default(),
                    }),
                    text,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Parsed rule {rule_id}: {} positive, {} negative exemplars",
            positive.len(),
            negative.len()
        );

        store.insert(
            rule_id,
            RuleExemplars {
                rule_name,
                positive,
                negative,
            },
        );
    }

    Ok(store)
}

/// Read and parse a knowledge-base file.
pub async fn load_knowledge_base(path: impl AsRef<Path>) -> Result<ExemplarStore> {
    let path = path.as_ref();
    if !fs::try_exists(path).await? {
        return Err(RetrievalError::NotFound(path.display().to_string()));
    }

    let content = fs::read_to_string(path).await?;
    let store = parse_knowledge_base(&content)?;
    info!(
        "Loaded knowledge base {} with {} rules",
        path.display(),
        store.len()
    );
    Ok(store)
}

/// Rule IDs name directories on disk, so they must be plain path segments.
pub(crate) fn validate_rule_id(rule_id: &str) -> Result<()> {
    let invalid = rule_id.trim().is_empty()
        || rule_id == "."
        || rule_id == ".."
        || rule_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(RetrievalError::InvalidRuleId(rule_id.to_string()));
    }
    Ok(())
}

/// Flatten a context mapping of line number to text into `"line: text"` rows
/// sorted by numeric line number.
pub fn flatten_context(context: &serde_json::Map<String, Value>) -> std::result::Result<String, String> {
    let mut rows = Vec::with_capacity(context.len());
    for (key, value) in context {
        let line: i64 = key
            .trim()
            .parse()
            .map_err(|_| format!("context key {key:?} is not a line number"))?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rows.push((line, key.as_str(), text));
    }
    rows.sort_by_key(|(line, _, _)| *line);

    Ok(rows
        .into_iter()
        .map(|(_, key, text)| format!("{key}: {text}"))
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Identifies the record being decoded so failures point at it.
struct RecordContext<'a> {
    rule: &'a str,
    polarity: Polarity,
    position: usize,
}

impl<'a> RecordContext<'a> {
    fn new(rule: &'a str, polarity: Polarity, position: usize) -> Self {
        Self {
            rule,
            polarity,
            position,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> RetrievalError {
        RetrievalError::MalformedRecord {
            rule: self.rule.to_string(),
            polarity: self.polarity,
            position: self.position,
            reason: reason.into(),
        }
    }

    fn decode<T: DeserializeOwned>(&self, value: Value) -> Result<T> {
        serde_json::from_value(value).map_err(|e| self.malformed(e.to_string()))
    }

    fn embed_text(&self, suggestion: String) -> Result<String> {
        if suggestion.trim().is_empty() {
            return Err(self.malformed("suggestion text is empty"));
        }
        Ok(suggestion)
    }

    fn source(&self, rule_name: &str, raw: RawSource) -> Result<SourceSentence> {
        Ok(SourceSentence {
            rule_name: rule_name.to_string(),
            sentence: raw.sentence,
            reference_sentence: raw.reference_sentence.unwrap_or_default(),
            line_number: self.line_number(&raw.line_number)?,
            context: self.context(raw.context)?,
        })
    }

    fn line_number(&self, value: &Value) -> Result<u64> {
        let parsed = match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        };
        parsed.ok_or_else(|| self.malformed(format!("invalid line number {value}")))
    }

    fn context(&self, value: Option<Value>) -> Result<String> {
        let map = match value {
            None | Some(Value::Null) => return Ok(String::new()),
            Some(Value::String(s)) if s.trim().is_empty() => return Ok(String::new()),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(&s) {
                Ok(Value::Object(map)) => map,
                _ => return Err(self.malformed("context is not a JSON object")),
            },
            Some(Value::Object(map)) => map,
            Some(other) => return Err(self.malformed(format!("unexpected context {other}"))),
        };
        flatten_context(&map).map_err(|reason| self.malformed(reason))
    }
}
