//! Reranking and text-generation seams around retrieval.

use std::cmp::Reverse;
use std::fmt::Write as _;

use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;
use ordered_float::OrderedFloat;
use tracing::debug;

use crate::engine::{RankedExemplar, RetrievalResults};
use crate::error::{Result, RetrievalError};
use crate::exemplar::{ExemplarRecord, Polarity};

/// Stream of generated text chunks.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// A language model that answers a prompt as a stream of text chunks.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Get the generator name.
    fn name(&self) -> &str;

    /// Start generating a response to `prompt`.
    async fn generate(&self, prompt: &str) -> Result<TokenStream>;
}

/// Scores query/candidate pairs; higher is more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each candidate against `query`, one score per candidate.
    async fn score(&self, query: &str, candidates: &[String]) -> Result<Vec<f32>>;
}

/// Concatenate a token stream into one string.
pub async fn collect_stream(stream: TokenStream) -> Result<String> {
    stream
        .try_fold(String::new(), |mut text, chunk| async move {
            text.push_str(&chunk);
            Ok(text)
        })
        .await
}

/// Reorder each polarity by reranker score and keep the best `keep`.
///
/// Equal scores keep their similarity order.
pub async fn rerank(
    reranker: &dyn Reranker,
    query: &str,
    results: RetrievalResults,
    keep: usize,
) -> Result<RetrievalResults> {
    let RetrievalResults { positive, negative } = results;
    Ok(RetrievalResults {
        positive: rerank_group(reranker, query, positive, keep, Polarity::Positive).await?,
        negative: rerank_group(reranker, query, negative, keep, Polarity::Negative).await?,
    })
}

async fn rerank_group(
    reranker: &dyn Reranker,
    query: &str,
    group: Vec<RankedExemplar>,
    keep: usize,
    polarity: Polarity,
) -> Result<Vec<RankedExemplar>> {
    if group.is_empty() {
        return Ok(group);
    }

    let candidates: Vec<String> = group
        .iter()
        .map(|ranked| ranked.exemplar.suggestion().to_string())
        .collect();
    let scores = reranker.score(query, &candidates).await?;
    if scores.len() != candidates.len() {
        return Err(RetrievalError::Rerank(format!(
            "{polarity}: expected {} scores, got {}",
            candidates.len(),
            scores.len()
        )));
    }

    let mut scored: Vec<(f32, RankedExemplar)> = scores.into_iter().zip(group).collect();
    scored.sort_by_key(|(score, _)| Reverse(OrderedFloat(*score)));
    scored.truncate(keep);
    debug!("Reranked {polarity} candidates, kept {}", scored.len());

    Ok(scored.into_iter().map(|(_, ranked)| ranked).collect())
}

const SEPARATOR: &str = "--------------------------------------------------";

/// Build the generation prompt from retrieved exemplars.
pub fn render_prompt(rule_id: &str, query: &str, results: &RetrievalResults) -> String {
    let mut prompt = String::new();
    prompt.push_str("使用以下包含在<context>标签中的历史审阅示例，简洁和专业地回答<question>标签中的问题。\n");
    prompt.push_str("用户拒绝过的建议不应再次提出；用户接受过的建议可以作为参考。\n");
    prompt.push_str("如果示例不足以作答，请说 \"无答案\"，不允许编造内容，答案请使用中文。\n\n");

    let _ = writeln!(prompt, "<context>\n规则: {rule_id}");
    let mut citation = 1;
    for (polarity, heading) in [
        (Polarity::Positive, "用户拒绝的建议"),
        (Polarity::Negative, "用户接受的建议"),
    ] {
        let group = results.group(polarity);
        if group.is_empty() {
            continue;
        }

        let _ = writeln!(prompt, "{SEPARATOR}\n{heading}:");
        for ranked in group {
            write_exemplar(&mut prompt, citation, ranked);
            citation += 1;
        }
    }
    let _ = write!(prompt, "{SEPARATOR}\n</context>\n\n<question>{query}</question>");
    prompt
}

fn write_exemplar(prompt: &mut String, citation: usize, ranked: &RankedExemplar) {
    let source = ranked.exemplar.source();
    let _ = writeln!(prompt, "[{citation}] 相似度: {:.4}", ranked.similarity);
    let _ = writeln!(prompt, "原句(第{}行): {}", source.line_number, source.sentence);
    if !source.reference_sentence.is_empty() {
        let _ = writeln!(prompt, "参考句: {}", source.reference_sentence);
    }
    match &ranked.exemplar {
        ExemplarRecord::Rejected(rejected) => {
            let _ = writeln!(prompt, "建议: {}", rejected.rejected_suggestion);
            if !rejected.rejected_revision.is_empty() {
                let _ = writeln!(prompt, "修改: {}", rejected.rejected_revision);
            }
            if !rejected.caution.is_empty() {
                let _ = writeln!(prompt, "注意事项: {}", rejected.caution);
            }
        }
        ExemplarRecord::Accepted(accepted) => {
            let _ = writeln!(prompt, "建议: {}", accepted.accepted_suggestion);
            if !accepted.accepted_revision.is_empty() {
                let _ = writeln!(prompt, "修改: {}", accepted.accepted_revision);
            }
            if !accepted.trigger_condition.is_empty() {
                let _ = writeln!(prompt, "触发条件: {}", accepted.trigger_condition);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exemplar::{AcceptedExemplar, RejectedExemplar, SourceSentence};
    use futures::stream;
    use pretty_assertions::assert_eq;

    fn source() -> SourceSentence {
        SourceSentence {
            rule_name: "r".to_string(),
            sentence: "原句".to_string(),
            reference_sentence: String::new(),
            line_number: 12,
            context: String::new(),
        }
    }

    fn rejected(suggestion: &str, similarity: f32) -> RankedExemplar {
        RankedExemplar {
            exemplar: ExemplarRecord::Rejected(RejectedExemplar {
                source: source(),
                rejected_suggestion: suggestion.to_string(),
                rejected_revision: String::new(),
                caution: "别再提".to_string(),
            }),
            similarity,
        }
    }

    fn accepted(suggestion: &str) -> RankedExemplar {
        RankedExemplar {
            exemplar: ExemplarRecord::Accepted(AcceptedExemplar {
                source: source(),
                accepted_suggestion: suggestion.to_string(),
                accepted_revision: "改后".to_string(),
                trigger_condition: String::new(),
            }),
            similarity: 0.5,
        }
    }

    /// Scores candidates by their length.
    struct LengthReranker;

    #[async_trait]
    impl Reranker for LengthReranker {
        async fn score(&self, _query: &str, candidates: &[String]) -> Result<Vec<f32>> {
            Ok(candidates.iter().map(|c| c.chars().count() as f32).collect())
        }
    }

    struct ShortReranker;

    #[async_trait]
    impl Reranker for ShortReranker {
        async fn score(&self, _query: &str, _candidates: &[String]) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    #[tokio::test]
    async fn test_rerank_orders_by_score_and_truncates() {
        let results = RetrievalResults {
            positive: vec![rejected("a", 1.0), rejected("ccc", 0.9), rejected("bb", 0.8)],
            negative: Vec::new(),
        };

        let reranked = rerank(&LengthReranker, "q", results, 2).await.unwrap();
        let suggestions: Vec<&str> = reranked
            .positive
            .iter()
            .map(|r| r.exemplar.suggestion())
            .collect();
        assert_eq!(suggestions, vec!["ccc", "bb"]);
        assert!(reranked.negative.is_empty());
    }

    #[tokio::test]
    async fn test_rerank_score_count_mismatch() {
        let results = RetrievalResults {
            positive: vec![rejected("a", 1.0), rejected("b", 0.9)],
            negative: Vec::new(),
        };
        assert!(matches!(
            rerank(&ShortReranker, "q", results, 5).await,
            Err(RetrievalError::Rerank(_))
        ));
    }

    #[tokio::test]
    async fn test_collect_stream() {
        let chunks: TokenStream = Box::pin(stream::iter(vec![
            Ok("你".to_string()),
            Ok("好".to_string()),
        ]));
        assert_eq!(collect_stream(chunks).await.unwrap(), "你好");

        let failing: TokenStream = Box::pin(stream::iter(vec![
            Ok("x".to_string()),
            Err(RetrievalError::Generation("cut off".to_string())),
        ]));
        assert!(matches!(
            collect_stream(failing).await,
            Err(RetrievalError::Generation(_))
        ));
    }

    #[test]
    fn test_render_prompt_lists_both_groups() {
        let results = RetrievalResults {
            positive: vec![rejected("甲", 1.0)],
            negative: vec![accepted("丙")],
        };

        let prompt = render_prompt("6", "这句话怎么改？", &results);

        assert!(prompt.contains("规则: 6"));
        assert!(prompt.contains("[1] 相似度: 1.0000"));
        assert!(prompt.contains("建议: 甲"));
        assert!(prompt.contains("注意事项: 别再提"));
        assert!(prompt.contains("[2] 相似度: 0.5000"));
        assert!(prompt.contains("修改: 改后"));
        assert!(prompt.find("用户拒绝的建议").unwrap() < prompt.find("用户接受的建议").unwrap());
        assert!(prompt.ends_with("<question>这句话怎么改？</question>"));
    }

    #[test]
    fn test_render_prompt_skips_empty_groups() {
        let prompt = render_prompt("6", "q", &RetrievalResults::default());
        assert!(!prompt.contains("用户拒绝的建议:"));
        assert!(!prompt.contains("用户接受的建议:"));
    }
}
