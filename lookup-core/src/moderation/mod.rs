//! Batched content scoring of captured posts.

mod client;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use client::{HttpChatModel, LanguageModel};

use crate::config::ModerationSection;
use crate::net::HttpFetcher;
use crate::store::RecordMap;

pub const SCORING_RUBRIC: &str = r#"Your task is to rate social media tweets. Provide a valid JSON response, without any additional information.
Example:
<note>
Value is a factor between 0-1, depending on 'text' present in tweet.
Don't include single or double quote in any way.

Provide a JSON response such as
{"results": [
{
  "spam_likelihood": 0,
  "profanity_detection": 0,
  "fraudulent_content_likelihood": 0,
  "false_information_probability": 0,
  "cyber_fraud_risk": 0,
  "illegal_activity_detection": 0,
  "personal_data_exposure": 0,
  "tweetId": "restTweetId",
  "reason": "reason for considering"
}],
"summarized_message": "<summarized message here>"}

Note: Social promotion of one's own account is acceptable. Users can ask others to follow them, as this is common on social media. Motivational tweets are also allowed and should not be considered spam.
"#;

pub const SUMMARY_PROMPT: &str =
    "Summarize the main reason for flagging these tweets in a single, concise sentence.";

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("environment variable {0} holding the model API key is not set")]
    MissingApiKey(String),
    #[error("model returned no completion")]
    EmptyCompletion,
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("could not parse scoring response: {0}")]
    ScoringParseFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationItem {
    pub rest_id: String,
    pub text: String,
}

/// Score object for one item: numeric fields plus a free-text `reason`.
pub type ScoreObject = Map<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ChunkScores {
    #[serde(default)]
    pub results: Vec<ScoreObject>,
    #[serde(default)]
    pub summarized_message: Option<String>,
}

/// Outcome of one scoring call.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreAttempt {
    Parsed(ChunkScores),
    RetryableParseError(String),
}

/// Per-field means over every scored item plus one overall explanation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReport {
    #[serde(flatten)]
    pub scores: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub general_message: Option<String>,
}

impl AggregatedReport {
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty() && self.general_message.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoringOutcome {
    pub results: Vec<ScoreObject>,
    pub summaries: Vec<String>,
    pub chunks: usize,
    pub dropped_chunks: usize,
}

/// Posts of a persisted `tweets` collection, keyed by their id.
pub fn items_from_tweets(tweets: &RecordMap) -> Vec<ModerationItem> {
    tweets
        .iter()
        .filter_map(|(rest_id, tweet)| {
            let text = tweet.get("full_text").and_then(Value::as_str)?;
            Some(ModerationItem {
                rest_id: rest_id.clone(),
                text: text.to_string(),
            })
        })
        .collect()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Parse a scoring reply, repairing a single missing closing brace.
pub fn parse_scores(raw: &str) -> ScoreAttempt {
    let text = strip_code_fence(raw);
    let first = match serde_json::from_str::<ChunkScores>(text) {
        Ok(scores) => return ScoreAttempt::Parsed(scores),
        Err(err) => err,
    };
    if text.ends_with('}') {
        return ScoreAttempt::RetryableParseError(first.to_string());
    }
    let repaired = format!("{text}}}");
    match serde_json::from_str::<ChunkScores>(&repaired) {
        Ok(scores) => ScoreAttempt::Parsed(scores),
        Err(err) => ScoreAttempt::RetryableParseError(err.to_string()),
    }
}

/// Run `attempt` until it parses or `max_attempts` runs are used up.
pub async fn retry_bounded<F, Fut>(max_attempts: usize, mut attempt: F) -> Option<ChunkScores>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = ScoreAttempt>,
{
    for number in 1..=max_attempts.max(1) {
        match attempt(number).await {
            ScoreAttempt::Parsed(scores) => return Some(scores),
            ScoreAttempt::RetryableParseError(reason) => {
                debug!(attempt = number, reason = %reason, "scoring attempt failed");
            }
        }
    }
    None
}

/// Mean of every numeric field except `reason`, divided by the number of results.
pub fn mean_scores(results: &[ScoreObject]) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<String, f64> = BTreeMap::new();
    if results.is_empty() {
        return sums;
    }
    for result in results {
        for (key, value) in result {
            if key == "reason" {
                continue;
            }
            if let Some(number) = value.as_f64() {
                *sums.entry(key.clone()).or_insert(0.0) += number;
            }
        }
    }
    let count = results.len() as f64;
    for sum in sums.values_mut() {
        *sum /= count;
    }
    sums
}

fn short_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"https?://t\.co/\w+").expect("short link pattern is valid"))
}

pub struct ModerationPipeline {
    model: Arc<dyn LanguageModel>,
    link_resolver: Option<Arc<dyn HttpFetcher>>,
    chunk_size: usize,
    max_attempts: usize,
}

impl ModerationPipeline {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model,
            link_resolver: None,
            chunk_size: 10,
            max_attempts: 3,
        }
    }

    pub fn from_config(
        section: &ModerationSection,
        model: Arc<dyn LanguageModel>,
        fetcher: Arc<dyn HttpFetcher>,
    ) -> Self {
        let pipeline = Self::new(model)
            .with_chunk_size(section.chunk_size)
            .with_max_attempts(section.max_attempts);
        if section.resolve_short_links {
            pipeline.with_link_resolver(fetcher)
        } else {
            pipeline
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_link_resolver(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.link_resolver = Some(fetcher);
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Replace `t.co` links with their destination. Unresolvable links stay.
    pub async fn expand_short_links(&self, text: &str) -> String {
        let Some(resolver) = &self.link_resolver else {
            return text.to_string();
        };
        let mut expanded = text.to_string();
        let links: Vec<String> = short_link_pattern()
            .find_iter(text)
            .map(|found| found.as_str().to_string())
            .collect();
        for link in links {
            match resolver.resolve_redirects(&link).await {
                Ok(target) => expanded = expanded.replace(&link, &target),
                Err(err) => debug!(link = %link, error = %err, "short link left unresolved"),
            }
        }
        expanded
    }

    async fn score_once(&self, payload: &str) -> ScoreAttempt {
        match self.model.complete(SCORING_RUBRIC, payload).await {
            Ok(raw) => parse_scores(&raw),
            Err(err) => ScoreAttempt::RetryableParseError(err.to_string()),
        }
    }

    /// Score `items` in consecutive chunks of at most `chunk_size`. A chunk that
    /// never parses is dropped without affecting the others.
    pub async fn score_chunks(&self, items: &[ModerationItem], chunk_size: usize) -> ScoringOutcome {
        let mut outcome = ScoringOutcome::default();
        for chunk in items.chunks(chunk_size.max(1)) {
            outcome.chunks += 1;
            let mut serialized = Vec::with_capacity(chunk.len());
            for item in chunk {
                let resolved = ModerationItem {
                    rest_id: item.rest_id.clone(),
                    text: self.expand_short_links(&item.text).await,
                };
                match serde_json::to_string(&resolved) {
                    Ok(line) => serialized.push(line),
                    Err(err) => warn!(rest_id = %item.rest_id, error = %err, "item not serialisable"),
                }
            }
            let payload = match serde_json::to_string(&serialized) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "chunk not serialisable; dropping");
                    outcome.dropped_chunks += 1;
                    continue;
                }
            };

            match retry_bounded(self.max_attempts, |_| self.score_once(&payload)).await {
                Some(scores) => {
                    outcome.results.extend(scores.results);
                    outcome.summaries.extend(scores.summarized_message);
                }
                None => {
                    warn!(
                        chunk = outcome.chunks,
                        attempts = self.max_attempts,
                        "scoring chunk never parsed; dropping"
                    );
                    outcome.dropped_chunks += 1;
                }
            }
        }
        outcome
    }

    /// Average the score fields and summarise the reasons in one call.
    pub async fn aggregate(&self, results: &[ScoreObject]) -> AggregatedReport {
        if results.is_empty() {
            return AggregatedReport::default();
        }
        let scores = mean_scores(results);
        let reasons: Vec<&Value> = results
            .iter()
            .filter_map(|result| result.get("reason"))
            .collect();
        let reasons = serde_json::to_string(&reasons).unwrap_or_else(|_| "[]".into());
        let prompt = format!(
            "Based on these reasons, provide a one-line summary of why these tweets were flagged: {reasons}"
        );
        let general_message = match self.model.complete(SUMMARY_PROMPT, &prompt).await {
            Ok(message) => Some(message.trim().to_string()),
            Err(err) => {
                warn!(error = %err, "summary call failed");
                None
            }
        };
        AggregatedReport {
            scores,
            general_message,
        }
    }

    /// Score then aggregate.
    pub async fn report(&self, items: &[ModerationItem]) -> AggregatedReport {
        let outcome = self.score_chunks(items, self.chunk_size).await;
        info!(
            items = items.len(),
            chunks = outcome.chunks,
            dropped = outcome.dropped_chunks,
            results = outcome.results.len(),
            "moderation scoring finished"
        );
        self.aggregate(&outcome.results).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedModel, StaticFetcher};
    use serde_json::json;

    fn object(value: Value) -> ScoreObject {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn items(count: usize) -> Vec<ModerationItem> {
        (0..count)
            .map(|n| ModerationItem {
                rest_id: n.to_string(),
                text: format!("post {n}"),
            })
            .collect()
    }

    fn reply(ids: &[&str]) -> String {
        let results: Vec<Value> = ids
            .iter()
            .map(|id| json!({"spam_likelihood": 0.5, "tweetId": id, "reason": "promo"}))
            .collect();
        json!({"results": results, "summarized_message": "ok"}).to_string()
    }

    #[test]
    fn missing_closing_brace_is_repaired() {
        let raw = r#"{"results": [{"spam_likelihood": 1, "reason": "x"}], "summarized_message": "s""#;
        match parse_scores(raw) {
            ScoreAttempt::Parsed(scores) => assert_eq!(scores.results.len(), 1),
            other => panic!("expected parsed, got {other:?}"),
        }
        assert!(matches!(parse_scores("not json at all"), ScoreAttempt::RetryableParseError(_)));
    }

    #[test]
    fn fenced_replies_parse() {
        let raw = "```json\n{\"results\": [], \"summarized_message\": \"none\"}\n```";
        assert!(matches!(parse_scores(raw), ScoreAttempt::Parsed(_)));
    }

    #[test]
    fn aggregate_mean_ignores_reason_and_text() {
        let results = vec![
            object(json!({"a": 1, "b": 0, "reason": "x", "tweetId": "1"})),
            object(json!({"a": 0, "b": 1, "reason": "y", "tweetId": "2"})),
        ];
        let means = mean_scores(&results);
        assert_eq!(means.len(), 2);
        assert_eq!(means["a"], 0.5);
        assert_eq!(means["b"], 0.5);
    }

    #[tokio::test]
    async fn chunking_issues_one_call_per_chunk() {
        let model = Arc::new(ScriptedModel::repeating(reply(&["x"])));
        let pipeline = ModerationPipeline::new(model.clone());
        let outcome = pipeline.score_chunks(&items(23), 10).await;
        assert_eq!(outcome.chunks, 3);
        assert_eq!(model.calls().len(), 3);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.dropped_chunks, 0);
    }

    #[tokio::test]
    async fn chunk_that_never_parses_is_dropped() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("garbage".into()),
            Ok("garbage".into()),
            Ok("garbage".into()),
            Ok(reply(&["10", "11"])),
        ]));
        let pipeline = ModerationPipeline::new(model.clone());
        let outcome = pipeline.score_chunks(&items(12), 10).await;
        assert_eq!(model.calls().len(), 4);
        assert_eq!(outcome.dropped_chunks, 1);
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_retried() {
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModerationError::EmptyCompletion),
            Ok(reply(&["0"])),
        ]));
        let pipeline = ModerationPipeline::new(model.clone());
        let outcome = pipeline.score_chunks(&items(1), 10).await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(model.calls().len(), 2);
    }

    #[tokio::test]
    async fn empty_results_make_an_empty_report_without_calls() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let pipeline = ModerationPipeline::new(model.clone());
        let report = pipeline.aggregate(&[]).await;
        assert!(report.is_empty());
        assert!(model.calls().is_empty());
        assert_eq!(serde_json::to_value(&report).unwrap(), json!({}));
    }

    #[tokio::test]
    async fn report_includes_general_message() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(reply(&["0", "1"])),
            Ok("  Mostly self promotion.  ".into()),
        ]));
        let pipeline = ModerationPipeline::new(model.clone());
        let report = pipeline.report(&items(2)).await;
        assert_eq!(report.scores["spam_likelihood"], 0.5);
        assert_eq!(report.general_message.as_deref(), Some("Mostly self promotion."));
        let calls = model.calls();
        assert_eq!(calls[1].0, SUMMARY_PROMPT);
        assert!(calls[1].1.contains("promo"));
        let flat = serde_json::to_value(&report).unwrap();
        assert_eq!(flat["general_message"], "Mostly self promotion.");
        assert_eq!(flat["spam_likelihood"], 0.5);
    }

    #[tokio::test]
    async fn short_links_are_expanded_before_scoring() {
        let fetcher = Arc::new(
            StaticFetcher::default().with_redirect("https://t.co/abc123", "https://example.com/offer"),
        );
        let model = Arc::new(ScriptedModel::repeating(reply(&["0"])));
        let pipeline = ModerationPipeline::new(model.clone()).with_link_resolver(fetcher);
        let item = ModerationItem {
            rest_id: "0".into(),
            text: "win big https://t.co/abc123 and https://t.co/dead".into(),
        };
        pipeline.score_chunks(&[item], 10).await;
        let calls = model.calls();
        let (_, user) = &calls[0];
        assert!(user.contains("https://example.com/offer"));
        assert!(user.contains("https://t.co/dead"));
    }

    #[test]
    fn tweets_collection_becomes_items() {
        let tweets = object(json!({
            "17": {"full_text": "hello", "id_str": "17"},
            "18": {"id_str": "18"}
        }));
        assert_eq!(
            items_from_tweets(&tweets),
            vec![ModerationItem { rest_id: "17".into(), text: "hello".into() }]
        );
    }
}
