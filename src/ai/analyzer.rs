//! Article enrichment: sentiment, topics, bias and summary.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::client::{CompletionRequest, LlmClient, LlmError};
use super::monitor::{AiMonitor, CallOutcome, CallRecord};
use crate::storage::{AnalysisUpdate, Article, Database, NewAnalysis, ProcessingStatus};
use crate::util::truncate_chars;

/// Characters of article text sent to the model
pub const MAX_INPUT_CHARS: usize = 10_000;
const MAX_TOPICS: usize = 8;
const MAX_TOPIC_CHARS: usize = 50;
const MAX_SUMMARY_CHARS: usize = 2_000;

const SYSTEM_PROMPT: &str = "You are a news analysis assistant. \
     Reply with a single JSON object and nothing else.";

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("Article {0} not found")]
    NotFound(i64),
    #[error("All analysis calls failed: {0}")]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl AnalyzeError {
    /// Whether the queue should try this task again.
    pub fn is_retryable(&self) -> bool {
        match self {
            AnalyzeError::NotFound(_) => false,
            AnalyzeError::Llm(e) => e.is_retryable(),
            AnalyzeError::Storage(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Sentiment,
    Topics,
    Bias,
    Summary,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Sentiment,
        Operation::Topics,
        Operation::Bias,
        Operation::Summary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Sentiment => "sentiment",
            Operation::Topics => "topics",
            Operation::Bias => "bias",
            Operation::Summary => "summary",
        }
    }

    fn instructions(self) -> &'static str {
        match self {
            Operation::Sentiment => {
                "Rate the overall sentiment of this article. Respond as \
                 {\"score\": <-1.0 to 1.0>, \"label\": \"positive\"|\"neutral\"|\"negative\", \
                 \"confidence\": <0.0 to 1.0>}."
            }
            Operation::Topics => {
                "List up to 8 short lowercase topic tags and one category for this article. \
                 Respond as {\"topics\": [\"...\"], \"category\": \"...\", \
                 \"confidence\": <0.0 to 1.0>}."
            }
            Operation::Bias => {
                "Estimate the political bias of this article from -1.0 (left) to 1.0 (right), \
                 0 meaning neutral. Respond as {\"bias_score\": <number>, \
                 \"explanation\": \"...\"}."
            }
            Operation::Summary => {
                "Summarize this article in two or three sentences. \
                 Respond as {\"summary\": \"...\"}."
            }
        }
    }
}

/// What one article's analysis produced.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub article_id: i64,
    pub completed: Vec<Operation>,
    pub failed: Vec<Operation>,
}

/// Extract the outermost `{...}` from a model reply and parse it.
pub fn extract_json(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Lowercase, trim, drop empties and duplicates, keep at most 8.
pub fn normalize_topics<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut topics: Vec<String> = Vec::new();
    for topic in raw {
        let topic = topic
            .as_ref()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        let topic = truncate_chars(&topic, MAX_TOPIC_CHARS).to_string();
        if topic.is_empty() || topics.contains(&topic) {
            continue;
        }
        topics.push(topic);
        if topics.len() == MAX_TOPICS {
            break;
        }
    }
    topics
}

fn number(value: &Value, key: &str) -> Option<f64> {
    let parsed: Option<f64> = match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn sentiment_label(score: f64) -> &'static str {
    if score > 0.1 {
        "positive"
    } else if score < -0.1 {
        "negative"
    } else {
        "neutral"
    }
}

/// Fold one parsed reply into the update; returns the normalised result to persist.
fn apply_reply(op: Operation, reply: &Value, update: &mut AnalysisUpdate) -> Option<Value> {
    match op {
        Operation::Sentiment => {
            let score = number(reply, "score")?.clamp(-1.0, 1.0);
            let label = reply
                .get("label")
                .and_then(Value::as_str)
                .map(|l| l.trim().to_lowercase())
                .filter(|l| matches!(l.as_str(), "positive" | "neutral" | "negative"))
                .unwrap_or_else(|| sentiment_label(score).to_string());
            let confidence = number(reply, "confidence").map(|c| c.clamp(0.0, 1.0));
            update.sentiment_score = Some(score);
            update.sentiment_label = Some(label.clone());
            Some(json!({"score": score, "label": label, "confidence": confidence}))
        }
        Operation::Topics => {
            let topics = normalize_topics(
                reply
                    .get("topics")?
                    .as_array()?
                    .iter()
                    .filter_map(Value::as_str),
            );
            let category = reply
                .get("category")
                .and_then(Value::as_str)
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty());
            let confidence = number(reply, "confidence").map(|c| c.clamp(0.0, 1.0));
            update.topics = Some(topics.clone());
            update.category = category.clone();
            update.relevance_score = confidence;
            Some(json!({"topics": topics, "category": category, "confidence": confidence}))
        }
        Operation::Bias => {
            let score = number(reply, "bias_score")?.clamp(-1.0, 1.0);
            update.bias_score = Some(score);
            let explanation = reply.get("explanation").and_then(Value::as_str);
            Some(json!({"bias_score": score, "explanation": explanation}))
        }
        Operation::Summary => {
            let summary = reply.get("summary")?.as_str()?.trim();
            if summary.is_empty() {
                return None;
            }
            let summary = truncate_chars(summary, MAX_SUMMARY_CHARS).to_string();
            update.summary = Some(summary.clone());
            Some(json!({"summary": summary}))
        }
    }
}

fn article_prompt(op: Operation, article: &Article) -> String {
    let mut body = String::new();
    body.push_str("Title: ");
    body.push_str(&article.title);
    if let Some(description) = &article.description {
        body.push_str("\nDescription: ");
        body.push_str(description);
    }
    if let Some(content) = &article.content {
        body.push_str("\nContent: ");
        body.push_str(content);
    }
    format!(
        "{}\n\n{}",
        op.instructions(),
        truncate_chars(&body, MAX_INPUT_CHARS)
    )
}

pub struct Analyzer {
    db: Database,
    llm: Arc<dyn LlmClient>,
    monitor: Arc<AiMonitor>,
    max_tokens: u32,
}

impl Analyzer {
    pub fn new(db: Database, llm: Arc<dyn LlmClient>, monitor: Arc<AiMonitor>, max_tokens: u32) -> Self {
        Self {
            db,
            llm,
            monitor,
            max_tokens,
        }
    }

    /// Run all four analyses on an article and write the results back.
    ///
    /// Operations fail independently; the article is `completed` when at
    /// least one succeeded and `failed` when none did.
    pub async fn analyze_article(&self, article_id: i64) -> Result<AnalysisSummary, AnalyzeError> {
        let article = self
            .db
            .get_article(article_id)
            .await?
            .ok_or(AnalyzeError::NotFound(article_id))?;

        self.db
            .set_processing_status(article_id, ProcessingStatus::Processing)
            .await?;

        let mut update = AnalysisUpdate::default();
        let mut summary = AnalysisSummary {
            article_id,
            completed: Vec::new(),
            failed: Vec::new(),
        };
        let mut last_error = None;

        for op in Operation::ALL {
            match self.run_operation(op, &article, &mut update).await {
                Ok(()) => summary.completed.push(op),
                Err(e) => {
                    tracing::warn!(
                        article_id,
                        operation = op.as_str(),
                        error = %e,
                        "Analysis call failed"
                    );
                    summary.failed.push(op);
                    last_error = Some(e);
                }
            }
        }

        if summary.completed.is_empty() {
            self.db
                .set_processing_status(article_id, ProcessingStatus::Failed)
                .await?;
            let error = last_error.unwrap_or_else(|| LlmError::InvalidResponse("no result".into()));
            return Err(AnalyzeError::Llm(error));
        }

        self.db.apply_analysis(article_id, &update).await?;
        tracing::info!(
            article_id,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "Article analyzed"
        );
        Ok(summary)
    }

    async fn run_operation(
        &self,
        op: Operation,
        article: &Article,
        update: &mut AnalysisUpdate,
    ) -> Result<(), LlmError> {
        let request = CompletionRequest {
            system: Some(SYSTEM_PROMPT.to_string()),
            prompt: article_prompt(op, article),
            max_tokens: self.max_tokens,
        };

        let started = Instant::now();
        let result = self.llm.complete(request).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let now = chrono::Utc::now().timestamp();

        let completion = match result {
            Ok(c) => c,
            Err(e) => {
                self.monitor.record(CallRecord {
                    operation: op.as_str().to_string(),
                    model: self.llm.model().to_string(),
                    latency_ms,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    outcome: CallOutcome::Failure {
                        category: e.category().to_string(),
                    },
                    at: now,
                });
                return Err(e);
            }
        };

        let cost_usd =
            self.monitor
                .cost_for(&completion.model, completion.input_tokens, completion.output_tokens);
        let parsed = extract_json(&completion.text).and_then(|reply| apply_reply(op, &reply, update));
        let outcome = match &parsed {
            Some(_) => CallOutcome::Success,
            None => CallOutcome::Failure {
                category: "invalid_response".to_string(),
            },
        };
        self.monitor.record(CallRecord {
            operation: op.as_str().to_string(),
            model: completion.model.clone(),
            latency_ms,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost_usd,
            outcome,
            at: now,
        });

        let result = parsed.ok_or_else(|| {
            LlmError::InvalidResponse(format!("unparsable {} reply", op.as_str()))
        })?;

        let stored = self
            .db
            .insert_analysis(&NewAnalysis {
                article_id: article.id,
                analysis_type: op.as_str().to_string(),
                result,
                model: completion.model,
                input_tokens: completion.input_tokens as i64,
                output_tokens: completion.output_tokens as i64,
                cost_usd,
                latency_ms: latency_ms as i64,
            })
            .await;
        if let Err(e) = stored {
            tracing::warn!(article_id = article.id, error = %e, "Failed to store analysis row");
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ai::client::Completion;
    use crate::storage::{IncomingArticle, SourceRef};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies by matching a keyword in the prompt's instructions.
    pub(crate) struct ScriptedLlm {
        pub replies: Mutex<Vec<(Operation, Result<String, LlmError>)>>,
    }

    impl ScriptedLlm {
        pub(crate) fn healthy() -> Self {
            Self {
                replies: Mutex::new(vec![
                    (
                        Operation::Sentiment,
                        Ok(r#"Sure! {"score": 0.7, "label": "Positive", "confidence": 0.9}"#.into()),
                    ),
                    (
                        Operation::Topics,
                        Ok(r#"{"topics": ["AI", " ai ", "Chips"], "category": "Technology", "confidence": 0.8}"#.into()),
                    ),
                    (Operation::Bias, Ok(r#"{"bias_score": 3.0, "explanation": "x"}"#.into())),
                    (Operation::Summary, Ok(r#"{"summary": "Chip makers rally."}"#.into())),
                ]),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                replies: Mutex::new(Vec::new()),
            }
        }

        fn operation_of(prompt: &str) -> Option<Operation> {
            Operation::ALL
                .into_iter()
                .find(|op| prompt.starts_with(op.instructions()))
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
            let op = Self::operation_of(&request.prompt);
            let replies = self.replies.lock().unwrap();
            let reply = replies.iter().find(|(o, _)| Some(*o) == op);
            match reply {
                Some((_, Ok(text))) => Ok(Completion {
                    text: text.clone(),
                    model: "scripted".into(),
                    input_tokens: 1_000,
                    output_tokens: 100,
                }),
                Some((_, Err(_))) | None => Err(LlmError::Server(503)),
            }
        }
    }

    pub(crate) async fn seed_article(db: &Database) -> i64 {
        let source = db
            .upsert_source(&SourceRef {
                key: "test".into(),
                name: "Test".into(),
                provider: "manual".into(),
                url: None,
            })
            .await
            .unwrap();
        db.insert_article(
            source,
            &IncomingArticle {
                title: "Chip stocks surge".into(),
                description: Some("Semiconductors rally on AI demand".into()),
                content: Some("Long body ".repeat(5_000)),
                url: "https://example.com/chips".into(),
                author: None,
                category: None,
                published_at: None,
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_extract_json_lenient() {
        assert_eq!(
            extract_json("Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```"),
            Some(json!({"a": {"b": 1}}))
        );
        assert_eq!(extract_json("no json"), None);
        assert_eq!(extract_json("} backwards {"), None);
        assert_eq!(extract_json("{broken"), None);
    }

    #[test]
    fn test_normalize_topics() {
        let topics = normalize_topics(["  Climate  Change ", "climate change", "", "A", "b", "c", "d", "e", "f", "g", "h"]);
        assert_eq!(topics.len(), 8);
        assert_eq!(topics[0], "climate change");
        assert_eq!(topics[1], "a");
    }

    #[test]
    fn test_apply_reply_clamps_and_defaults() {
        let mut update = AnalysisUpdate::default();
        apply_reply(Operation::Sentiment, &json!({"score": "-4"}), &mut update).unwrap();
        assert_eq!(update.sentiment_score, Some(-1.0));
        assert_eq!(update.sentiment_label.as_deref(), Some("negative"));

        assert!(apply_reply(Operation::Bias, &json!({"bias": 1}), &mut update).is_none());
        assert!(apply_reply(Operation::Summary, &json!({"summary": "  "}), &mut update).is_none());
    }

    #[test]
    fn test_prompt_truncates_input() {
        let db_article = Article {
            id: 1,
            source_id: 1,
            source_name: "s".into(),
            title: "t".into(),
            description: None,
            content: Some("é".repeat(20_000)),
            url: "https://example.com".into(),
            author: None,
            category: None,
            published_at: None,
            fetched_at: 0,
            sentiment_score: None,
            sentiment_label: None,
            bias_score: None,
            relevance_score: None,
            topics: Vec::new(),
            summary: None,
            processing_status: ProcessingStatus::Pending,
            view_count: 0,
        };
        let prompt = article_prompt(Operation::Summary, &db_article);
        let body = prompt.split("\n\n").nth(1).unwrap();
        assert_eq!(body.chars().count(), MAX_INPUT_CHARS);
    }

    #[tokio::test]
    async fn test_analyze_article_persists_results() {
        let db = Database::open(":memory:").await.unwrap();
        let id = seed_article(&db).await;
        let monitor = Arc::new(AiMonitor::default());
        let analyzer = Analyzer::new(db.clone(), Arc::new(ScriptedLlm::healthy()), monitor.clone(), 256);

        let summary = analyzer.analyze_article(id).await.unwrap();
        assert_eq!(summary.completed.len(), 4);
        assert!(summary.failed.is_empty());

        let article = db.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.processing_status, ProcessingStatus::Completed);
        assert_eq!(article.sentiment_score, Some(0.7));
        assert_eq!(article.sentiment_label.as_deref(), Some("positive"));
        assert_eq!(article.topics, vec!["ai".to_string(), "chips".to_string()]);
        assert_eq!(article.category.as_deref(), Some("technology"));
        assert_eq!(article.relevance_score, Some(0.8));
        assert_eq!(article.bias_score, Some(1.0));
        assert_eq!(article.summary.as_deref(), Some("Chip makers rally."));

        let analyses = db.get_analyses_for_article(id).await.unwrap();
        assert_eq!(analyses.len(), 4);

        let snap = monitor.snapshot(chrono::Utc::now().timestamp());
        assert_eq!(snap.total_calls, 4);
        assert_eq!(snap.total_input_tokens, 4_000);
    }

    #[tokio::test]
    async fn test_partial_failure_still_completes() {
        let db = Database::open(":memory:").await.unwrap();
        let id = seed_article(&db).await;
        let llm = ScriptedLlm::healthy();
        llm.replies
            .lock()
            .unwrap()
            .retain(|(op, _)| *op != Operation::Bias);
        let analyzer = Analyzer::new(db.clone(), Arc::new(llm), Arc::new(AiMonitor::default()), 256);

        let summary = analyzer.analyze_article(id).await.unwrap();
        assert_eq!(summary.failed, vec![Operation::Bias]);
        let article = db.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.processing_status, ProcessingStatus::Completed);
        assert!(article.bias_score.is_none());
    }

    #[tokio::test]
    async fn test_total_failure_marks_article_failed() {
        let db = Database::open(":memory:").await.unwrap();
        let id = seed_article(&db).await;
        let monitor = Arc::new(AiMonitor::default());
        let analyzer = Analyzer::new(db.clone(), Arc::new(ScriptedLlm::failing()), monitor.clone(), 256);

        let err = analyzer.analyze_article(id).await.unwrap_err();
        assert!(err.is_retryable());
        let article = db.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.processing_status, ProcessingStatus::Failed);
        assert_eq!(monitor.snapshot(0).errors_by_category["server"], 4);
    }

    #[tokio::test]
    async fn test_missing_article() {
        let db = Database::open(":memory:").await.unwrap();
        let analyzer = Analyzer::new(db, Arc::new(ScriptedLlm::healthy()), Arc::new(AiMonitor::default()), 256);
        let err = analyzer.analyze_article(999).await.unwrap_err();
        assert!(matches!(err, AnalyzeError::NotFound(999)));
        assert!(!err.is_retryable());
    }
}
