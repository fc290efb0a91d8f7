use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::WorkerConfig;
use crate::storage::{Database, TaskRecord, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FetchNews,
    AnalyzeArticle,
    BatchAnalyze,
    ComputeTrending,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::FetchNews => "fetch_news",
            TaskKind::AnalyzeArticle => "analyze_article",
            TaskKind::BatchAnalyze => "batch_analyze",
            TaskKind::ComputeTrending => "compute_trending",
        }
    }
}

/// Typed task body, stored as the row's JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    FetchNews {
        #[serde(default)]
        query: Option<String>,
        /// Ignore the circuit breaker
        #[serde(default)]
        force: bool,
    },
    AnalyzeArticle {
        article_id: i64,
    },
    BatchAnalyze {
        limit: i64,
    },
    ComputeTrending {
        #[serde(default)]
        window_hours: Option<i64>,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::FetchNews { .. } => TaskKind::FetchNews,
            TaskPayload::AnalyzeArticle { .. } => TaskKind::AnalyzeArticle,
            TaskPayload::BatchAnalyze { .. } => TaskKind::BatchAnalyze,
            TaskPayload::ComputeTrending { .. } => TaskKind::ComputeTrending,
        }
    }

    pub fn from_record(record: &TaskRecord) -> Result<Self> {
        serde_json::from_value(record.payload.clone())
            .with_context(|| format!("Malformed payload for task {} ({})", record.id, record.kind))
    }
}

/// `delay = min(base * 2^attempt, cap)`; dead after `max_attempts` failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base_secs: config.backoff_base_secs.max(0),
            backoff_cap_secs: config.backoff_cap_secs.max(0),
        }
    }

    /// Delay before retrying after failure number `attempt + 1`.
    pub fn delay_secs(&self, attempt: i64) -> i64 {
        let exponent = attempt.clamp(0, 32) as u32;
        self.backoff_base_secs
            .saturating_mul(2i64.saturating_pow(exponent))
            .min(self.backoff_cap_secs)
    }

    /// When to run again, or `None` if this failure exhausts the budget.
    ///
    /// `attempt` is the count of failures before this one.
    pub fn retry_at(&self, attempt: i64, max_attempts: i64, now: i64) -> Option<i64> {
        if attempt + 1 >= max_attempts {
            return None;
        }
        Some(now + self.delay_secs(attempt))
    }
}

/// Producer side of the persistent task queue.
#[derive(Clone)]
pub struct TaskQueue {
    db: Database,
    policy: RetryPolicy,
}

impl TaskQueue {
    pub fn new(db: Database, policy: RetryPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Persist a task, due immediately.
    pub async fn submit(&self, payload: &TaskPayload) -> Result<TaskRecord> {
        let now = chrono::Utc::now().timestamp();
        let body = serde_json::to_value(payload)?;
        let record = self
            .db
            .enqueue_task(payload.kind().as_str(), &body, self.policy.max_attempts, now)
            .await?;
        tracing::debug!(task_id = record.id, kind = %record.kind, "Task queued");
        Ok(record)
    }

    /// Submit unless a task of the same kind is already waiting or running.
    pub async fn submit_unique(&self, payload: &TaskPayload) -> Result<Option<TaskRecord>> {
        if self.db.has_open_task(payload.kind().as_str()).await? {
            tracing::debug!(kind = payload.kind().as_str(), "Task already pending, not queued");
            return Ok(None);
        }
        self.submit(payload).await.map(Some)
    }

    /// Record a failure, scheduling a retry when `retryable` and attempts remain.
    pub async fn fail(&self, task: &TaskRecord, error: &str, retryable: bool) -> Result<TaskStatus> {
        let now = chrono::Utc::now().timestamp();
        let retry_at = if retryable {
            self.policy.retry_at(task.attempt, task.max_attempts, now)
        } else {
            None
        };
        self.db.fail_task(task.id, error, retry_at).await
    }
}
