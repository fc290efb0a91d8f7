use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("The database is locked by another process. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if is_lock_message(&error_string) || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

pub(crate) fn is_lock_message(lowercase: &str) -> bool {
    lowercase.contains("database is locked")
        || lowercase.contains("database table is locked")
        || lowercase.contains("sqlite_busy")
        || lowercase.contains("sqlite_locked")
}

/// Errors from mutations that can violate a uniqueness constraint.
///
/// Handlers map `Conflict` to HTTP 409 and `NotFound` to 404; everything
/// else is an internal error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0} already exists")]
    Conflict(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Translate SQLite UNIQUE violations into `Conflict`, FK violations into `NotFound`.
    pub(crate) fn classify(err: sqlx::Error, what: &'static str) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StorageError::Conflict(what);
            }
            if db_err.is_foreign_key_violation() {
                return StorageError::NotFound("referenced row");
            }
        }
        StorageError::Database(err)
    }
}

// ============================================================================
// FTS5 Consistency Report
// ============================================================================

/// Detailed FTS consistency report
///
/// Compares the `articles_fts` index against the `articles` table. Orphaned
/// entries are in FTS but not in articles; missing entries are the reverse.
#[derive(Debug)]
pub struct FtsConsistencyReport {
    pub articles_count: i64,
    pub fts_count: i64,
    pub orphaned_fts_entries: i64,
    pub missing_fts_entries: i64,
    pub is_consistent: bool,
}

// ============================================================================
// Sources
// ============================================================================

/// Identity of the outlet an incoming article belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRef {
    /// Unique slug, e.g. `newsapi:bbc-news` or `guardian`
    pub key: String,
    pub name: String,
    pub provider: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub key: String,
    pub name: String,
    pub provider: String,
    pub url: Option<String>,
    pub last_fetched: Option<i64>,
    pub error: Option<String>,
    /// Number of consecutive fetch failures (circuit breaker)
    pub consecutive_failures: i64,
}

// ============================================================================
// Articles
// ============================================================================

/// An article as reported by a news provider, before it has a row.
#[derive(Debug, Clone)]
pub struct IncomingArticle {
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<i64>,
}

/// Processing lifecycle of the AI enrichment pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub(crate) fn from_db(s: &str) -> Self {
        match s {
            "processing" => ProcessingStatus::Processing,
            "completed" => ProcessingStatus::Completed,
            "failed" => ProcessingStatus::Failed,
            _ => ProcessingStatus::Pending,
        }
    }
}

/// Internal row type for Article queries (used by sqlx FromRow).
/// `topics` is stored as a JSON array string.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<i64>,
    pub fetched_at: i64,
    pub sentiment_score: Option<f64>,
    pub sentiment_label: Option<String>,
    pub bias_score: Option<f64>,
    pub relevance_score: Option<f64>,
    pub topics: String,
    pub summary: Option<String>,
    pub processing_status: String,
    pub view_count: i64,
}

/// Column list matching [`ArticleDbRow`]; queries alias `articles` as `a`
/// and join `sources` as `s`.
pub(crate) const ARTICLE_COLUMNS: &str = "a.id, a.source_id, s.name AS source_name, a.title, \
     a.description, a.content, a.url, a.author, a.category, a.published_at, a.fetched_at, \
     a.sentiment_score, a.sentiment_label, a.bias_score, a.relevance_score, a.topics, \
     a.summary, a.processing_status, a.view_count";

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        let topics = serde_json::from_str(&self.topics).unwrap_or_else(|e| {
            tracing::warn!(article_id = self.id, error = %e, "Malformed topics column");
            Vec::new()
        });
        Article {
            id: self.id,
            source_id: self.source_id,
            source_name: self.source_name,
            title: self.title,
            description: self.description,
            content: self.content,
            url: self.url,
            author: self.author,
            category: self.category,
            published_at: self.published_at,
            fetched_at: self.fetched_at,
            sentiment_score: self.sentiment_score,
            sentiment_label: self.sentiment_label,
            bias_score: self.bias_score,
            relevance_score: self.relevance_score,
            topics,
            summary: self.summary,
            processing_status: ProcessingStatus::from_db(&self.processing_status),
            view_count: self.view_count,
        }
    }
}

/// Article data from database
#[derive(Debug, Clone, Serialize)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub source_name: String,
    pub title: String,
    pub description: Option<String>,
    pub content: Option<String>,
    pub url: String,
    pub author: Option<String>,
    pub category: Option<String>,
    pub published_at: Option<i64>,
    pub fetched_at: i64,
    pub sentiment_score: Option<f64>,
    pub sentiment_label: Option<String>,
    pub bias_score: Option<f64>,
    pub relevance_score: Option<f64>,
    pub topics: Vec<String>,
    pub summary: Option<String>,
    pub processing_status: ProcessingStatus,
    pub view_count: i64,
}

impl Article {
    /// Publication time, falling back to when we first saw the article.
    pub fn effective_published(&self) -> i64 {
        self.published_at.unwrap_or(self.fetched_at)
    }
}

/// Number of new and refreshed rows from an ingest upsert.
#[derive(Debug, Default, Clone)]
pub struct UpsertOutcome {
    pub inserted_ids: Vec<i64>,
    pub updated: usize,
}

/// AI enrichment results written back onto an article row.
#[derive(Debug, Clone, Default)]
pub struct AnalysisUpdate {
    pub sentiment_score: Option<f64>,
    pub sentiment_label: Option<String>,
    pub bias_score: Option<f64>,
    pub relevance_score: Option<f64>,
    pub topics: Option<Vec<String>>,
    pub category: Option<String>,
    pub summary: Option<String>,
}

// ============================================================================
// Users
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub password_salt: String,
    pub is_active: bool,
    pub created_at: i64,
    pub last_login_at: Option<i64>,
}

/// Per-user feed settings. Stored as one row per user; lists are JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub preferred_categories: Vec<String>,
    pub preferred_sources: Vec<i64>,
    pub excluded_topics: Vec<String>,
    pub language: String,
    pub articles_per_page: i64,
    pub email_digest: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            preferred_categories: Vec::new(),
            preferred_sources: Vec::new(),
            excluded_topics: Vec::new(),
            language: "en".to_string(),
            articles_per_page: 20,
            email_digest: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Bookmark {
    pub id: i64,
    pub article_id: i64,
    pub article_title: String,
    pub article_url: String,
    pub note: Option<String>,
    pub created_at: i64,
}

// ============================================================================
// Trending & Analyses
// ============================================================================

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TrendingTopic {
    pub topic: String,
    pub article_count: i64,
    pub source_count: i64,
    pub avg_sentiment: f64,
    pub score: f64,
    pub window_hours: i64,
    pub computed_at: i64,
}

/// One row per (article, topic) pair inside a trending window.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TopicSample {
    pub article_id: i64,
    pub source_id: i64,
    pub sentiment_score: Option<f64>,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub article_id: i64,
    pub analysis_type: String,
    pub result: serde_json::Value,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleAnalysis {
    pub id: i64,
    pub article_id: i64,
    pub analysis_type: String,
    pub result: serde_json::Value,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub latency_ms: i64,
    pub created_at: i64,
}

// ============================================================================
// Task Queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Dead => "dead",
        }
    }

    pub(crate) fn from_db(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "dead" => TaskStatus::Dead,
            _ => TaskStatus::Queued,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskDbRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl TaskDbRow {
    pub(crate) fn into_record(self) -> TaskRecord {
        let payload = serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null);
        TaskRecord {
            id: self.id,
            kind: self.kind,
            payload,
            status: TaskStatus::from_db(&self.status),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            next_run_at: self.next_run_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub attempt: i64,
    pub max_attempts: i64,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub queued: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub dead: i64,
}

// ============================================================================
// Analytics
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct OverviewStats {
    pub total_articles: i64,
    pub total_sources: i64,
    pub total_users: i64,
    pub articles_last_24h: i64,
    pub pending_analysis: i64,
    pub failed_analysis: i64,
    pub average_sentiment: Option<f64>,
    pub sentiment_distribution: SentimentDistribution,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SentimentDistribution {
    pub positive: i64,
    pub neutral: i64,
    pub negative: i64,
    pub unknown: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SentimentPoint {
    /// UTC day, `YYYY-MM-DD`
    pub day: String,
    pub article_count: i64,
    pub avg_sentiment: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SourceStat {
    pub source_id: i64,
    pub name: String,
    pub provider: String,
    pub article_count: i64,
    pub avg_sentiment: Option<f64>,
    pub avg_bias: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CategoryStat {
    pub category: String,
    pub article_count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ViewedArticle {
    pub article_id: i64,
    pub title: String,
    pub views: i64,
}
