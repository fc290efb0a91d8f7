//! Worker pool draining the persistent task queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::queue::{TaskPayload, TaskQueue};
use crate::ai::Analyzer;
use crate::config::Config;
use crate::providers::{run_fetch, FetchOptions, FetchRequest, NewsProvider};
use crate::search::{refresh_trending, TrendingParams};
use crate::storage::{Database, ProcessingStatus, TaskRecord, TaskStatus};

/// `running` tasks older than this are assumed orphaned
const STALE_TASK_SECS: i64 = 600;
/// Largest backlog one batch task will take on
const MAX_BATCH: i64 = 500;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub batch_concurrency: usize,
    pub auto_analyze: bool,
    pub fetch: FetchRequest,
    pub provider_concurrency: usize,
    pub trending: TrendingParams,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms.max(10)),
            batch_concurrency: config.worker.batch_concurrency.max(1),
            auto_analyze: config.worker.auto_analyze,
            fetch: FetchRequest {
                query: config.providers.default_query.clone(),
                page_size: config.providers.page_size,
            },
            provider_concurrency: config.providers.max_concurrent.max(1),
            trending: TrendingParams {
                window_hours: config.trending.window_hours,
                min_articles: config.trending.min_articles,
                top_n: config.trending.top_n,
            },
        }
    }
}

/// Everything a task needs to run.
pub struct TaskContext {
    pub db: Database,
    pub queue: TaskQueue,
    pub providers: Arc<Vec<Arc<dyn NewsProvider>>>,
    pub analyzer: Arc<Analyzer>,
    pub settings: WorkerSettings,
}

/// A task failure and whether the queue may retry it.
struct TaskFailure {
    error: anyhow::Error,
    retryable: bool,
}

impl TaskFailure {
    fn retry(error: anyhow::Error) -> Self {
        Self {
            error,
            retryable: true,
        }
    }

    fn permanent(error: anyhow::Error) -> Self {
        Self {
            error,
            retryable: false,
        }
    }
}

/// Claim and run one due task. Returns the task and its final status, or
/// `None` when nothing is due.
pub async fn process_next_task(ctx: &TaskContext) -> Result<Option<(TaskRecord, TaskStatus)>> {
    let now = chrono::Utc::now().timestamp();
    let Some(task) = ctx.db.claim_next_task(now).await? else {
        return Ok(None);
    };

    tracing::debug!(task_id = task.id, kind = %task.kind, attempt = task.attempt, "Task claimed");

    let result = match TaskPayload::from_record(&task) {
        Ok(payload) => execute(ctx, &payload).await,
        Err(e) => Err(TaskFailure::permanent(e)),
    };

    let status = match result {
        Ok(output) => {
            ctx.db.complete_task(task.id).await?;
            tracing::info!(task_id = task.id, kind = %task.kind, output = %output, "Task succeeded");
            TaskStatus::Succeeded
        }
        Err(failure) => {
            let message = format!("{:#}", failure.error);
            let status = ctx.queue.fail(&task, &message, failure.retryable).await?;
            tracing::warn!(
                task_id = task.id,
                kind = %task.kind,
                attempt = task.attempt + 1,
                status = status.as_str(),
                error = %message,
                "Task failed"
            );
            status
        }
    };

    Ok(Some((task, status)))
}

async fn execute(ctx: &TaskContext, payload: &TaskPayload) -> Result<Value, TaskFailure> {
    match payload {
        TaskPayload::FetchNews { query, force } => {
            let request = FetchRequest {
                query: query.clone().or_else(|| ctx.settings.fetch.query.clone()),
                page_size: ctx.settings.fetch.page_size,
            };
            let options = FetchOptions {
                force: *force,
                max_concurrent: ctx.settings.provider_concurrency,
            };
            let report = run_fetch(&ctx.db, &ctx.providers, &request, options).await;

            if !report.results.is_empty() && report.failures() == report.results.len() {
                return Err(TaskFailure::retry(anyhow!(
                    "all {} providers failed",
                    report.results.len()
                )));
            }

            if ctx.settings.auto_analyze && report.inserted() > 0 {
                let limit = (report.inserted() as i64).min(MAX_BATCH);
                if let Err(e) = ctx.queue.submit(&TaskPayload::BatchAnalyze { limit }).await {
                    tracing::warn!(error = %e, "Failed to queue analysis of new articles");
                }
            }

            Ok(json!({ "inserted": report.inserted(), "providers": report.results }))
        }
        TaskPayload::AnalyzeArticle { article_id } => {
            match ctx.analyzer.analyze_article(*article_id).await {
                Ok(summary) => Ok(json!(summary)),
                Err(e) => {
                    let retryable = e.is_retryable();
                    Err(TaskFailure {
                        error: e.into(),
                        retryable,
                    })
                }
            }
        }
        TaskPayload::BatchAnalyze { limit } => batch_analyze(ctx, *limit)
            .await
            .map_err(TaskFailure::retry),
        TaskPayload::ComputeTrending { window_hours } => {
            let params = TrendingParams {
                window_hours: window_hours.unwrap_or(ctx.settings.trending.window_hours),
                ..ctx.settings.trending
            };
            let now = chrono::Utc::now().timestamp();
            let topics = refresh_trending(&ctx.db, &params, now)
                .await
                .map_err(TaskFailure::retry)?;
            Ok(json!({ "topics": topics.len(), "window_hours": params.window_hours }))
        }
    }
}

/// Analyze pending articles with bounded concurrency.
///
/// Individual failures are counted and skipped; only a storage error
/// loading the backlog fails the task.
async fn batch_analyze(ctx: &TaskContext, limit: i64) -> Result<Value> {
    let pending = ctx
        .db
        .get_articles_by_status(ProcessingStatus::Pending, limit.clamp(1, MAX_BATCH))
        .await?;
    let total = pending.len();
    let succeeded = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let analyses: Vec<_> = pending
        .into_iter()
        .map(|article| {
            let analyzer = Arc::clone(&ctx.analyzer);
            let succeeded = &succeeded;
            let failed = &failed;
            async move {
                match analyzer.analyze_article(article.id).await {
                    Ok(_) => {
                        succeeded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(article_id = article.id, error = %e, "Batch analysis skipped article");
                    }
                }
            }
        })
        .collect();
    stream::iter(analyses)
        .buffer_unordered(ctx.settings.batch_concurrency.max(1))
        .collect::<Vec<()>>()
        .await;

    let succeeded = succeeded.into_inner();
    let failed = failed.into_inner();
    tracing::info!(total, succeeded, failed, "Batch analysis complete");
    Ok(json!({ "total": total, "succeeded": succeeded, "failed": failed }))
}

/// Fixed set of worker tasks sharing one [`TaskContext`].
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Requeue orphaned tasks, then start `workers` loops.
    ///
    /// Each loop claims due tasks until the queue is empty, then sleeps for
    /// the poll interval. Setting the watch value to `true` (or dropping the
    /// sender) stops every loop after its current task.
    pub async fn spawn(
        ctx: Arc<TaskContext>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let now = chrono::Utc::now().timestamp();
        ctx.db.requeue_stale(now - STALE_TASK_SECS).await?;
        let interrupted = ctx.db.reset_interrupted_analyses().await?;
        if interrupted > 0 {
            tracing::info!(articles = interrupted, "Reset interrupted analyses to pending");
        }

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(worker_id, ctx, shutdown))
            })
            .collect::<Vec<_>>();

        tracing::info!(workers = handles.len(), "Worker pool started");
        Ok(Self { handles })
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<TaskContext>, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_next_task(&ctx).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "Worker failed to process task");
            }
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(ctx.settings.poll_interval) => {}
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::analyzer::tests::{seed_article, ScriptedLlm};
    use crate::ai::AiMonitor;
    use crate::tasks::queue::RetryPolicy;

    fn context(db: &Database, llm: ScriptedLlm) -> TaskContext {
        let analyzer = Analyzer::new(db.clone(), Arc::new(llm), Arc::new(AiMonitor::default()), 128);
        TaskContext {
            db: db.clone(),
            queue: TaskQueue::new(
                db.clone(),
                RetryPolicy {
                    max_attempts: 2,
                    backoff_base_secs: 60,
                    backoff_cap_secs: 60,
                },
            ),
            providers: Arc::new(Vec::new()),
            analyzer: Arc::new(analyzer),
            settings: WorkerSettings {
                poll_interval: Duration::from_millis(10),
                ..WorkerSettings::from_config(&Config::default())
            },
        }
    }

    #[tokio::test]
    async fn test_idle_queue_returns_none() {
        let db = Database::open(":memory:").await.unwrap();
        let ctx = context(&db, ScriptedLlm::healthy());
        assert!(process_next_task(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyze_task_succeeds() {
        let db = Database::open(":memory:").await.unwrap();
        let article_id = seed_article(&db).await;
        let ctx = context(&db, ScriptedLlm::healthy());
        let task = ctx
            .queue
            .submit(&TaskPayload::AnalyzeArticle { article_id })
            .await
            .unwrap();

        let (ran, status) = process_next_task(&ctx).await.unwrap().unwrap();
        assert_eq!(ran.id, task.id);
        assert_eq!(status, TaskStatus::Succeeded);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeeded);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_retryable_failure_backs_off() {
        let db = Database::open(":memory:").await.unwrap();
        let article_id = seed_article(&db).await;
        let ctx = context(&db, ScriptedLlm::failing());
        let task = ctx
            .queue
            .submit(&TaskPayload::AnalyzeArticle { article_id })
            .await
            .unwrap();

        let (_, status) = process_next_task(&ctx).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Failed);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 1);
        assert!(stored.next_run_at >= task.next_run_at + 60);
        assert!(stored.last_error.unwrap().contains("503"));
        // Not due yet
        assert!(process_next_task(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_article_is_dead() {
        let db = Database::open(":memory:").await.unwrap();
        let ctx = context(&db, ScriptedLlm::healthy());
        ctx.queue
            .submit(&TaskPayload::AnalyzeArticle { article_id: 42 })
            .await
            .unwrap();
        let (_, status) = process_next_task(&ctx).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Dead);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead() {
        let db = Database::open(":memory:").await.unwrap();
        let ctx = context(&db, ScriptedLlm::healthy());
        let now = chrono::Utc::now().timestamp();
        db.enqueue_task("batch_analyze", &json!({"kind": "nope"}), 3, now)
            .await
            .unwrap();
        let (_, status) = process_next_task(&ctx).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Dead);
    }

    #[tokio::test]
    async fn test_batch_analyze_skips_failures() {
        let db = Database::open(":memory:").await.unwrap();
        let first = seed_article(&db).await;
        let ctx = context(&db, ScriptedLlm::healthy());
        ctx.queue
            .submit(&TaskPayload::BatchAnalyze { limit: 10 })
            .await
            .unwrap();

        let (_, status) = process_next_task(&ctx).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Succeeded);
        let article = db.get_article(first).await.unwrap().unwrap();
        assert_eq!(article.processing_status, ProcessingStatus::Completed);

        // A failing model marks articles failed but the batch still succeeds
        let failing = context(&db, ScriptedLlm::failing());
        db.set_processing_status(first, ProcessingStatus::Pending).await.unwrap();
        failing
            .queue
            .submit(&TaskPayload::BatchAnalyze { limit: 10 })
            .await
            .unwrap();
        let (_, status) = process_next_task(&failing).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Succeeded);
        let article = db.get_article(first).await.unwrap().unwrap();
        assert_eq!(article.processing_status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn test_fetch_with_no_providers_succeeds() {
        let db = Database::open(":memory:").await.unwrap();
        let ctx = context(&db, ScriptedLlm::healthy());
        ctx.queue
            .submit(&TaskPayload::FetchNews {
                query: None,
                force: false,
            })
            .await
            .unwrap();
        let (_, status) = process_next_task(&ctx).await.unwrap().unwrap();
        assert_eq!(status, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let db = Database::open(":memory:").await.unwrap();
        let ctx = Arc::new(context(&db, ScriptedLlm::healthy()));
        let task = ctx
            .queue
            .submit(&TaskPayload::ComputeTrending { window_hours: Some(6) })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::spawn(Arc::clone(&ctx), 2, rx).await.unwrap();

        let mut status = TaskStatus::Queued;
        for _ in 0..200 {
            status = db.get_task(task.id).await.unwrap().unwrap().status;
            if status == TaskStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Succeeded);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("workers should stop on shutdown");
    }

    #[tokio::test]
    async fn test_spawn_resumes_interrupted_analysis() {
        let db = Database::open(":memory:").await.unwrap();
        let article_id = seed_article(&db).await;
        // A previous run died between marking the article and finishing it
        db.set_processing_status(article_id, ProcessingStatus::Processing)
            .await
            .unwrap();
        let ctx = Arc::new(context(&db, ScriptedLlm::healthy()));
        let task = ctx
            .queue
            .submit(&TaskPayload::BatchAnalyze { limit: 10 })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::spawn(Arc::clone(&ctx), 1, rx).await.unwrap();
        let mut status = TaskStatus::Queued;
        for _ in 0..200 {
            status = db.get_task(task.id).await.unwrap().unwrap().status;
            if status == TaskStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Succeeded);
        let article = db.get_article(article_id).await.unwrap().unwrap();
        assert_eq!(article.processing_status, ProcessingStatus::Completed);

        tx.send(true).unwrap();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_spawn_requeues_stale_tasks() {
        let db = Database::open(":memory:").await.unwrap();
        let ctx = Arc::new(context(&db, ScriptedLlm::healthy()));
        let task = ctx
            .queue
            .submit(&TaskPayload::ComputeTrending { window_hours: None })
            .await
            .unwrap();
        // Claimed long ago by a worker that never finished
        let stale_claim = db
            .claim_next_task(chrono::Utc::now().timestamp())
            .await
            .unwrap();
        assert!(stale_claim.is_some());
        sqlx::query("UPDATE analysis_tasks SET started_at = started_at - 3600 WHERE id = ?")
            .bind(task.id)
            .execute(&db.pool)
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let pool = WorkerPool::spawn(Arc::clone(&ctx), 1, rx).await.unwrap();
        let mut status = TaskStatus::Running;
        for _ in 0..200 {
            status = db.get_task(task.id).await.unwrap().unwrap().status;
            if status == TaskStatus::Succeeded {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::Succeeded);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("workers should stop when the sender is dropped");
    }
}
