//! REST API under `/api/v1`.

mod analytics;
mod articles;
pub mod auth;
mod error;
mod extract;
mod search;
mod tasks;
mod users;
mod validate;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::RateLimiter;
pub use error::{ApiError, FieldIssue};

use crate::ai::{AiMonitor, Analyzer, LlmClient, MonitorSettings};
use crate::config::Config;
use crate::providers::NewsProvider;
use crate::search::SimilarityIndex;
use crate::storage::Database;
use crate::tasks::{RetryPolicy, TaskContext, TaskQueue, WorkerSettings};

/// Shared handler state.
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub monitor: Arc<AiMonitor>,
    pub queue: TaskQueue,
    pub limiter: RateLimiter,
    pub providers: Arc<Vec<Arc<dyn NewsProvider>>>,
    pub analyzer: Arc<Analyzer>,
    pub similarity: SimilarityIndex,
}

impl AppState {
    /// Wire the monitor, queue and analyzer around an opened database.
    pub fn new(
        db: Database,
        config: Config,
        llm: Arc<dyn LlmClient>,
        providers: Vec<Arc<dyn NewsProvider>>,
    ) -> Self {
        let monitor = Arc::new(AiMonitor::new(MonitorSettings::from_config(
            &config.monitor,
            &config.llm,
        )));
        let queue = TaskQueue::new(db.clone(), RetryPolicy::from_config(&config.worker));
        let analyzer = Arc::new(Analyzer::new(
            db.clone(),
            llm,
            Arc::clone(&monitor),
            config.llm.max_tokens,
        ));
        Self {
            limiter: RateLimiter::new(config.server.rate_limit_per_minute),
            db,
            monitor,
            queue,
            providers: Arc::new(providers),
            analyzer,
            similarity: SimilarityIndex::default(),
            config,
        }
    }

    /// Context for the worker pool, sharing this state's handles.
    pub fn task_context(&self) -> TaskContext {
        TaskContext {
            db: self.db.clone(),
            queue: self.queue.clone(),
            providers: Arc::clone(&self.providers),
            analyzer: Arc::clone(&self.analyzer),
            settings: WorkerSettings::from_config(&self.config),
        }
    }
}

/// Build the axum router with all routes
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        // Articles
        .route("/articles", get(articles::list_articles).post(articles::create_article))
        .route("/articles/{id}", get(articles::get_article).delete(articles::delete_article))
        .route("/articles/{id}/analyze", post(articles::analyze_article))
        .route("/articles/{id}/analysis", get(articles::get_analysis))
        .route("/articles/{id}/similar", get(articles::similar_articles))
        // Users
        .route("/users/register", post(users::register))
        .route("/users/login", post(users::login))
        .route("/users/logout", post(users::logout))
        .route("/users/me", get(users::me))
        .route(
            "/users/me/preferences",
            get(users::get_preferences).put(users::update_preferences),
        )
        .route(
            "/users/me/bookmarks",
            get(users::list_bookmarks).post(users::add_bookmark),
        )
        .route("/users/me/bookmarks/{article_id}", delete(users::remove_bookmark))
        .route("/users/me/feed", get(users::feed))
        // Search
        .route("/search", get(search::search))
        .route("/search/semantic", get(search::semantic_search))
        .route("/search/trending", get(search::trending))
        .route("/search/suggestions", get(search::suggestions))
        // Analytics
        .route("/analytics/overview", get(analytics::overview))
        .route("/analytics/sentiment", get(analytics::sentiment))
        .route("/analytics/sources", get(analytics::sources))
        .route("/analytics/most-viewed", get(analytics::most_viewed))
        .route("/analytics/ai-monitor", get(analytics::ai_monitor))
        .route("/analytics/ai-monitor/alerts", get(analytics::ai_alerts))
        .route("/analytics/tasks", get(analytics::task_stats))
        // Tasks
        .route("/tasks/fetch-news", post(tasks::fetch_news))
        .route("/tasks/trending", post(tasks::compute_trending))
        .route("/tasks/batch-analyze", post(tasks::batch_analyze))
        .route("/tasks/{id}", get(tasks::get_task))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::rate_limit,
        ));

    Router::new()
        .nest("/api/v1", api)
        .fallback(|| async { ApiError::NotFound("No such route".to_string()) })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    database: &'static str,
    providers: Vec<&'static str>,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let database = match state.db.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Health check database ping failed");
            "unavailable"
        }
    };
    Json(Health {
        status: if database == "ok" { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        database,
        providers: state.providers.iter().map(|p| p.name()).collect(),
    })
}

/// Serve until `shutdown` resolves, then drain in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
