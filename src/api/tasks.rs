use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::auth::AuthUser;
use super::error::{ApiError, Violations};
use super::extract::optional_body;
use super::AppState;
use crate::storage::{TaskRecord, TaskStatus};
use crate::tasks::TaskPayload;

const MAX_QUERY_CHARS: usize = 200;
const MAX_BATCH_LIMIT: i64 = 500;
const MAX_WINDOW_HOURS: i64 = 24 * 30;

#[derive(Debug, Serialize)]
struct Accepted {
    task_id: i64,
    kind: String,
    status: TaskStatus,
}

async fn submit(state: &AppState, payload: TaskPayload) -> Result<impl IntoResponse, ApiError> {
    let task = state.queue.submit(&payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            task_id: task.id,
            kind: task.kind,
            status: task.status,
        }),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct FetchBody {
    query: Option<String>,
    #[serde(default)]
    force: bool,
}

/// `POST /tasks/fetch-news`: body `{ "query"?, "force"? }` is optional.
pub(super) async fn fetch_news(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: FetchBody = optional_body(&body)?;
    let query = body
        .query
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty());
    let mut v = Violations::new();
    if let Some(q) = &query {
        v.check(q.chars().count() <= MAX_QUERY_CHARS, "query", "must be at most 200 characters");
    }
    v.into_result()?;

    tracing::info!(user_id = auth.user.id, force = body.force, "Manual fetch requested");
    submit(
        &state,
        TaskPayload::FetchNews {
            query,
            force: body.force,
        },
    )
    .await
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct TrendingBody {
    window_hours: Option<i64>,
}

pub(super) async fn compute_trending(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: TrendingBody = optional_body(&body)?;
    let mut v = Violations::new();
    if let Some(hours) = body.window_hours {
        v.check(
            (1..=MAX_WINDOW_HOURS).contains(&hours),
            "window_hours",
            "must be between 1 and 720",
        );
    }
    v.into_result()?;
    submit(
        &state,
        TaskPayload::ComputeTrending {
            window_hours: body.window_hours,
        },
    )
    .await
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct BatchBody {
    limit: Option<i64>,
}

pub(super) async fn batch_analyze(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let body: BatchBody = optional_body(&body)?;
    let limit = body.limit.unwrap_or(state.config.worker.batch_size);
    let mut v = Violations::new();
    v.check(
        (1..=MAX_BATCH_LIMIT).contains(&limit),
        "limit",
        "must be between 1 and 500",
    );
    v.into_result()?;
    submit(&state, TaskPayload::BatchAnalyze { limit }).await
}

pub(super) async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<TaskRecord>, ApiError> {
    let task = state
        .db
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Task"))?;
    Ok(Json(task))
}
