use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::error::ApiError;
use super::extract::{int_param, ApiQuery, Pairs};
use super::AppState;
use crate::ai::{Alert, MonitorSnapshot};
use crate::storage::{
    CategoryStat, OverviewStats, SentimentPoint, SourceStat, TaskStats, ViewedArticle,
    MAX_ANALYTICS_DAYS,
};

const DEFAULT_DAYS: i64 = 30;
const DEFAULT_MOST_VIEWED_DAYS: i64 = 7;
const DEFAULT_MOST_VIEWED: i64 = 10;

fn days_param(pairs: &Pairs, default: i64) -> Result<i64, ApiError> {
    let days = int_param(pairs, "days")?.unwrap_or(default);
    if !(1..=MAX_ANALYTICS_DAYS).contains(&days) {
        return Err(ApiError::BadRequest(format!(
            "'days' must be between 1 and {MAX_ANALYTICS_DAYS}"
        )));
    }
    Ok(days)
}

pub(super) async fn overview(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OverviewStats>, ApiError> {
    let now = chrono::Utc::now().timestamp();
    Ok(Json(state.db.overview_stats(now).await?))
}

#[derive(Debug, Serialize)]
pub(super) struct SentimentTimeline {
    days: i64,
    points: Vec<SentimentPoint>,
}

/// `GET /analytics/sentiment?days=`: daily article count and mean sentiment.
pub(super) async fn sentiment(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<SentimentTimeline>, ApiError> {
    let days = days_param(&pairs, DEFAULT_DAYS)?;
    let now = chrono::Utc::now().timestamp();
    let points = state.db.sentiment_timeline(days, now).await?;
    Ok(Json(SentimentTimeline { days, points }))
}

#[derive(Debug, Serialize)]
pub(super) struct SourceBreakdown {
    sources: Vec<SourceStat>,
    categories: Vec<CategoryStat>,
}

pub(super) async fn sources(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SourceBreakdown>, ApiError> {
    Ok(Json(SourceBreakdown {
        sources: state.db.source_breakdown().await?,
        categories: state.db.category_breakdown().await?,
    }))
}

#[derive(Debug, Serialize)]
pub(super) struct MostViewed {
    days: i64,
    articles: Vec<ViewedArticle>,
}

pub(super) async fn most_viewed(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<MostViewed>, ApiError> {
    let days = days_param(&pairs, DEFAULT_MOST_VIEWED_DAYS)?;
    let limit = int_param(&pairs, "limit")?
        .unwrap_or(DEFAULT_MOST_VIEWED)
        .clamp(1, 100);
    let now = chrono::Utc::now().timestamp();
    let articles = state.db.most_viewed(days, limit, now).await?;
    Ok(Json(MostViewed { days, articles }))
}

pub(super) async fn ai_monitor(State(state): State<Arc<AppState>>) -> Json<MonitorSnapshot> {
    Json(state.monitor.snapshot(chrono::Utc::now().timestamp()))
}

#[derive(Debug, Serialize)]
pub(super) struct AlertList {
    count: usize,
    alerts: Vec<Alert>,
}

pub(super) async fn ai_alerts(State(state): State<Arc<AppState>>) -> Json<AlertList> {
    let alerts = state.monitor.check_alerts(chrono::Utc::now().timestamp());
    Json(AlertList {
        count: alerts.len(),
        alerts,
    })
}

pub(super) async fn task_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TaskStats>, ApiError> {
    Ok(Json(state.db.task_stats().await?))
}
