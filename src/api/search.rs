use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::articles::{parse_method, parse_threshold, SimilarResponse};
use super::error::ApiError;
use super::extract::{int_param, str_param, ApiQuery, Pairs};
use super::AppState;
use crate::search::{refresh_trending, FilterSet, TokenBag, TrendingParams};
use crate::storage::{
    validate_fts_query, Article, TrendingTopic, MAX_SEARCH_RESULTS, MAX_SIMILARITY_CANDIDATES,
};

const DEFAULT_SEARCH_RESULTS: i64 = 20;
const DEFAULT_SUGGESTIONS: i64 = 10;
/// Longest trending window accepted from clients (30 days)
const MAX_TRENDING_HOURS: i64 = 24 * 30;

fn required_query(pairs: &Pairs) -> Result<&str, ApiError> {
    str_param(pairs, "q").ok_or_else(|| ApiError::BadRequest("'q' is required".to_string()))
}

#[derive(Debug, Serialize)]
pub(super) struct SearchResponse {
    query: String,
    count: usize,
    results: Vec<Article>,
}

/// `GET /search?q=`: full-text search narrowed by the filter DSL.
pub(super) async fn search(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = required_query(&pairs)?;
    validate_fts_query(query).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let now = chrono::Utc::now().timestamp();
    let filters = FilterSet::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())), now)?;
    let limit = int_param(&pairs, "limit")?
        .unwrap_or(DEFAULT_SEARCH_RESULTS)
        .clamp(1, MAX_SEARCH_RESULTS);

    let results = state.db.search_articles(query, &filters, limit).await?;
    Ok(Json(SearchResponse {
        query: query.to_string(),
        count: results.len(),
        results,
    }))
}

/// `GET /search/semantic?q=&method=&threshold=&limit=`: token-overlap ranking
/// of recent articles against free text.
pub(super) async fn semantic_search(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<SimilarResponse>, ApiError> {
    let query = required_query(&pairs)?;
    let method = parse_method(&pairs)?;
    let threshold = parse_threshold(&pairs)?;
    let limit = int_param(&pairs, "limit")?
        .unwrap_or(DEFAULT_SEARCH_RESULTS)
        .clamp(1, MAX_SEARCH_RESULTS);

    let bag = TokenBag::from_text(query);
    let candidates = state
        .db
        .recent_articles_for_similarity(MAX_SIMILARITY_CANDIDATES, None)
        .await?;
    let results = state
        .similarity
        .rank(&bag, candidates, method, threshold, limit as usize);
    Ok(Json(SimilarResponse {
        method,
        threshold,
        count: results.len(),
        results,
    }))
}

#[derive(Debug, Serialize)]
pub(super) struct TrendingResponse {
    window_hours: i64,
    topics: Vec<TrendingTopic>,
}

/// `GET /search/trending?hours=&limit=`
///
/// Serves the stored ranking for the window, computing it on demand when
/// none has been stored yet.
pub(super) async fn trending(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<TrendingResponse>, ApiError> {
    let defaults = &state.config.trending;
    let hours = int_param(&pairs, "hours")?.unwrap_or(defaults.window_hours);
    if !(1..=MAX_TRENDING_HOURS).contains(&hours) {
        return Err(ApiError::BadRequest(format!(
            "'hours' must be between 1 and {MAX_TRENDING_HOURS}"
        )));
    }
    let limit = int_param(&pairs, "limit")?
        .unwrap_or(defaults.top_n as i64)
        .clamp(1, 100);

    let mut topics = state.db.get_trending_topics(hours, limit).await?;
    if topics.is_empty() {
        let params = TrendingParams {
            window_hours: hours,
            min_articles: defaults.min_articles,
            top_n: defaults.top_n.max(limit as usize),
        };
        topics = refresh_trending(&state.db, &params, chrono::Utc::now().timestamp()).await?;
        topics.truncate(limit as usize);
    }
    Ok(Json(TrendingResponse {
        window_hours: hours,
        topics,
    }))
}

#[derive(Debug, Serialize)]
pub(super) struct Suggestions {
    prefix: String,
    suggestions: Vec<String>,
}

/// `GET /search/suggestions?prefix=`: title completions.
pub(super) async fn suggestions(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<Suggestions>, ApiError> {
    let prefix = str_param(&pairs, "prefix").unwrap_or_default();
    let limit = int_param(&pairs, "limit")?.unwrap_or(DEFAULT_SUGGESTIONS);
    let suggestions = state.db.suggest_titles(prefix, limit).await?;
    Ok(Json(Suggestions {
        prefix: prefix.to_string(),
        suggestions,
    }))
}
