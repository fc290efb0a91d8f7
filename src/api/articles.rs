use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::auth::{AuthUser, MaybeUser};
use super::error::{ApiError, Violations};
use super::extract::{float_param, int_param, str_param, ApiJson, ApiQuery, Listing, Pairs};
use super::validate::{check_title, check_url};
use super::AppState;
use crate::search::cursor::DEFAULT_PAGE_SIZE;
use crate::search::similarity::ScoredArticle;
use crate::search::Method;
use crate::storage::{
    Article, ArticleAnalysis, ArticleQuery, IncomingArticle, ProcessingStatus, SourceRef,
    MAX_SIMILARITY_CANDIDATES,
};
use crate::tasks::TaskPayload;
use crate::util::{clean_text, strip_html_tags};

const DEFAULT_SIMILAR: i64 = 10;
const MAX_SIMILAR: i64 = 50;
pub(crate) const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.1;

/// `GET /articles`: filter DSL, sort, cursor and `limit`.
pub(super) async fn list_articles(
    State(state): State<Arc<AppState>>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<impl IntoResponse, ApiError> {
    let listing = Listing::parse(&pairs)?;
    let query = ArticleQuery {
        limit: listing.limit_or(DEFAULT_PAGE_SIZE),
        filters: listing.filters,
        sort: listing.sort,
        cursor: listing.cursor,
    };
    let page = state.db.query_articles(&query).await?;
    Ok(Json(page))
}

/// `GET /articles/{id}`; counts a view.
pub(super) async fn get_article(
    State(state): State<Arc<AppState>>,
    MaybeUser(user): MaybeUser,
    Path(id): Path<i64>,
) -> Result<Json<Article>, ApiError> {
    if !state.db.record_view(id, user.map(|u| u.id)).await? {
        return Err(ApiError::not_found("Article"));
    }
    let article = state
        .db
        .get_article(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Article"))?;
    Ok(Json(article))
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateArticle {
    title: String,
    url: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    category: Option<String>,
    /// Unix seconds
    #[serde(default)]
    published_at: Option<i64>,
}

fn manual_source() -> SourceRef {
    SourceRef {
        key: "manual".to_string(),
        name: "Manual".to_string(),
        provider: "manual".to_string(),
        url: None,
    }
}

/// `POST /articles`: manual creation, 201 with the stored article.
pub(super) async fn create_article(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    ApiJson(body): ApiJson<CreateArticle>,
) -> Result<impl IntoResponse, ApiError> {
    let mut v = Violations::new();
    check_title(&mut v, &body.title);
    check_url(&mut v, &body.url);
    if let Some(ts) = body.published_at {
        v.check(ts >= 0, "published_at", "must be a non-negative Unix timestamp");
    }
    v.into_result()?;

    let html_text = |s: &Option<String>| {
        s.as_deref()
            .and_then(|s| clean_text(Some(strip_html_tags(s).as_ref())))
    };
    let incoming = IncomingArticle {
        title: body.title.trim().to_string(),
        description: html_text(&body.description),
        content: html_text(&body.content),
        url: body.url.trim().to_string(),
        author: clean_text(body.author.as_deref()),
        category: clean_text(body.category.as_deref()).map(|c| c.to_lowercase()),
        published_at: body.published_at,
    };

    let source_id = state.db.upsert_source(&manual_source()).await?;
    let id = state.db.insert_article(source_id, &incoming).await?;
    tracing::info!(article_id = id, user_id = auth.user.id, "Article created");

    if state.config.worker.auto_analyze {
        state
            .queue
            .submit(&TaskPayload::AnalyzeArticle { article_id: id })
            .await?;
    }

    let article = state
        .db
        .get_article(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Article"))?;
    Ok((StatusCode::CREATED, Json(article)))
}

/// `DELETE /articles/{id}`
pub(super) async fn delete_article(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db.delete_article(id).await? {
        return Err(ApiError::not_found("Article"));
    }
    tracing::info!(article_id = id, user_id = auth.user.id, "Article deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /articles/{id}/analyze`: queue analysis, 202 with the task.
pub(super) async fn analyze_article(
    State(state): State<Arc<AppState>>,
    _auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    if state.db.get_article(id).await?.is_none() {
        return Err(ApiError::not_found("Article"));
    }
    let task = state
        .queue
        .submit(&TaskPayload::AnalyzeArticle { article_id: id })
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task.id, "status": task.status })),
    ))
}

#[derive(Debug, Serialize)]
pub(super) struct ArticleAnalysisView {
    article_id: i64,
    processing_status: ProcessingStatus,
    sentiment_score: Option<f64>,
    sentiment_label: Option<String>,
    bias_score: Option<f64>,
    relevance_score: Option<f64>,
    topics: Vec<String>,
    category: Option<String>,
    summary: Option<String>,
    analyses: Vec<ArticleAnalysis>,
}

/// `GET /articles/{id}/analysis`: enrichment fields plus every call made.
pub(super) async fn get_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<ArticleAnalysisView>, ApiError> {
    let article = state
        .db
        .get_article(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Article"))?;
    let analyses = state.db.get_analyses_for_article(id).await?;
    Ok(Json(ArticleAnalysisView {
        article_id: article.id,
        processing_status: article.processing_status,
        sentiment_score: article.sentiment_score,
        sentiment_label: article.sentiment_label,
        bias_score: article.bias_score,
        relevance_score: article.relevance_score,
        topics: article.topics,
        category: article.category,
        summary: article.summary,
        analyses,
    }))
}

pub(crate) fn parse_method(pairs: &Pairs) -> Result<Method, ApiError> {
    match str_param(pairs, "method") {
        None => Ok(Method::default()),
        Some(raw) => Method::parse(raw).ok_or_else(|| {
            ApiError::BadRequest(format!("Unknown similarity method '{raw}' (cosine or jaccard)"))
        }),
    }
}

pub(crate) fn parse_threshold(pairs: &Pairs) -> Result<f64, ApiError> {
    let threshold = float_param(pairs, "threshold")?.unwrap_or(DEFAULT_SIMILARITY_THRESHOLD);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ApiError::BadRequest("'threshold' must be between 0 and 1".to_string()));
    }
    Ok(threshold)
}

#[derive(Debug, Serialize)]
pub(crate) struct SimilarResponse {
    pub method: Method,
    pub threshold: f64,
    pub count: usize,
    pub results: Vec<ScoredArticle>,
}

/// `GET /articles/{id}/similar?method=&threshold=&limit=`
pub(super) async fn similar_articles(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<Json<SimilarResponse>, ApiError> {
    let method = parse_method(&pairs)?;
    let threshold = parse_threshold(&pairs)?;
    let limit = int_param(&pairs, "limit")?
        .unwrap_or(DEFAULT_SIMILAR)
        .clamp(1, MAX_SIMILAR);

    let article = state
        .db
        .get_article(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Article"))?;
    let candidates = state
        .db
        .recent_articles_for_similarity(MAX_SIMILARITY_CANDIDATES, Some(id))
        .await?;

    let query = state.similarity.bag_for(&article);
    let results = state
        .similarity
        .rank(&query, candidates, method, threshold, limit as usize);
    Ok(Json(SimilarResponse {
        method,
        threshold,
        count: results.len(),
        results,
    }))
}
