use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::auth::{
    hash_password_blocking, new_salt, new_session_token, hash_token, verify_password_blocking,
    AuthUser,
};
use super::error::{ApiError, Violations};
use super::extract::{ApiJson, ApiQuery, Listing, Pairs};
use super::validate::{
    check_password, is_valid_email, is_valid_username, MAX_NOTE_CHARS, MAX_PREFERENCE_ITEMS,
};
use super::AppState;
use crate::search::filter::{FilterValue, Op};
use crate::storage::{ArticleQuery, Bookmark, NewUser, User, UserPreferences};

/// Public view of an account; never includes credentials.
#[derive(Debug, Serialize)]
pub(super) struct UserView {
    id: i64,
    email: String,
    username: String,
    created_at: i64,
    last_login_at: Option<i64>,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RegisterRequest {
    email: String,
    username: String,
    password: String,
}

/// `POST /users/register`: 201 with the new account.
pub(super) async fn register(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = body.email.trim().to_lowercase();
    let username = body.username.trim().to_string();

    let mut v = Violations::new();
    v.check(is_valid_email(&email), "email", "must be a valid email address");
    v.check(
        is_valid_username(&username),
        "username",
        "must be 3-32 letters, digits or underscores",
    );
    check_password(&mut v, &body.password);
    v.into_result()?;

    let salt = new_salt();
    let password_hash = hash_password_blocking(body.password, salt.clone()).await?;
    let user = state
        .db
        .create_user(&NewUser {
            email: &email,
            username: &username,
            password_hash: &password_hash,
            password_salt: &salt,
        })
        .await?;

    tracing::info!(user_id = user.id, "User registered");
    Ok((StatusCode::CREATED, Json(UserView::from(user))))
}

#[derive(Debug, Deserialize)]
pub(super) struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
pub(super) struct LoginResponse {
    token: String,
    token_type: &'static str,
    expires_at: i64,
    user: UserView,
}

/// `POST /users/login`: issue a bearer token.
pub(super) async fn login(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let invalid = || ApiError::Unauthorized("Invalid email or password".to_string());

    let user = state
        .db
        .get_user_by_email(&body.email.trim().to_lowercase())
        .await?
        .ok_or_else(invalid)?;
    let matches = verify_password_blocking(
        body.password,
        user.password_salt.clone(),
        user.password_hash.clone(),
    )
    .await?;
    if !matches || !user.is_active {
        tracing::debug!(user_id = user.id, "Login rejected");
        return Err(invalid());
    }

    let token = new_session_token();
    let ttl_secs = state.config.server.session_ttl_hours.saturating_mul(3_600);
    let expires_at = state
        .db
        .create_session(&hash_token(&token), user.id, ttl_secs)
        .await?;
    state.db.touch_login(user.id).await?;
    let user = state.db.get_user(user.id).await?.unwrap_or(user);

    tracing::info!(user_id = user.id, "User logged in");
    Ok(Json(LoginResponse {
        token,
        token_type: "Bearer",
        expires_at,
        user: user.into(),
    }))
}

/// `POST /users/logout`: revoke the presented token.
pub(super) async fn logout(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<StatusCode, ApiError> {
    state.db.delete_session(&auth.token_hash).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(super) async fn me(auth: AuthUser) -> Json<UserView> {
    Json(auth.user.into())
}

// ============================================================================
// Preferences
// ============================================================================

pub(super) async fn get_preferences(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<UserPreferences>, ApiError> {
    Ok(Json(state.db.get_preferences(auth.user.id).await?))
}

/// Partial update; absent fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct PreferencesUpdate {
    preferred_categories: Option<Vec<String>>,
    preferred_sources: Option<Vec<i64>>,
    excluded_topics: Option<Vec<String>>,
    language: Option<String>,
    articles_per_page: Option<i64>,
    email_digest: Option<bool>,
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if !tag.is_empty() && !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}

impl PreferencesUpdate {
    fn apply(self, prefs: &mut UserPreferences) -> Result<(), ApiError> {
        let mut v = Violations::new();
        let too_many = format!("must have at most {MAX_PREFERENCE_ITEMS} entries");

        if let Some(categories) = self.preferred_categories {
            v.check(categories.len() <= MAX_PREFERENCE_ITEMS, "preferred_categories", &too_many);
            prefs.preferred_categories = normalize_tags(categories);
        }
        if let Some(mut sources) = self.preferred_sources {
            v.check(sources.len() <= MAX_PREFERENCE_ITEMS, "preferred_sources", &too_many);
            v.check(sources.iter().all(|&id| id > 0), "preferred_sources", "must be source ids");
            sources.sort_unstable();
            sources.dedup();
            prefs.preferred_sources = sources;
        }
        if let Some(topics) = self.excluded_topics {
            v.check(topics.len() <= MAX_PREFERENCE_ITEMS, "excluded_topics", &too_many);
            prefs.excluded_topics = normalize_tags(topics);
        }
        if let Some(language) = self.language {
            let language = language.trim().to_lowercase();
            v.check(
                (2..=8).contains(&language.len())
                    && language.chars().all(|c| c.is_ascii_alphabetic() || c == '-'),
                "language",
                "must be a language code such as 'en' or 'pt-br'",
            );
            prefs.language = language;
        }
        if let Some(per_page) = self.articles_per_page {
            v.check((1..=100).contains(&per_page), "articles_per_page", "must be between 1 and 100");
            prefs.articles_per_page = per_page;
        }
        if let Some(digest) = self.email_digest {
            prefs.email_digest = digest;
        }
        v.into_result()
    }
}

pub(super) async fn update_preferences(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    ApiJson(body): ApiJson<PreferencesUpdate>,
) -> Result<Json<UserPreferences>, ApiError> {
    let mut prefs = state.db.get_preferences(auth.user.id).await?;
    body.apply(&mut prefs)?;
    state.db.set_preferences(auth.user.id, &prefs).await?;
    Ok(Json(prefs))
}

// ============================================================================
// Bookmarks
// ============================================================================

#[derive(Debug, Serialize)]
pub(super) struct BookmarkList {
    count: usize,
    bookmarks: Vec<Bookmark>,
}

pub(super) async fn list_bookmarks(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BookmarkList>, ApiError> {
    let bookmarks = state.db.list_bookmarks(auth.user.id).await?;
    Ok(Json(BookmarkList {
        count: bookmarks.len(),
        bookmarks,
    }))
}

#[derive(Debug, Deserialize)]
pub(super) struct NewBookmark {
    article_id: i64,
    #[serde(default)]
    note: Option<String>,
}

/// `POST /users/me/bookmarks`: 201, 404 for unknown articles, 409 for duplicates.
pub(super) async fn add_bookmark(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    ApiJson(body): ApiJson<NewBookmark>,
) -> Result<impl IntoResponse, ApiError> {
    let note = body
        .note
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let mut v = Violations::new();
    if let Some(note) = note {
        v.check(
            note.chars().count() <= MAX_NOTE_CHARS,
            "note",
            "must be at most 1000 characters",
        );
    }
    v.into_result()?;

    if state.db.get_article(body.article_id).await?.is_none() {
        return Err(ApiError::not_found("Article"));
    }
    let bookmark = state
        .db
        .add_bookmark(auth.user.id, body.article_id, note)
        .await?;
    Ok((StatusCode::CREATED, Json(bookmark)))
}

pub(super) async fn remove_bookmark(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(article_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    if !state.db.remove_bookmark(auth.user.id, article_id).await? {
        return Err(ApiError::not_found("Bookmark"));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Personalised Feed
// ============================================================================

/// Narrow a listing by the user's saved preferences.
fn apply_preferences(listing: &mut Listing, prefs: &UserPreferences) -> Result<(), ApiError> {
    if !prefs.preferred_categories.is_empty() {
        let values = prefs
            .preferred_categories
            .iter()
            .cloned()
            .map(FilterValue::Text)
            .collect();
        listing.filters.push("category", Op::In, FilterValue::List(values))?;
    }
    if !prefs.preferred_sources.is_empty() {
        let values = prefs
            .preferred_sources
            .iter()
            .copied()
            .map(FilterValue::Int)
            .collect();
        listing.filters.push("source_id", Op::In, FilterValue::List(values))?;
    }
    for topic in &prefs.excluded_topics {
        listing
            .filters
            .push("topic", Op::Ne, FilterValue::Text(topic.clone()))?;
    }
    Ok(())
}

/// `GET /users/me/feed`: articles matching the user's preferences.
pub(super) async fn feed(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    ApiQuery(pairs): ApiQuery<Pairs>,
) -> Result<impl IntoResponse, ApiError> {
    let prefs = state.db.get_preferences(auth.user.id).await?;
    let mut listing = Listing::parse(&pairs)?;
    apply_preferences(&mut listing, &prefs)?;

    let query = ArticleQuery {
        limit: listing.limit_or(prefs.articles_per_page),
        filters: listing.filters,
        sort: listing.sort,
        cursor: listing.cursor,
    };
    Ok(Json(state.db.query_articles(&query).await?))
}
