//! Password hashing, bearer sessions and per-client rate limiting.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use lru::LruCache;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::ApiError;
use super::AppState;
use crate::storage::User;

const PASSWORD_ROUNDS: usize = 10_000;
const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Distinct clients tracked by the limiter; least recently seen are evicted
const MAX_TRACKED_CLIENTS: usize = 10_000;

// ============================================================================
// Passwords & Tokens
// ============================================================================

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn new_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Iterated, salted SHA-256, hex encoded.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..PASSWORD_ROUNDS {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(salt.as_bytes())
            .finalize();
    }
    to_hex(&digest)
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    constant_time_eq(hash_password(password, salt).as_bytes(), expected_hash.as_bytes())
}

/// Hash a password on the blocking pool.
pub(crate) async fn hash_password_blocking(password: String, salt: String) -> Result<String, ApiError> {
    tokio::task::spawn_blocking(move || hash_password(&password, &salt))
        .await
        .map_err(|e| ApiError::Internal(e.into()))
}

pub(crate) async fn verify_password_blocking(
    password: String,
    salt: String,
    expected_hash: String,
) -> Result<bool, ApiError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &salt, &expected_hash))
        .await
        .map_err(|e| ApiError::Internal(e.into()))
}

/// 256 bits of randomness from two v4 UUIDs.
pub fn new_session_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Sessions are stored by token hash so a leaked table grants nothing.
pub fn hash_token(token: &str) -> String {
    to_hex(&Sha256::digest(token.as_bytes()))
}

pub(crate) fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

// ============================================================================
// Extractors
// ============================================================================

/// The signed-in user; rejects with 401 when the token is missing,
/// unknown or expired.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub token_hash: String,
}

impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("Missing bearer token".to_string()))?;
        let token_hash = hash_token(token);
        let user = state
            .db
            .get_session_user(&token_hash)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("Invalid or expired token".to_string()))?;
        Ok(Self { user, token_hash })
    }
}

/// Like [`AuthUser`] but anonymous requests pass through as `None`.
/// A token that is present but invalid is still rejected.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<User>);

impl FromRequestParts<Arc<AppState>> for MaybeUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if bearer_token(parts).is_none() {
            return Ok(MaybeUser(None));
        }
        AuthUser::from_request_parts(parts, state)
            .await
            .map(|auth| MaybeUser(Some(auth.user)))
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed one-minute window per client key.
pub struct RateLimiter {
    per_minute: u32,
    windows: Mutex<LruCache<String, Window>>,
}

impl RateLimiter {
    /// `per_minute = 0` disables limiting.
    pub fn new(per_minute: u32) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_CLIENTS).unwrap_or(NonZeroUsize::MIN);
        Self {
            per_minute,
            windows: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Count one request; `Err` carries the seconds until the window resets.
    pub fn check(&self, key: &str, now: Instant) -> Result<(), u64> {
        if self.per_minute == 0 {
            return Ok(());
        }
        let mut windows = self
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if windows.get_mut(key).is_none() {
            windows.put(
                key.to_string(),
                Window {
                    started: now,
                    count: 0,
                },
            );
        }
        let Some(window) = windows.get_mut(key) else {
            return Ok(());
        };
        if now.duration_since(window.started) >= RATE_WINDOW {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= self.per_minute {
            let elapsed = now.duration_since(window.started);
            let remaining = RATE_WINDOW.saturating_sub(elapsed).as_secs().max(1);
            return Err(remaining);
        }
        window.count += 1;
        Ok(())
    }
}

const ANONYMOUS_KEY: &str = "anonymous";

/// Client key: the token hash of a live session, otherwise `anonymous`.
///
/// Unverified tokens share the anonymous window, so minting random bearer
/// strings buys no extra requests and cannot flood the limiter's LRU.
async fn client_key(state: &AppState, parts: &Parts) -> String {
    let Some(token) = bearer_token(parts) else {
        return ANONYMOUS_KEY.to_string();
    };
    let token_hash = hash_token(token);
    match state.db.get_session_user(&token_hash).await {
        Ok(Some(_)) => token_hash,
        Ok(None) => ANONYMOUS_KEY.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Session lookup failed, rate limiting as anonymous");
            ANONYMOUS_KEY.to_string()
        }
    }
}

pub(crate) async fn rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let key = client_key(&state, &parts).await;
    if let Err(retry_after_secs) = state.limiter.check(&key, Instant::now()) {
        tracing::debug!(path = %parts.uri.path(), "Rate limit exceeded");
        return ApiError::RateLimited { retry_after_secs }.into_response();
    }
    next.run(Request::from_parts(parts, body)).await
}
