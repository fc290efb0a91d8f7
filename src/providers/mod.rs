//! News provider clients and the ingest pipeline that stores their output.

mod guardian;
mod http;
pub mod ingest;
mod newsapi;
mod nytimes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;

use crate::config::ProvidersConfig;
use crate::storage::{IncomingArticle, SourceRef};
use crate::util::{clean_text, strip_html_tags, truncate_chars, validate_base_url, validate_url};

pub use guardian::GuardianClient;
pub use ingest::{run_fetch, FetchOptions, FetchOutcome, FetchReport, IngestStats, ProviderFetchResult};
pub use newsapi::NewsApiClient;
pub use nytimes::NyTimesClient;

/// Longest stored title, in characters
const MAX_TITLE_CHARS: usize = 500;

/// Errors that can occur while fetching from a provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the 30-second timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    #[error("Parse error: {0}")]
    Parse(String),
    /// The provider answered 200 with an error envelope
    #[error("Provider error: {0}")]
    Api(String),
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
}

impl ProviderError {
    /// Returns true if a later attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_)
            | ProviderError::Timeout
            | ProviderError::RateLimited(_)
            | ProviderError::IncompleteResponse { .. } => true,
            ProviderError::HttpStatus(status) => *status >= 500,
            ProviderError::ResponseTooLarge
            | ProviderError::Parse(_)
            | ProviderError::Api(_)
            | ProviderError::InsecureBaseUrl => false,
        }
    }
}

/// Retry schedule for 429 and 5xx responses: `base * 2^n`, up to `max_retries`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn delay(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Parameters for one fetch round.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Free-text query; `None` asks for top stories
    pub query: Option<String>,
    pub page_size: u32,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            query: None,
            page_size: 50,
        }
    }
}

/// An article together with the outlet that published it.
#[derive(Debug, Clone)]
pub struct ProviderArticle {
    pub source: SourceRef,
    pub article: IncomingArticle,
}

#[async_trait]
pub trait NewsProvider: Send + Sync {
    /// Stable identifier, also the key of the provider's source row
    fn name(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<ProviderArticle>, ProviderError>;
}

/// Source row that tracks a provider's fetch state and circuit breaker.
pub(crate) fn provider_source(provider: &dyn NewsProvider) -> SourceRef {
    SourceRef {
        key: provider.name().to_string(),
        name: provider.display_name().to_string(),
        provider: provider.name().to_string(),
        url: None,
    }
}

pub(crate) fn check_base_url(base_url: &str) -> Result<String, ProviderError> {
    validate_base_url(base_url).map_err(|_| {
        tracing::error!(base_url = %base_url, "Rejecting non-HTTPS provider base URL");
        ProviderError::InsecureBaseUrl
    })?;
    Ok(base_url.trim_end_matches('/').to_string())
}

/// Raw fields shared by every provider's item format.
#[derive(Default)]
pub(crate) struct RawItem<'a> {
    pub title: Option<&'a str>,
    pub url: Option<&'a str>,
    pub description: Option<&'a str>,
    pub content: Option<&'a str>,
    pub author: Option<&'a str>,
    pub category: Option<&'a str>,
    pub published: Option<&'a str>,
}

/// Normalise a provider item, or `None` when it has no usable title or URL.
pub(crate) fn build_incoming(raw: RawItem<'_>) -> Option<IncomingArticle> {
    let title = clean_text(raw.title)?;
    // NewsAPI tombstones deleted stories instead of dropping them
    if title == "[Removed]" {
        return None;
    }
    let url = validate_url(raw.url?.trim()).ok()?;

    let html_text = |s: Option<&str>| s.and_then(|s| clean_text(Some(strip_html_tags(s).as_ref())));
    let author = clean_text(raw.author).map(|a| match a.strip_prefix("By ") {
        Some(rest) => rest.to_string(),
        None => a,
    });

    Some(IncomingArticle {
        title: truncate_chars(&title, MAX_TITLE_CHARS).to_string(),
        description: html_text(raw.description),
        content: html_text(raw.content),
        url: url.to_string(),
        author,
        category: clean_text(raw.category).map(|c| c.to_lowercase()),
        published_at: raw.published.and_then(parse_published),
    })
}

fn parse_published(value: &str) -> Option<i64> {
    let value = value.trim();
    chrono::DateTime::parse_from_rfc3339(value)
        .or_else(|_| chrono::DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.timestamp())
        .ok()
}

/// Build every provider that has an API key configured.
pub fn from_config(
    config: &ProvidersConfig,
    client: reqwest::Client,
) -> Result<Vec<Arc<dyn NewsProvider>>, ProviderError> {
    let mut providers: Vec<Arc<dyn NewsProvider>> = Vec::new();

    match &config.newsapi_key {
        Some(key) => providers.push(Arc::new(NewsApiClient::new(
            client.clone(),
            SecretString::from(key.clone()),
            &config.newsapi_base_url,
            &config.country,
        )?)),
        None => tracing::info!(provider = "newsapi", "No API key configured, provider disabled"),
    }
    match &config.guardian_api_key {
        Some(key) => providers.push(Arc::new(GuardianClient::new(
            client.clone(),
            SecretString::from(key.clone()),
            &config.guardian_base_url,
        )?)),
        None => tracing::info!(provider = "guardian", "No API key configured, provider disabled"),
    }
    match &config.nytimes_api_key {
        Some(key) => providers.push(Arc::new(NyTimesClient::new(
            client,
            SecretString::from(key.clone()),
            &config.nytimes_base_url,
            &config.nytimes_section,
        )?)),
        None => tracing::info!(provider = "nytimes", "No API key configured, provider disabled"),
    }

    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_incoming_requires_title_and_url() {
        assert!(build_incoming(RawItem {
            title: Some("  "),
            url: Some("https://example.com/a"),
            ..Default::default()
        })
        .is_none());
        assert!(build_incoming(RawItem {
            title: Some("Title"),
            url: None,
            ..Default::default()
        })
        .is_none());
        assert!(build_incoming(RawItem {
            title: Some("[Removed]"),
            url: Some("https://example.com/a"),
            ..Default::default()
        })
        .is_none());
    }

    #[test]
    fn test_build_incoming_rejects_private_urls() {
        assert!(build_incoming(RawItem {
            title: Some("Title"),
            url: Some("http://192.168.1.1/story"),
            ..Default::default()
        })
        .is_none());
    }

    #[test]
    fn test_build_incoming_normalises_fields() {
        let article = build_incoming(RawItem {
            title: Some("  Big   news\n today "),
            url: Some(" https://example.com/story "),
            description: Some("<p>Some &amp; more</p>"),
            content: None,
            author: Some("By Jane Doe"),
            category: Some("World"),
            published: Some("2024-03-01T12:00:00Z"),
        })
        .unwrap();

        assert_eq!(article.title, "Big news today");
        assert_eq!(article.url, "https://example.com/story");
        assert_eq!(article.description.as_deref(), Some("Some & more"));
        assert_eq!(article.author.as_deref(), Some("Jane Doe"));
        assert_eq!(article.category.as_deref(), Some("world"));
        assert_eq!(article.published_at, Some(1_709_294_400));
    }

    #[test]
    fn test_parse_published_formats() {
        assert_eq!(parse_published("2024-03-01T12:00:00Z"), Some(1_709_294_400));
        assert_eq!(parse_published("2024-03-01T07:00:00-05:00"), Some(1_709_294_400));
        // NYTimes article search omits the colon in the offset
        assert_eq!(parse_published("2024-03-01T12:00:00+0000"), Some(1_709_294_400));
        assert_eq!(parse_published("yesterday"), None);
    }

    #[test]
    fn test_retry_policy_delay_doubles() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            ..Default::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(40));
    }

    #[test]
    fn test_error_retryability() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::HttpStatus(503).is_retryable());
        assert!(!ProviderError::HttpStatus(401).is_retryable());
        assert!(!ProviderError::Api("apiKeyInvalid".into()).is_retryable());
    }

    #[test]
    fn test_from_config_skips_providers_without_keys() {
        let mut config = ProvidersConfig::default();
        assert!(from_config(&config, reqwest::Client::new()).unwrap().is_empty());

        config.guardian_api_key = Some("key".into());
        let providers = from_config(&config, reqwest::Client::new()).unwrap();
        let names: Vec<_> = providers.iter().map(|p| p.name()).collect();
        assert_eq!(names, ["guardian"]);
    }
}
