//! Configuration file parser for `newsdesk.toml`.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning for each one
//! since they are usually typos. Secrets and the bind address can also come
//! from the environment, which wins over the file.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::util::validate_base_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub llm: LlmConfig,
    pub worker: WorkerConfig,
    pub trending: TrendingConfig,
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "newsdesk.db".to_string(),
            server: ServerConfig::default(),
            providers: ProvidersConfig::default(),
            llm: LlmConfig::default(),
            worker: WorkerConfig::default(),
            trending: TrendingConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Requests per client per minute. 0 disables rate limiting.
    pub rate_limit_per_minute: u32,
    pub session_ttl_hours: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            rate_limit_per_minute: 120,
            session_ttl_hours: 24 * 7,
        }
    }
}

/// News provider credentials and request shaping. A provider without a key
/// is disabled.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub newsapi_key: Option<String>,
    pub guardian_api_key: Option<String>,
    pub nytimes_api_key: Option<String>,
    pub newsapi_base_url: String,
    pub guardian_base_url: String,
    pub nytimes_base_url: String,
    pub page_size: u32,
    /// Search query for scheduled fetches; `None` fetches top headlines.
    pub default_query: Option<String>,
    pub country: String,
    pub nytimes_section: String,
    /// Providers fetched in parallel
    pub max_concurrent: usize,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            newsapi_key: None,
            guardian_api_key: None,
            nytimes_api_key: None,
            newsapi_base_url: "https://newsapi.org".to_string(),
            guardian_base_url: "https://content.guardianapis.com".to_string(),
            nytimes_base_url: "https://api.nytimes.com".to_string(),
            page_size: 50,
            default_query: None,
            country: "us".to_string(),
            nytimes_section: "home".to_string(),
            max_concurrent: 3,
        }
    }
}

/// Mask every key in Debug output to prevent secret leakage.
impl std::fmt::Debug for ProvidersConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvidersConfig")
            .field("newsapi_key", &self.newsapi_key.as_ref().map(|_| "[REDACTED]"))
            .field(
                "guardian_api_key",
                &self.guardian_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field(
                "nytimes_api_key",
                &self.nytimes_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("newsapi_base_url", &self.newsapi_base_url)
            .field("guardian_base_url", &self.guardian_base_url)
            .field("nytimes_base_url", &self.nytimes_base_url)
            .field("page_size", &self.page_size)
            .field("default_query", &self.default_query)
            .field("country", &self.country)
            .field("nytimes_section", &self.nytimes_section)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// USD per million input tokens
    pub input_price_per_mtok: f64,
    /// USD per million output tokens
    pub output_price_per_mtok: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-haiku-latest".to_string(),
            max_tokens: 512,
            timeout_secs: 60,
            input_price_per_mtok: 0.80,
            output_price_per_mtok: 4.00,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("input_price_per_mtok", &self.input_price_per_mtok)
            .field("output_price_per_mtok", &self.output_price_per_mtok)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub max_attempts: i64,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
    /// Minutes between scheduled fetches. 0 = manual only.
    pub fetch_interval_minutes: u64,
    /// Minutes between trending recomputation. 0 = manual only.
    pub trending_interval_minutes: u64,
    /// Queue analysis for every newly ingested article
    pub auto_analyze: bool,
    /// Articles per batch-analysis task
    pub batch_size: i64,
    pub batch_concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 1_000,
            max_attempts: 3,
            backoff_base_secs: 30,
            backoff_cap_secs: 3_600,
            fetch_interval_minutes: 30,
            trending_interval_minutes: 15,
            auto_analyze: false,
            batch_size: 50,
            batch_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrendingConfig {
    pub window_hours: i64,
    pub min_articles: i64,
    pub top_n: usize,
}

impl Default for TrendingConfig {
    fn default() -> Self {
        Self {
            window_hours: 24,
            min_articles: 2,
            top_n: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Calls retained in the rolling window
    pub window_size: usize,
    pub error_rate_threshold: f64,
    pub p95_latency_ms: u64,
    pub daily_cost_budget_usd: f64,
    /// Consecutive same-category failures that raise an alert
    pub repeated_error_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1_000,
            error_rate_threshold: 0.2,
            p95_latency_ms: 10_000,
            daily_cost_budget_usd: 5.0,
            repeated_error_threshold: 5,
        }
    }
}

/// Known keys per table, used to warn about typos.
const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "",
        &["database_path", "server", "providers", "llm", "worker", "trending", "monitor"],
    ),
    ("server", &["bind", "rate_limit_per_minute", "session_ttl_hours"]),
    (
        "providers",
        &[
            "newsapi_key",
            "guardian_api_key",
            "nytimes_api_key",
            "newsapi_base_url",
            "guardian_base_url",
            "nytimes_base_url",
            "page_size",
            "default_query",
            "country",
            "nytimes_section",
            "max_concurrent",
        ],
    ),
    (
        "llm",
        &[
            "api_key",
            "base_url",
            "model",
            "max_tokens",
            "timeout_secs",
            "input_price_per_mtok",
            "output_price_per_mtok",
        ],
    ),
    (
        "worker",
        &[
            "workers",
            "poll_interval_ms",
            "max_attempts",
            "backoff_base_secs",
            "backoff_cap_secs",
            "fetch_interval_minutes",
            "trending_interval_minutes",
            "auto_analyze",
            "batch_size",
            "batch_concurrency",
        ],
    ),
    ("trending", &["window_hours", "min_articles", "top_n"]),
    (
        "monitor",
        &[
            "window_size",
            "error_rate_threshold",
            "p95_latency_ms",
            "daily_cost_budget_usd",
            "repeated_error_threshold",
        ],
    ),
];

fn unknown_keys(raw: &toml::Table) -> Vec<String> {
    let known = |section: &str| {
        KNOWN_KEYS
            .iter()
            .find(|(name, _)| *name == section)
            .map(|(_, keys)| *keys)
            .unwrap_or(&[])
    };

    let mut unknown = Vec::new();
    for (key, value) in raw {
        if !known("").contains(&key.as_str()) {
            unknown.push(key.clone());
            continue;
        }
        if let toml::Value::Table(table) = value {
            let section_keys = known(key);
            unknown.extend(
                table
                    .keys()
                    .filter(|k| !section_keys.contains(&k.as_str()))
                    .map(|k| format!("{key}.{k}")),
            );
        }
    }
    unknown
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check file size before reading to prevent memory exhaustion
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in unknown_keys(&raw) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), bind = %config.server.bind, "Loaded configuration");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`; present, non-empty values win.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| non_empty(lookup(name));

        if let Some(key) = get("NEWSAPI_KEY") {
            self.providers.newsapi_key = Some(key);
        }
        if let Some(key) = get("GUARDIAN_API_KEY") {
            self.providers.guardian_api_key = Some(key);
        }
        if let Some(key) = get("NYTIMES_API_KEY") {
            self.providers.nytimes_api_key = Some(key);
        }
        if let Some(key) = get("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(bind) = get("NEWSDESK_BIND") {
            self.server.bind = bind;
        }
        if let Some(path) = get("NEWSDESK_DATABASE") {
            self.database_path = path;
        }

        self.providers.newsapi_key = non_empty(self.providers.newsapi_key.take());
        self.providers.guardian_api_key = non_empty(self.providers.guardian_api_key.take());
        self.providers.nytimes_api_key = non_empty(self.providers.nytimes_api_key.take());
        self.llm.api_key = non_empty(self.llm.api_key.take());
    }

    /// Reject settings that would misbehave at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("providers.newsapi_base_url", &self.providers.newsapi_base_url),
            ("providers.guardian_base_url", &self.providers.guardian_base_url),
            ("providers.nytimes_base_url", &self.providers.nytimes_base_url),
            ("llm.base_url", &self.llm.base_url),
        ] {
            validate_base_url(url).map_err(|e| ConfigError::Invalid(format!("{name}: {e}")))?;
        }

        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.server.session_ttl_hours <= 0 {
            return invalid("server.session_ttl_hours must be positive");
        }
        if self.worker.max_attempts < 1 {
            return invalid("worker.max_attempts must be at least 1");
        }
        if self.worker.backoff_base_secs < 0 || self.worker.backoff_cap_secs < 0 {
            return invalid("worker backoff must not be negative");
        }
        if !(1..=100).contains(&self.providers.page_size) {
            return invalid("providers.page_size must be between 1 and 100");
        }
        if !(0.0..=1.0).contains(&self.monitor.error_rate_threshold) {
            return invalid("monitor.error_rate_threshold must be between 0 and 1");
        }
        if self.trending.window_hours <= 0 {
            return invalid("trending.window_hours must be positive");
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_config(name: &str, content: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("newsdesk_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("newsdesk.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.database_path, "newsdesk.db");
        assert!(config.providers.newsapi_key.is_none());
        assert_eq!(config.worker.max_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/newsdesk_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_empty_file_returns_default() {
        let path = write_config("empty", "   \n  ");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.trending.window_hours, 24);
        cleanup(&path);
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let path = write_config(
            "partial",
            r#"
database_path = "/var/lib/newsdesk.db"

[server]
bind = "0.0.0.0:9000"

[worker]
workers = 8
auto_analyze = true
"#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.database_path, "/var/lib/newsdesk.db");
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.server.rate_limit_per_minute, 120);
        assert_eq!(config.worker.workers, 8);
        assert!(config.worker.auto_analyze);
        assert_eq!(config.worker.max_attempts, 3);
        cleanup(&path);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let path = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        cleanup(&path);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let path = write_config("wrongtype", "[server]\nrate_limit_per_minute = \"lots\"\n");
        assert!(Config::load(&path).is_err());
        cleanup(&path);
    }

    #[test]
    fn test_unknown_keys_detected_but_accepted() {
        let content = r#"
typo_key = 1
[server]
bnid = "x"
[llm]
model = "m"
"#;
        let raw: toml::Table = content.parse().unwrap();
        let mut unknown = unknown_keys(&raw);
        unknown.sort();
        assert_eq!(unknown, ["server.bnid", "typo_key"]);

        let path = write_config("unknown", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(config.llm.model, "m");
        cleanup(&path);
    }

    #[test]
    fn test_too_large_file_rejected() {
        let path = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        cleanup(&path);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config.providers.newsapi_key = Some("from-file".into());
        config.llm.api_key = Some("   ".into());

        let env: HashMap<&str, &str> = [
            ("NEWSAPI_KEY", "from-env"),
            ("GUARDIAN_API_KEY", ""),
            ("NEWSDESK_BIND", "0.0.0.0:1234"),
            ("NEWSDESK_DATABASE", ":memory:"),
        ]
        .into_iter()
        .collect();
        config.apply_env_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.providers.newsapi_key.as_deref(), Some("from-env"));
        assert!(config.providers.guardian_api_key.is_none());
        // Blank file values are treated as unset
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.server.bind, "0.0.0.0:1234");
        assert_eq!(config.database_path, ":memory:");
    }

    #[test]
    fn test_validate_rejects_plain_http_base_url() {
        let mut config = Config::default();
        config.providers.guardian_base_url = "http://content.guardianapis.com".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("guardian_base_url"));

        config.providers.guardian_base_url = "http://127.0.0.1:9999".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config::default();
        config.worker.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.providers.page_size = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_masks_api_keys() {
        let mut config = Config::default();
        config.providers.nytimes_api_key = Some("nyt-secret-123".into());
        config.llm.api_key = Some("sk-ant-secret".into());

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("nyt-secret-123"));
        assert!(!debug_output.contains("sk-ant-secret"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
