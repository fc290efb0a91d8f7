use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmConfig;
use crate::util::validate_base_url;

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request timed out after {0}s")]
    Timeout(u64),
    #[error("LLM rate limit reached")]
    RateLimited,
    #[error("LLM authentication failed (status {0})")]
    Auth(u16),
    #[error("LLM server error: status {0}")]
    Server(u16),
    #[error("LLM HTTP error: status {0}")]
    Http(u16),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Invalid LLM response: {0}")]
    InvalidResponse(String),
    #[error("No LLM API key configured")]
    NotConfigured,
}

impl LlmError {
    /// Short label used to group failures in the monitor.
    pub fn category(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "timeout",
            LlmError::RateLimited => "rate_limited",
            LlmError::Auth(_) => "auth",
            LlmError::Server(_) => "server",
            LlmError::Http(_) => "http",
            LlmError::Network(_) => "network",
            LlmError::InvalidResponse(_) => "invalid_response",
            LlmError::NotConfigured => "not_configured",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::Timeout(_) | LlmError::RateLimited | LlmError::Server(_) | LlmError::Network(_)
        )
    }

    fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => LlmError::Auth(status),
            429 => LlmError::RateLimited,
            500..=599 => LlmError::Server(status),
            _ => LlmError::Http(status),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Model name recorded with every call
    fn model(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl AnthropicClient {
    /// Build from config. A missing key yields a client whose calls fail
    /// with [`LlmError::NotConfigured`].
    pub fn new(client: reqwest::Client, config: &LlmConfig) -> Result<Self, LlmError> {
        validate_base_url(&config.base_url)
            .map_err(|e| LlmError::InvalidResponse(format!("base URL rejected: {e}")))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone().map(SecretString::from),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let key = self.api_key.as_ref().ok_or(LlmError::NotConfigured)?;

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens.max(1),
            system: request.system.as_deref(),
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let send = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))??;

        let status = response.status();
        if !status.is_success() {
            tracing::debug!(status = %status, "LLM request rejected");
            return Err(LlmError::from_status(status.as_u16()));
        }

        let parsed: MessagesResponse = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| LlmError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(LlmError::InvalidResponse("no text content".to_string()));
        }

        let usage = parsed.usage.unwrap_or(Usage {
            input_tokens: 0,
            output_tokens: 0,
        });
        Ok(Completion {
            text,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
    }
}
