//! Shared GET-with-retry plumbing for provider clients.

use futures::StreamExt;
use serde::de::DeserializeOwned;

use super::{ProviderError, RetryPolicy};

const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// GET `url` and decode the JSON body.
///
/// 429 and 5xx responses back off per `policy`; other non-2xx statuses fail
/// immediately. `label` is logged instead of the URL, which may carry an
/// API key in its query string.
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &url::Url,
    headers: &[(&str, &str)],
    policy: &RetryPolicy,
    label: &str,
) -> Result<T, ProviderError> {
    let mut retry_count = 0;

    let bytes = loop {
        let mut request = client.get(url.as_str());
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        // One deadline per attempt covers the headers and the whole body
        let deadline = tokio::time::Instant::now() + policy.timeout;
        let response = tokio::time::timeout_at(deadline, request.send())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(ProviderError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            if retry_count >= policy.max_retries {
                return Err(if status.is_server_error() {
                    ProviderError::HttpStatus(status.as_u16())
                } else {
                    ProviderError::RateLimited(policy.max_retries)
                });
            }

            let delay = policy.delay(retry_count);
            tracing::warn!(
                provider = label,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Provider request throttled or failed, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
            continue;
        }

        if !status.is_success() {
            return Err(ProviderError::HttpStatus(status.as_u16()));
        }

        let body = tokio::time::timeout_at(deadline, read_limited_bytes(response, MAX_RESPONSE_SIZE))
            .await
            .map_err(|_| ProviderError::Timeout)?;
        match body {
            Ok(bytes) => break bytes,
            Err(ProviderError::IncompleteResponse { expected, received })
                if retry_count < policy.max_retries =>
            {
                tracing::debug!(
                    provider = label,
                    expected,
                    received,
                    attempt = retry_count + 1,
                    "Retrying incomplete download"
                );
                tokio::time::sleep(policy.delay(retry_count)).await;
                retry_count += 1;
            }
            Err(e) => return Err(e),
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| ProviderError::Parse(e.to_string()))
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, ProviderError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(ProviderError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(ProviderError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ProviderError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(ProviderError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
