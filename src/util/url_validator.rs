use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
    #[error("URL has no host")]
    MissingHost,
    #[error("API base URL must use https: {0}")]
    InsecureBaseUrl(String),
}

/// Validates an article URL coming from a provider or a client.
///
/// Rejects non-HTTP(S) schemes, localhost and private address ranges, so
/// stored links never point into the deployment's own network.
///
/// ```
/// use newsdesk::util::validate_url;
///
/// assert!(validate_url("https://example.com/world/story").is_ok());
/// assert!(validate_url("http://192.168.1.1/admin").is_err());
/// assert!(validate_url("javascript:alert(1)").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;
    if is_localhost(host) {
        return Err(UrlValidationError::Localhost);
    }
    if let Some(ip) = parse_ip(host) {
        if ip.is_loopback() {
            return Err(UrlValidationError::Localhost);
        }
        if is_private_ip(&ip) {
            return Err(UrlValidationError::PrivateIp(ip.to_string()));
        }
    }

    Ok(url)
}

/// Validates a provider or LLM API base URL from configuration.
///
/// API keys travel in headers or query strings, so only `https` is accepted.
/// Plain `http` is allowed for loopback hosts, where local mocks run.
pub fn validate_base_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;
    let host = url.host_str().ok_or(UrlValidationError::MissingHost)?;

    match url.scheme() {
        "https" => Ok(url),
        "http" if is_localhost(host) || parse_ip(host).is_some_and(|ip| ip.is_loopback()) => {
            Ok(url)
        }
        "http" => Err(UrlValidationError::InsecureBaseUrl(url_str.to_owned())),
        scheme => Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }
}

fn is_localhost(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost")
}

fn parse_ip(host: &str) -> Option<IpAddr> {
    // Strip brackets from IPv6 addresses for parsing
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
        .parse::<IpAddr>()
        .ok()
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_private() || ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified()
        }
        IpAddr::V6(ipv6) => {
            if ipv6.is_loopback() || ipv6.is_unspecified() {
                return true;
            }
            let segments = ipv6.segments();
            // Unique Local (fc00::/7)
            let is_unique_local = (segments[0] & 0xfe00) == 0xfc00;
            // Link-Local (fe80::/10)
            let is_link_local = (segments[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local
        }
    }
}
