//! Utility functions for common operations.
//!
//! - **URL validation**: article links and configured API base URLs
//! - **Text processing**: sanitising provider text and char-safe truncation

mod text;
mod url_validator;

pub use text::{clean_text, strip_control_chars, strip_html_tags, truncate_chars};
pub use url_validator::{validate_base_url, validate_url, UrlValidationError};

/// Maximum allowed search query length, shared by request validation and FTS5 validation
pub const MAX_SEARCH_QUERY_LENGTH: usize = 256;
