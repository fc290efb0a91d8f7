//! Input rules shared by the handlers.

use super::error::Violations;
use crate::util::validate_url;

pub const MAX_TITLE_CHARS: usize = 500;
pub const MIN_PASSWORD_CHARS: usize = 8;
pub const MAX_PASSWORD_CHARS: usize = 128;
pub const MAX_EMAIL_CHARS: usize = 254;
pub const MAX_NOTE_CHARS: usize = 1_000;
pub const MAX_PREFERENCE_ITEMS: usize = 50;

/// `local@domain.tld` with no whitespace, one `@`, and a dotted domain.
pub fn is_valid_email(email: &str) -> bool {
    if email.len() > MAX_EMAIL_CHARS || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
}

/// 3 to 32 ASCII letters, digits or underscores.
pub fn is_valid_username(username: &str) -> bool {
    (3..=32).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn check_password(v: &mut Violations, password: &str) {
    let chars = password.chars().count();
    if chars < MIN_PASSWORD_CHARS {
        v.add("password", format!("must be at least {MIN_PASSWORD_CHARS} characters"));
    } else if chars > MAX_PASSWORD_CHARS {
        v.add("password", format!("must be at most {MAX_PASSWORD_CHARS} characters"));
    }
}

pub fn check_title(v: &mut Violations, title: &str) {
    let chars = title.trim().chars().count();
    if chars == 0 {
        v.add("title", "must not be empty");
    } else if chars > MAX_TITLE_CHARS {
        v.add("title", format!("must be at most {MAX_TITLE_CHARS} characters"));
    }
}

pub fn check_url(v: &mut Violations, url: &str) {
    if let Err(e) = validate_url(url) {
        v.add("url", e.to_string());
    }
}
