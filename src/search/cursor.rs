//! Keyset pagination over article listings.
//!
//! A cursor records the sort it was minted for plus the last row's sort key
//! and id. The next page continues strictly after that `(key, id)` pair, so
//! inserts between requests never duplicate or skip rows already served.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};
use thiserror::Error;

use crate::storage::Article;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// Hex-encoded cursors longer than this are rejected without decoding.
const MAX_CURSOR_LEN: usize = 512;

#[derive(Debug, Error, PartialEq)]
pub enum CursorError {
    #[error("Malformed cursor")]
    Malformed,
    #[error("Cursor was issued for sort '{issued}', not '{requested}'")]
    SortMismatch { issued: String, requested: String },
    #[error("Unknown sort field: {0}")]
    InvalidSort(String),
}

// ============================================================================
// Sort
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    PublishedAt,
    FetchedAt,
    RelevanceScore,
    SentimentScore,
    ViewCount,
}

impl SortField {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "published_at" => SortField::PublishedAt,
            "fetched_at" => SortField::FetchedAt,
            "relevance_score" => SortField::RelevanceScore,
            "sentiment_score" => SortField::SentimentScore,
            "view_count" => SortField::ViewCount,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            SortField::PublishedAt => "published_at",
            SortField::FetchedAt => "fetched_at",
            SortField::RelevanceScore => "relevance_score",
            SortField::SentimentScore => "sentiment_score",
            SortField::ViewCount => "view_count",
        }
    }

    /// Sort expression. Nullable columns are coalesced below their domain so
    /// unscored rows sort last when descending.
    fn column(self) -> &'static str {
        match self {
            SortField::PublishedAt => "COALESCE(a.published_at, a.fetched_at)",
            SortField::FetchedAt => "a.fetched_at",
            SortField::RelevanceScore => "COALESCE(a.relevance_score, -1.0)",
            SortField::SentimentScore => "COALESCE(a.sentiment_score, -2.0)",
            SortField::ViewCount => "a.view_count",
        }
    }

    fn key_of(self, article: &Article) -> CursorValue {
        match self {
            SortField::PublishedAt => CursorValue::Int(article.effective_published()),
            SortField::FetchedAt => CursorValue::Int(article.fetched_at),
            SortField::RelevanceScore => {
                CursorValue::Float(article.relevance_score.unwrap_or(-1.0))
            }
            SortField::SentimentScore => {
                CursorValue::Float(article.sentiment_score.unwrap_or(-2.0))
            }
            SortField::ViewCount => CursorValue::Int(article.view_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sort {
    pub field: SortField,
    pub direction: Direction,
}

impl Default for Sort {
    fn default() -> Self {
        Self {
            field: SortField::PublishedAt,
            direction: Direction::Desc,
        }
    }
}

impl Sort {
    /// Parse `field` (ascending) or `-field` (descending).
    pub fn parse(raw: &str) -> Result<Self, CursorError> {
        let raw = raw.trim();
        let (name, direction) = match raw.strip_prefix('-') {
            Some(rest) => (rest, Direction::Desc),
            None => (raw, Direction::Asc),
        };
        let field =
            SortField::parse(name).ok_or_else(|| CursorError::InvalidSort(name.to_string()))?;
        Ok(Self { field, direction })
    }

    /// Canonical string form, the inverse of [`Sort::parse`].
    pub fn token(&self) -> String {
        match self.direction {
            Direction::Desc => format!("-{}", self.field.name()),
            Direction::Asc => self.field.name().to_string(),
        }
    }

    /// Append the keyset predicate for rows after `cursor`.
    pub fn push_after(&self, builder: &mut QueryBuilder<'_, Sqlite>, cursor: &Cursor) {
        let column = self.field.column();
        let cmp = match self.direction {
            Direction::Desc => " < ",
            Direction::Asc => " > ",
        };

        builder.push(" AND (");
        builder.push(column);
        builder.push(cmp);
        push_cursor_value(builder, &cursor.value);
        builder.push(" OR (");
        builder.push(column);
        builder.push(" = ");
        push_cursor_value(builder, &cursor.value);
        builder.push(" AND a.id");
        builder.push(cmp);
        builder.push_bind(cursor.id);
        builder.push("))");
    }

    /// Append `ORDER BY`, with id as the tie-breaker in the same direction.
    pub fn push_order_by(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        let dir = match self.direction {
            Direction::Desc => " DESC",
            Direction::Asc => " ASC",
        };
        builder.push(" ORDER BY ");
        builder.push(self.field.column());
        builder.push(dir);
        builder.push(", a.id");
        builder.push(dir);
    }

    pub fn cursor_for(&self, article: &Article) -> Cursor {
        Cursor {
            sort: self.token(),
            value: self.field.key_of(article),
            id: article.id,
        }
    }
}

fn push_cursor_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &CursorValue) {
    match value {
        CursorValue::Int(v) => builder.push_bind(*v),
        CursorValue::Float(v) => builder.push_bind(*v),
    };
}

// ============================================================================
// Cursor
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorValue {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "s")]
    pub sort: String,
    #[serde(rename = "v")]
    pub value: CursorValue,
    #[serde(rename = "i")]
    pub id: i64,
}

impl Cursor {
    /// Opaque token: lowercase hex of the JSON form.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        json.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(token: &str) -> Result<Self, CursorError> {
        if token.is_empty() || token.len() > MAX_CURSOR_LEN || token.len() % 2 != 0 {
            return Err(CursorError::Malformed);
        }
        let bytes = (0..token.len())
            .step_by(2)
            .map(|i| {
                token
                    .get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            })
            .collect::<Option<Vec<u8>>>()
            .ok_or(CursorError::Malformed)?;
        serde_json::from_slice(&bytes).map_err(|_| CursorError::Malformed)
    }

    /// Decode and check that the cursor belongs to `sort`.
    pub fn decode_for(token: &str, sort: &Sort) -> Result<Self, CursorError> {
        let cursor = Self::decode(token)?;
        let requested = sort.token();
        if cursor.sort != requested {
            return Err(CursorError::SortMismatch {
                issued: cursor.sort,
                requested,
            });
        }
        // Integer keys never carry a fractional value
        let integer_key = matches!(
            sort.field,
            SortField::PublishedAt | SortField::FetchedAt | SortField::ViewCount
        );
        if integer_key && matches!(cursor.value, CursorValue::Float(_)) {
            return Err(CursorError::Malformed);
        }
        Ok(cursor)
    }
}

// ============================================================================
// Page
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Apply the default and upper bound to a requested page size.
pub fn clamp_limit(requested: Option<i64>) -> i64 {
    requested
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE)
}

/// Build a page from `limit + 1` fetched rows.
pub fn paginate(mut rows: Vec<Article>, limit: i64, sort: &Sort) -> Page<Article> {
    let limit = usize::try_from(limit).unwrap_or(0);
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = if has_more {
        rows.last().map(|last| sort.cursor_for(last).encode())
    } else {
        None
    };
    Page {
        items: rows,
        next_cursor,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sort_parse() {
        assert_eq!(Sort::parse("-published_at").unwrap(), Sort::default());
        let asc = Sort::parse("view_count").unwrap();
        assert_eq!(asc.field, SortField::ViewCount);
        assert_eq!(asc.direction, Direction::Asc);
        assert_eq!(asc.token(), "view_count");
        assert_eq!(
            Sort::parse("-title").unwrap_err(),
            CursorError::InvalidSort("title".into())
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Cursor::decode("").unwrap_err(), CursorError::Malformed);
        assert_eq!(Cursor::decode("abc").unwrap_err(), CursorError::Malformed);
        assert_eq!(Cursor::decode("zz").unwrap_err(), CursorError::Malformed);
        // valid hex, not JSON
        assert_eq!(Cursor::decode("0102").unwrap_err(), CursorError::Malformed);
        let long = "a".repeat(MAX_CURSOR_LEN + 2);
        assert_eq!(Cursor::decode(&long).unwrap_err(), CursorError::Malformed);
    }

    #[test]
    fn test_cursor_bound_to_sort() {
        let cursor = Cursor {
            sort: "-published_at".into(),
            value: CursorValue::Int(100),
            id: 7,
        };
        let token = cursor.encode();

        assert_eq!(Cursor::decode_for(&token, &Sort::default()).unwrap(), cursor);

        let other = Sort::parse("-view_count").unwrap();
        assert!(matches!(
            Cursor::decode_for(&token, &other).unwrap_err(),
            CursorError::SortMismatch { .. }
        ));
    }

    #[test]
    fn test_float_cursor_rejected_for_integer_sort() {
        let cursor = Cursor {
            sort: "-view_count".into(),
            value: CursorValue::Float(0.5),
            id: 1,
        };
        let sort = Sort::parse("-view_count").unwrap();
        assert_eq!(
            Cursor::decode_for(&cursor.encode(), &sort).unwrap_err(),
            CursorError::Malformed
        );
    }

    #[test]
    fn test_keyset_sql_shape() {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT a.id FROM articles a WHERE 1=1");
        let sort = Sort::default();
        let cursor = Cursor {
            sort: sort.token(),
            value: CursorValue::Int(5),
            id: 2,
        };
        sort.push_after(&mut builder, &cursor);
        sort.push_order_by(&mut builder);
        let sql = builder.sql();
        assert!(sql.contains(
            "AND (COALESCE(a.published_at, a.fetched_at) < ? OR (COALESCE(a.published_at, a.fetched_at) = ? AND a.id < ?))"
        ));
        assert!(sql.ends_with("ORDER BY COALESCE(a.published_at, a.fetched_at) DESC, a.id DESC"));
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(500)), MAX_PAGE_SIZE);
        assert_eq!(clamp_limit(Some(35)), 35);
    }

    proptest! {
        #[test]
        fn prop_cursor_token_decodes_to_same_cursor(
            id in any::<i64>(),
            value in any::<i64>(),
            desc in any::<bool>(),
        ) {
            let sort = Sort {
                field: SortField::FetchedAt,
                direction: if desc { Direction::Desc } else { Direction::Asc },
            };
            let cursor = Cursor { sort: sort.token(), value: CursorValue::Int(value), id };
            let decoded = Cursor::decode_for(&cursor.encode(), &sort).unwrap();
            prop_assert_eq!(decoded, cursor);
        }

        #[test]
        fn prop_float_cursor_value_is_exact(value in -1.0f64..1.0, id in 0i64..1_000_000) {
            let sort = Sort::parse("-relevance_score").unwrap();
            let cursor = Cursor { sort: sort.token(), value: CursorValue::Float(value), id };
            let decoded = Cursor::decode_for(&cursor.encode(), &sort).unwrap();
            prop_assert_eq!(decoded.value, CursorValue::Float(value));
        }
    }
}
