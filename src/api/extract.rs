//! Extractors that report rejections in the API's JSON error shape.

use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use axum::Json;
use serde::de::DeserializeOwned;

use super::error::ApiError;
use crate::search::cursor::{clamp_limit, Cursor, Sort};
use crate::search::FilterSet;

/// `Json<T>` with rejections mapped to [`ApiError`].
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Query<T>` with rejections mapped to [`ApiError`].
pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// Decode an optional JSON body; empty bodies give `T::default()`.
pub fn optional_body<T: DeserializeOwned + Default>(bytes: &[u8]) -> Result<T, ApiError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(bytes).map_err(|e| ApiError::BadRequest(format!("Invalid JSON body: {e}")))
}

/// Raw query-string pairs, in order, for the filter DSL.
pub type Pairs = Vec<(String, String)>;

fn lookup<'a>(pairs: &'a Pairs, key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Optional integer parameter; present but unparsable is a 400.
pub fn int_param(pairs: &Pairs, key: &str) -> Result<Option<i64>, ApiError> {
    lookup(pairs, key)
        .map(|raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|_| ApiError::BadRequest(format!("'{key}' must be an integer")))
        })
        .transpose()
}

pub fn float_param(pairs: &Pairs, key: &str) -> Result<Option<f64>, ApiError> {
    lookup(pairs, key)
        .map(|raw| {
            raw.trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ApiError::BadRequest(format!("'{key}' must be a number")))
        })
        .transpose()
}

pub fn str_param<'a>(pairs: &'a Pairs, key: &str) -> Option<&'a str> {
    lookup(pairs, key).map(str::trim).filter(|v| !v.is_empty())
}

/// Filters, sort, cursor and page size from one query string.
pub struct Listing {
    pub filters: FilterSet,
    pub sort: Sort,
    pub cursor: Option<Cursor>,
    pub limit: Option<i64>,
}

impl Listing {
    pub fn parse(pairs: &Pairs) -> Result<Self, ApiError> {
        let now = chrono::Utc::now().timestamp();
        let filters = FilterSet::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())), now)?;
        let sort = match str_param(pairs, "sort") {
            Some(raw) => Sort::parse(raw)?,
            None => Sort::default(),
        };
        let cursor = str_param(pairs, "cursor")
            .map(|token| Cursor::decode_for(token, &sort))
            .transpose()?;
        let limit = int_param(pairs, "limit")?;
        Ok(Self {
            filters,
            sort,
            cursor,
            limit,
        })
    }

    pub fn limit_or(&self, default: i64) -> i64 {
        clamp_limit(Some(self.limit.unwrap_or(default)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Pairs {
        raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_int_param() {
        let p = pairs(&[("limit", "5"), ("days", "x")]);
        assert_eq!(int_param(&p, "limit").unwrap(), Some(5));
        assert_eq!(int_param(&p, "missing").unwrap(), None);
        assert!(matches!(int_param(&p, "days"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_listing_parses_filters_and_sort() {
        let p = pairs(&[("category", "tech"), ("sort", "-view_count"), ("limit", "500")]);
        let listing = Listing::parse(&p).unwrap();
        assert_eq!(listing.filters.predicates().len(), 1);
        assert_eq!(listing.sort.token(), "-view_count");
        assert_eq!(listing.limit_or(20), 100);
    }

    #[test]
    fn test_listing_rejects_bad_input() {
        assert!(matches!(
            Listing::parse(&pairs(&[("colour", "red")])),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            Listing::parse(&pairs(&[("cursor", "zz")])),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            Listing::parse(&pairs(&[("sort", "-colour")])),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn test_optional_body() {
        #[derive(serde::Deserialize, Default, Debug, PartialEq)]
        struct Body {
            n: Option<i64>,
        }
        assert_eq!(optional_body::<Body>(b"").unwrap(), Body::default());
        assert_eq!(optional_body::<Body>(b"{\"n\": 2}").unwrap(), Body { n: Some(2) });
        assert!(optional_body::<Body>(b"{").is_err());
    }
}
