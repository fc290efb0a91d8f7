//! Article discovery: query-string filters, keyset pagination, trending
//! topics and token-overlap similarity.

pub mod cursor;
pub mod filter;
pub mod similarity;
pub mod trending;

pub use cursor::{Cursor, CursorError, Page, Sort};
pub use filter::{FilterError, FilterSet};
pub use similarity::{Method, SimilarityIndex, TokenBag};
pub use trending::{refresh_trending, trending_score, TrendingParams};
