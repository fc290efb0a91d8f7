//! News aggregation backend: provider ingest, filtering and search, trending
//! topics, and an LLM enrichment pipeline behind a REST API.

pub mod ai;
pub mod api;
pub mod config;
pub mod providers;
pub mod search;
pub mod storage;
pub mod tasks;
pub mod util;
