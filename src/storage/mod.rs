mod analyses;
mod analytics;
mod articles;
mod bookmarks;
mod preferences;
mod schema;
mod search;
mod sources;
mod tasks;
mod trending;
mod types;
mod users;

pub use analytics::MAX_ANALYTICS_DAYS;
pub use articles::{ArticleQuery, MAX_SIMILARITY_CANDIDATES};
pub use schema::Database;
pub use search::{validate_fts_query, MAX_SEARCH_RESULTS};
pub use types::{
    AnalysisUpdate, Article, ArticleAnalysis, Bookmark, CategoryStat, DatabaseError,
    FtsConsistencyReport, IncomingArticle, NewAnalysis, OverviewStats, ProcessingStatus,
    SentimentDistribution, SentimentPoint, Source, SourceRef, SourceStat, StorageError,
    TaskRecord, TaskStats, TaskStatus, TopicSample, TrendingTopic, UpsertOutcome, User,
    UserPreferences, ViewedArticle,
};
pub use users::NewUser;
