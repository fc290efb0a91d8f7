use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ArticleDbRow, DatabaseError, FtsConsistencyReport, ARTICLE_COLUMNS};
use crate::search::filter::{escape_like, FilterSet};
use crate::util::MAX_SEARCH_QUERY_LENGTH;

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Maximum number of full-text hits returned by one search
pub const MAX_SEARCH_RESULTS: i64 = 200;

/// Maximum number of title suggestions
const MAX_SUGGESTIONS: i64 = 20;

/// Validate FTS5 query complexity to prevent DoS via expensive wildcard expansions.
///
/// Limits:
/// - Maximum query length: 256 characters
/// - Maximum wildcards (*): 3
/// - Maximum OR operators: 5
/// - Maximum parentheses: 5, and they must balance
/// - Maximum AND operators: 10
pub fn validate_fts_query(query: &str) -> Result<()> {
    if query.len() > MAX_SEARCH_QUERY_LENGTH {
        anyhow::bail!(
            "Search query exceeds maximum length of {} characters",
            MAX_SEARCH_QUERY_LENGTH
        );
    }

    let wildcard_count = query.matches('*').count();
    if wildcard_count > MAX_WILDCARDS {
        anyhow::bail!(
            "Search query contains too many wildcards (max {})",
            MAX_WILDCARDS
        );
    }

    let upper = query.to_uppercase();
    if upper.matches(" OR ").count() > MAX_OR_OPERATORS {
        anyhow::bail!(
            "Search query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        );
    }

    let open_paren_count = query.chars().filter(|&c| c == '(').count();
    let close_paren_count = query.chars().filter(|&c| c == ')').count();
    if open_paren_count > MAX_PARENTHESES {
        anyhow::bail!(
            "Search query contains too many parentheses (max {})",
            MAX_PARENTHESES
        );
    }
    if open_paren_count != close_paren_count {
        anyhow::bail!("Search query has unbalanced parentheses");
    }

    if upper.matches(" AND ").count() > MAX_AND_OPERATORS {
        anyhow::bail!(
            "Search query contains too many AND operators (max {})",
            MAX_AND_OPERATORS
        );
    }

    Ok(())
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Full-text search over title, description and content.
    ///
    /// Uses FTS5 MATCH ranked by bm25, falling back to LIKE over title and
    /// description when the query is not valid FTS5 syntax. `filters` narrow
    /// both paths identically.
    pub async fn search_articles(
        &self,
        query: &str,
        filters: &FilterSet,
        limit: i64,
    ) -> Result<Vec<Article>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        validate_fts_query(query)?;
        let limit = limit.clamp(1, MAX_SEARCH_RESULTS);

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles a \
             JOIN sources s ON s.id = a.source_id \
             JOIN articles_fts ON a.id = articles_fts.rowid \
             WHERE articles_fts MATCH "
        ));
        builder.push_bind(query.to_string());
        filters.push_sql(&mut builder);
        builder.push(" ORDER BY bm25(articles_fts), a.id DESC LIMIT ");
        builder.push_bind(limit);

        let fts_result: Result<Vec<ArticleDbRow>, sqlx::Error> =
            builder.build_query_as().fetch_all(&self.pool).await;

        match fts_result {
            Ok(rows) => Ok(rows.into_iter().map(ArticleDbRow::into_article).collect()),
            Err(e) => {
                tracing::warn!(error = %e, query = %query, "FTS5 search failed, falling back to LIKE");
                let pattern = format!("%{}%", escape_like(query));

                let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
                    "SELECT {ARTICLE_COLUMNS} FROM articles a \
                     JOIN sources s ON s.id = a.source_id WHERE (a.title LIKE "
                ));
                builder.push_bind(pattern.clone());
                builder.push(" ESCAPE '\\' OR a.description LIKE ");
                builder.push_bind(pattern);
                builder.push(" ESCAPE '\\')");
                filters.push_sql(&mut builder);
                builder.push(" ORDER BY COALESCE(a.published_at, a.fetched_at) DESC, a.id DESC LIMIT ");
                builder.push_bind(limit);

                let rows: Vec<ArticleDbRow> =
                    builder.build_query_as().fetch_all(&self.pool).await?;
                Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
            }
        }
    }

    /// Distinct titles starting with `prefix`, newest first.
    pub async fn suggest_titles(&self, prefix: &str, limit: i64) -> Result<Vec<String>> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = format!("{}%", escape_like(prefix));
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT title FROM articles
            WHERE title LIKE ? ESCAPE '\'
            GROUP BY title
            ORDER BY MAX(COALESCE(published_at, fetched_at)) DESC
            LIMIT ?
        "#,
        )
        .bind(pattern)
        .bind(limit.clamp(1, MAX_SUGGESTIONS))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(title,)| title).collect())
    }

    // ========================================================================
    // FTS5 Maintenance Operations
    // ========================================================================

    /// Compare the `articles_fts` index against the `articles` table.
    pub async fn check_fts_consistency_detailed(
        &self,
    ) -> Result<FtsConsistencyReport, DatabaseError> {
        let articles_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;

        let fts_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles_fts")
            .fetch_one(&self.pool)
            .await?;

        // Orphaned: in FTS but not in articles
        let orphaned: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles_fts LEFT JOIN articles ON articles_fts.rowid = articles.id WHERE articles.id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        // Missing: in articles but not in FTS
        let missing: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles LEFT JOIN articles_fts ON articles.id = articles_fts.rowid WHERE articles_fts.rowid IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let is_consistent = orphaned.0 == 0 && missing.0 == 0 && articles_count.0 == fts_count.0;

        tracing::debug!(
            articles = articles_count.0,
            fts = fts_count.0,
            orphaned = orphaned.0,
            missing = missing.0,
            is_consistent,
            "FTS5 detailed consistency check"
        );

        Ok(FtsConsistencyReport {
            articles_count: articles_count.0,
            fts_count: fts_count.0,
            orphaned_fts_entries: orphaned.0,
            missing_fts_entries: missing.0,
            is_consistent,
        })
    }

    /// Rebuild the FTS5 index from the articles table, returning the row count.
    pub async fn rebuild_fts_index(&self) -> Result<usize> {
        sqlx::query("INSERT INTO articles_fts(articles_fts) VALUES('rebuild')")
            .execute(&self.pool)
            .await?;

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0 as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::validate_fts_query;
    use crate::search::filter::FilterSet;
    use crate::storage::{Database, IncomingArticle, SourceRef};

    async fn seeded_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        let source = db
            .upsert_source(&SourceRef {
                key: "manual".into(),
                name: "Manual".into(),
                provider: "manual".into(),
                url: None,
            })
            .await
            .unwrap();
        let articles: Vec<IncomingArticle> = [
            ("1", "Rust Programming Guide", "science"),
            ("2", "Python Tutorial", "technology"),
            ("3", "Rust belt economy", "business"),
        ]
        .into_iter()
        .map(|(slug, title, category)| IncomingArticle {
            title: title.to_string(),
            description: Some("Test description".to_string()),
            content: None,
            url: format!("https://example.com/{slug}"),
            author: None,
            category: Some(category.to_string()),
            published_at: Some(1_704_067_200),
        })
        .collect();
        db.upsert_articles(source, &articles).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_search_by_title() {
        let db = seeded_db().await;
        let results = db
            .search_articles("Python", &FilterSet::new(), 50)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Python Tutorial");
    }

    #[tokio::test]
    async fn test_search_with_filters() {
        let db = seeded_db().await;
        let filters = FilterSet::from_pairs([("category", "business")], 0).unwrap();
        let results = db.search_articles("rust", &filters, 50).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Rust belt economy");
    }

    #[tokio::test]
    async fn test_search_falls_back_on_fts_syntax_error() {
        let db = seeded_db().await;
        // Unterminated quote is an FTS5 syntax error
        let results = db
            .search_articles("\"Rust Prog", &FilterSet::new(), 50)
            .await
            .unwrap();
        assert!(results.is_empty());

        let results = db
            .search_articles("Tutorial\"", &FilterSet::new(), 50)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_search_empty_query() {
        let db = seeded_db().await;
        let results = db.search_articles("  ", &FilterSet::new(), 50).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_suggest_titles() {
        let db = seeded_db().await;
        let mut titles = db.suggest_titles("rust", 10).await.unwrap();
        titles.sort();
        assert_eq!(titles, ["Rust Programming Guide", "Rust belt economy"]);
        assert!(db.suggest_titles("%", 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_query_complexity_limits() {
        assert!(validate_fts_query("rust AND async").is_ok());
        assert!(validate_fts_query("a* b* c* d*").is_err());
        assert!(validate_fts_query("(a OR b").is_err());
        assert!(validate_fts_query(&"x".repeat(300)).is_err());
        assert!(validate_fts_query("a OR b OR c OR d OR e OR f OR g").is_err());
    }

    #[tokio::test]
    async fn test_fts_consistency_and_rebuild() {
        let db = seeded_db().await;
        let report = db.check_fts_consistency_detailed().await.unwrap();
        assert!(report.is_consistent);
        assert_eq!(report.articles_count, 3);
        assert_eq!(report.fts_count, 3);

        let count = db.rebuild_fts_index().await.unwrap();
        assert_eq!(count, 3);
        let results = db
            .search_articles("Programming", &FilterSet::new(), 50)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_fts_follows_deletes() {
        let db = seeded_db().await;
        let hits = db.search_articles("Python", &FilterSet::new(), 50).await.unwrap();
        db.delete_article(hits[0].id).await.unwrap();

        let report = db.check_fts_consistency_detailed().await.unwrap();
        assert!(report.is_consistent);
        assert!(db
            .search_articles("Python", &FilterSet::new(), 50)
            .await
            .unwrap()
            .is_empty());
    }
}
