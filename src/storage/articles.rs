use std::collections::HashSet;

use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{
    AnalysisUpdate, Article, ArticleDbRow, IncomingArticle, ProcessingStatus, StorageError,
    UpsertOutcome, ARTICLE_COLUMNS,
};
use crate::search::cursor::{paginate, Cursor, Page, Sort, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use crate::search::filter::FilterSet;

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Upper bound on candidates loaded for similarity ranking
pub const MAX_SIMILARITY_CANDIDATES: i64 = 500;

/// Upper bound on rows returned by status scans (batch analysis)
const MAX_STATUS_SCAN: i64 = 1000;

/// A filtered, sorted, cursor-paginated article listing.
#[derive(Debug, Clone)]
pub struct ArticleQuery {
    pub filters: FilterSet,
    pub sort: Sort,
    pub cursor: Option<Cursor>,
    pub limit: i64,
}

impl Default for ArticleQuery {
    fn default() -> Self {
        Self {
            filters: FilterSet::new(),
            sort: Sort::default(),
            cursor: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

fn select_articles() -> QueryBuilder<'static, sqlx::Sqlite> {
    QueryBuilder::new(format!(
        "SELECT {ARTICLE_COLUMNS} FROM articles a JOIN sources s ON s.id = a.source_id WHERE 1=1"
    ))
}

impl Database {
    // ========================================================================
    // Article Ingest
    // ========================================================================

    /// Insert one article (manual creation), returning its ID.
    ///
    /// A duplicate URL yields `StorageError::Conflict`; an unknown source
    /// yields `StorageError::NotFound`.
    pub async fn insert_article(
        &self,
        source_id: i64,
        article: &IncomingArticle,
    ) -> Result<i64, StorageError> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO articles
                (source_id, title, description, content, url, author, category,
                 published_at, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(source_id)
        .bind(&article.title)
        .bind(&article.description)
        .bind(&article.content)
        .bind(&article.url)
        .bind(&article.author)
        .bind(&article.category)
        .bind(article.published_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::classify(e, "article"))?;

        Ok(row.0)
    }

    /// Upsert provider articles for a source.
    ///
    /// Two phases per chunk: `INSERT .. ON CONFLICT(url) DO NOTHING RETURNING id`
    /// collects the IDs of new rows, then an `UPDATE` refreshes title and body
    /// text of rows this source already owns. AI fields, view counts and
    /// processing status are never touched; `fetched_at` keeps "first seen".
    /// Batch size of 50 keeps us well under SQLite's 999 parameter limit.
    pub async fn upsert_articles(
        &self,
        source_id: i64,
        articles: &[IncomingArticle],
    ) -> Result<UpsertOutcome> {
        // Providers occasionally repeat a story inside one response
        let mut seen = HashSet::new();
        let unique: Vec<&IncomingArticle> = articles
            .iter()
            .filter(|a| seen.insert(a.url.as_str()))
            .collect();
        if unique.is_empty() {
            return Ok(UpsertOutcome::default());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut outcome = UpsertOutcome::default();

        const BATCH_SIZE: usize = 50;
        for chunk in unique.chunks(BATCH_SIZE) {
            let mut insert_builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO articles (source_id, title, description, content, url, author, \
                 category, published_at, fetched_at) ",
            );
            insert_builder.push_values(chunk, |mut b, article| {
                b.push_bind(source_id)
                    .push_bind(&article.title)
                    .push_bind(&article.description)
                    .push_bind(&article.content)
                    .push_bind(&article.url)
                    .push_bind(&article.author)
                    .push_bind(&article.category)
                    .push_bind(article.published_at)
                    .push_bind(now);
            });
            insert_builder.push(" ON CONFLICT(url) DO NOTHING RETURNING id");

            let inserted: Vec<(i64,)> = insert_builder
                .build_query_as()
                .fetch_all(&mut *tx)
                .await?;

            // CASE without ELSE yields NULL for other rows; COALESCE keeps the old value
            let mut update_builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("UPDATE articles SET ");
            let fields: [(&str, fn(&IncomingArticle) -> Option<&str>); 4] = [
                ("title", |a| Some(a.title.as_str())),
                ("description", |a| a.description.as_deref()),
                ("content", |a| a.content.as_deref()),
                ("author", |a| a.author.as_deref()),
            ];
            for (i, (column, value_of)) in fields.iter().enumerate() {
                if i > 0 {
                    update_builder.push(", ");
                }
                update_builder.push(*column);
                update_builder.push(" = COALESCE(CASE url ");
                for article in chunk {
                    update_builder.push("WHEN ");
                    update_builder.push_bind(article.url.clone());
                    update_builder.push(" THEN ");
                    update_builder.push_bind(value_of(article).map(str::to_owned));
                    update_builder.push(" ");
                }
                update_builder.push("END, ");
                update_builder.push(*column);
                update_builder.push(")");
            }
            update_builder.push(" WHERE source_id = ");
            update_builder.push_bind(source_id);
            update_builder.push(" AND url IN (");
            let mut separated = update_builder.separated(", ");
            for article in chunk {
                separated.push_bind(article.url.clone());
            }
            separated.push_unseparated(")");

            let touched = update_builder.build().execute(&mut *tx).await?.rows_affected();

            outcome.updated += (touched as usize).saturating_sub(inserted.len());
            outcome
                .inserted_ids
                .extend(inserted.into_iter().map(|(id,)| id));
        }

        tx.commit().await?;
        tracing::debug!(
            source_id,
            inserted = outcome.inserted_ids.len(),
            updated = outcome.updated,
            "Upserted articles"
        );
        Ok(outcome)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    pub async fn get_article(&self, article_id: i64) -> Result<Option<Article>> {
        let mut builder = select_articles();
        builder.push(" AND a.id = ");
        builder.push_bind(article_id);

        let row: Option<ArticleDbRow> = builder
            .build_query_as()
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ArticleDbRow::into_article))
    }

    /// One page of articles matching `query`.
    ///
    /// Fetches `limit + 1` rows; the extra row only signals that a next page
    /// exists and is not returned.
    pub async fn query_articles(&self, query: &ArticleQuery) -> Result<Page<Article>> {
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);

        let mut builder = select_articles();
        query.filters.push_sql(&mut builder);
        if let Some(cursor) = &query.cursor {
            query.sort.push_after(&mut builder, cursor);
        }
        query.sort.push_order_by(&mut builder);
        builder.push(" LIMIT ");
        builder.push_bind(limit + 1);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        let articles = rows.into_iter().map(ArticleDbRow::into_article).collect();
        Ok(paginate(articles, limit, &query.sort))
    }

    /// Oldest-first articles in a processing state, for the analysis backlog.
    pub async fn get_articles_by_status(
        &self,
        status: ProcessingStatus,
        limit: i64,
    ) -> Result<Vec<Article>> {
        let limit = limit.clamp(1, MAX_STATUS_SCAN);
        let mut builder = select_articles();
        builder.push(" AND a.processing_status = ");
        builder.push_bind(status.as_str());
        builder.push(" ORDER BY a.id ASC LIMIT ");
        builder.push_bind(limit);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Newest articles as similarity candidates, optionally excluding one.
    pub async fn recent_articles_for_similarity(
        &self,
        limit: i64,
        exclude_id: Option<i64>,
    ) -> Result<Vec<Article>> {
        let limit = limit.clamp(1, MAX_SIMILARITY_CANDIDATES);
        let mut builder = select_articles();
        if let Some(id) = exclude_id {
            builder.push(" AND a.id != ");
            builder.push_bind(id);
        }
        builder.push(" ORDER BY COALESCE(a.published_at, a.fetched_at) DESC, a.id DESC LIMIT ");
        builder.push_bind(limit);

        let rows: Vec<ArticleDbRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Delete an article; bookmarks, views and analyses cascade.
    pub async fn delete_article(&self, article_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM articles WHERE id = ?")
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_processing_status(
        &self,
        article_id: i64,
        status: ProcessingStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE articles SET processing_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return articles left in `processing` by an interrupted run to `pending`.
    ///
    /// Only safe while no analyzer is running, i.e. before workers start.
    pub async fn reset_interrupted_analyses(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE articles SET processing_status = 'pending' WHERE processing_status = 'processing'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Write enrichment results and mark the article `completed`.
    ///
    /// `None` fields leave the stored value unchanged, so a partial analysis
    /// never erases an earlier one.
    pub async fn apply_analysis(&self, article_id: i64, update: &AnalysisUpdate) -> Result<bool> {
        let topics_json = update
            .topics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE articles SET
                sentiment_score = COALESCE(?, sentiment_score),
                sentiment_label = COALESCE(?, sentiment_label),
                bias_score = COALESCE(?, bias_score),
                relevance_score = COALESCE(?, relevance_score),
                topics = COALESCE(?, topics),
                category = COALESCE(?, category),
                summary = COALESCE(?, summary),
                processing_status = 'completed'
            WHERE id = ?
        "#,
        )
        .bind(update.sentiment_score)
        .bind(&update.sentiment_label)
        .bind(update.bias_score)
        .bind(update.relevance_score)
        .bind(topics_json)
        .bind(&update.category)
        .bind(&update.summary)
        .bind(article_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Count a view, returning `false` when the article does not exist.
    pub async fn record_view(&self, article_id: i64, user_id: Option<i64>) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE articles SET view_count = view_count + 1 WHERE id = ?")
            .bind(article_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO article_views (article_id, user_id, viewed_at) VALUES (?, ?, ?)")
            .bind(article_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::ArticleQuery;
    use crate::search::cursor::{Cursor, Sort};
    use crate::search::filter::FilterSet;
    use crate::storage::{
        AnalysisUpdate, Database, IncomingArticle, ProcessingStatus, SourceRef, StorageError,
    };

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    async fn test_source(db: &Database, key: &str) -> i64 {
        db.upsert_source(&SourceRef {
            key: key.to_string(),
            name: format!("Source {key}"),
            provider: "manual".to_string(),
            url: None,
        })
        .await
        .unwrap()
    }

    fn test_article(slug: &str, title: &str, published: i64) -> IncomingArticle {
        IncomingArticle {
            title: title.to_string(),
            description: Some(format!("About {title}")),
            content: None,
            url: format!("https://example.com/{slug}"),
            author: None,
            category: Some("technology".to_string()),
            published_at: Some(published),
        }
    }

    #[tokio::test]
    async fn test_upsert_articles_insert() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;

        let outcome = db
            .upsert_articles(
                source,
                &[test_article("1", "One", 100), test_article("2", "Two", 200)],
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted_ids.len(), 2);
        assert_eq!(outcome.updated, 0);
    }

    #[tokio::test]
    async fn test_upsert_articles_refreshes_text_and_keeps_analysis() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db
            .upsert_articles(source, &[test_article("1", "Original", 100)])
            .await
            .unwrap();
        let id = outcome.inserted_ids[0];

        db.apply_analysis(
            id,
            &AnalysisUpdate {
                sentiment_score: Some(0.4),
                topics: Some(vec!["ai".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        db.record_view(id, None).await.unwrap();

        let mut refreshed = test_article("1", "Corrected headline", 100);
        refreshed.description = None;
        let outcome = db.upsert_articles(source, &[refreshed]).await.unwrap();
        assert!(outcome.inserted_ids.is_empty());
        assert_eq!(outcome.updated, 1);

        let article = db.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.title, "Corrected headline");
        // NULL from the provider keeps the stored description
        assert_eq!(article.description.as_deref(), Some("About Original"));
        assert_eq!(article.sentiment_score, Some(0.4));
        assert_eq!(article.topics, vec!["ai".to_string()]);
        assert_eq!(article.view_count, 1);
        assert_eq!(article.processing_status, ProcessingStatus::Completed);
    }

    #[tokio::test]
    async fn test_upsert_articles_dedupes_within_batch() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db
            .upsert_articles(
                source,
                &[test_article("1", "One", 100), test_article("1", "One again", 100)],
            )
            .await
            .unwrap();
        assert_eq!(outcome.inserted_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_articles_does_not_steal_other_sources_rows() {
        let db = test_db().await;
        let a = test_source(&db, "a").await;
        let b = test_source(&db, "b").await;
        db.upsert_articles(a, &[test_article("shared", "From A", 100)])
            .await
            .unwrap();

        let outcome = db
            .upsert_articles(b, &[test_article("shared", "From B", 100)])
            .await
            .unwrap();
        assert!(outcome.inserted_ids.is_empty());
        assert_eq!(outcome.updated, 0);
    }

    #[tokio::test]
    async fn test_upsert_articles_empty_batch() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db.upsert_articles(source, &[]).await.unwrap();
        assert!(outcome.inserted_ids.is_empty());
    }

    #[tokio::test]
    async fn test_insert_article_conflict_on_duplicate_url() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        db.insert_article(source, &test_article("1", "One", 100))
            .await
            .unwrap();
        let err = db
            .insert_article(source, &test_article("1", "Dup", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict("article")));
    }

    #[tokio::test]
    async fn test_insert_article_unknown_source() {
        let db = test_db().await;
        let err = db
            .insert_article(999, &test_article("1", "One", 100))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_articles_pages_without_overlap() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let batch: Vec<_> = (0..7)
            .map(|i| test_article(&i.to_string(), &format!("Story {i}"), 1000 + (i % 3)))
            .collect();
        db.upsert_articles(source, &batch).await.unwrap();

        let mut seen = Vec::new();
        let mut query = ArticleQuery {
            limit: 3,
            ..Default::default()
        };
        loop {
            let page = db.query_articles(&query).await.unwrap();
            seen.extend(page.items.iter().map(|a| a.id));
            match page.next_cursor {
                Some(token) => {
                    assert!(page.has_more);
                    query.cursor = Some(Cursor::decode_for(&token, &query.sort).unwrap());
                }
                None => break,
            }
        }

        assert_eq!(seen.len(), 7);
        let mut unique = seen.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 7);
    }

    #[tokio::test]
    async fn test_query_articles_sort_and_filter() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db
            .upsert_articles(
                source,
                &[
                    test_article("1", "Old", 100),
                    test_article("2", "New", 300),
                    test_article("3", "Mid", 200),
                ],
            )
            .await
            .unwrap();
        db.record_view(outcome.inserted_ids[2], None).await.unwrap();

        let page = db.query_articles(&ArticleQuery::default()).await.unwrap();
        let titles: Vec<_> = page.items.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, ["New", "Mid", "Old"]);
        assert!(page.next_cursor.is_none());

        let query = ArticleQuery {
            sort: Sort::parse("-view_count").unwrap(),
            filters: FilterSet::from_pairs([("published_at__gte", "150")], 0).unwrap(),
            ..Default::default()
        };
        let page = db.query_articles(&query).await.unwrap();
        let titles: Vec<_> = page.items.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, ["Mid", "New"]);
    }

    #[tokio::test]
    async fn test_topic_filter_matches_json_membership() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db
            .upsert_articles(
                source,
                &[test_article("1", "One", 100), test_article("2", "Two", 200)],
            )
            .await
            .unwrap();
        db.apply_analysis(
            outcome.inserted_ids[0],
            &AnalysisUpdate {
                topics: Some(vec!["climate".into(), "policy".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let query = ArticleQuery {
            filters: FilterSet::from_pairs([("topic", "Climate")], 0).unwrap(),
            ..Default::default()
        };
        let page = db.query_articles(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "One");

        let query = ArticleQuery {
            filters: FilterSet::from_pairs([("topic__ne", "climate")], 0).unwrap(),
            ..Default::default()
        };
        let page = db.query_articles(&query).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].title, "Two");
    }

    #[tokio::test]
    async fn test_processing_status_roundtrip() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db
            .upsert_articles(source, &[test_article("1", "One", 100), test_article("2", "Two", 100)])
            .await
            .unwrap();

        let pending = db
            .get_articles_by_status(ProcessingStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        db.set_processing_status(outcome.inserted_ids[0], ProcessingStatus::Failed)
            .await
            .unwrap();
        let failed = db
            .get_articles_by_status(ProcessingStatus::Failed, 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, outcome.inserted_ids[0]);
    }

    #[tokio::test]
    async fn test_reset_interrupted_analyses() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let ids = db
            .upsert_articles(
                source,
                &[test_article("1", "One", 100), test_article("2", "Two", 200)],
            )
            .await
            .unwrap()
            .inserted_ids;
        db.set_processing_status(ids[0], ProcessingStatus::Processing)
            .await
            .unwrap();
        db.set_processing_status(ids[1], ProcessingStatus::Failed)
            .await
            .unwrap();

        assert_eq!(db.reset_interrupted_analyses().await.unwrap(), 1);
        let pending = db
            .get_articles_by_status(ProcessingStatus::Pending, 10)
            .await
            .unwrap();
        assert_eq!(pending.iter().map(|a| a.id).collect::<Vec<_>>(), vec![ids[0]]);
        let failed = db.get_article(ids[1]).await.unwrap().unwrap();
        assert_eq!(failed.processing_status, ProcessingStatus::Failed);
    }

    #[tokio::test]
    async fn test_record_view_and_delete() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let id = db
            .insert_article(source, &test_article("1", "One", 100))
            .await
            .unwrap();

        assert!(db.record_view(id, None).await.unwrap());
        assert!(db.record_view(id, None).await.unwrap());
        assert_eq!(db.get_article(id).await.unwrap().unwrap().view_count, 2);

        assert!(db.delete_article(id).await.unwrap());
        assert!(!db.delete_article(id).await.unwrap());
        assert!(!db.record_view(id, None).await.unwrap());
        assert!(db.get_article(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_similarity_candidates_exclude_target() {
        let db = test_db().await;
        let source = test_source(&db, "a").await;
        let outcome = db
            .upsert_articles(
                source,
                &[test_article("1", "One", 100), test_article("2", "Two", 200)],
            )
            .await
            .unwrap();

        let candidates = db
            .recent_articles_for_similarity(50, Some(outcome.inserted_ids[0]))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].title, "Two");
    }
}
