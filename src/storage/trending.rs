use anyhow::Result;

use super::schema::Database;
use super::types::{TopicSample, TrendingTopic};

impl Database {
    // ========================================================================
    // Trending Topics
    // ========================================================================

    /// One sample per distinct (article, topic) pair published since `since`.
    ///
    /// Articles without a publication time count by `fetched_at`. Non-string
    /// entries in the topics array are ignored.
    pub async fn trending_inputs(&self, since: i64) -> Result<Vec<TopicSample>> {
        let rows = sqlx::query_as::<_, TopicSample>(
            r#"
            SELECT DISTINCT a.id AS article_id, a.source_id, a.sentiment_score,
                   CAST(j.value AS TEXT) AS topic
            FROM articles a, json_each(a.topics) j
            WHERE COALESCE(a.published_at, a.fetched_at) >= ?
              AND j.type = 'text'
        "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Atomically replace the stored ranking for one window size.
    pub async fn replace_trending_topics(
        &self,
        window_hours: i64,
        topics: &[TrendingTopic],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM trending_topics WHERE window_hours = ?")
            .bind(window_hours)
            .execute(&mut *tx)
            .await?;

        for topic in topics {
            sqlx::query(
                r#"
                INSERT INTO trending_topics
                    (topic, article_count, source_count, avg_sentiment, score,
                     window_hours, computed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(&topic.topic)
            .bind(topic.article_count)
            .bind(topic.source_count)
            .bind(topic.avg_sentiment)
            .bind(topic.score)
            .bind(window_hours)
            .bind(topic.computed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_trending_topics(
        &self,
        window_hours: i64,
        limit: i64,
    ) -> Result<Vec<TrendingTopic>> {
        let rows = sqlx::query_as::<_, TrendingTopic>(
            r#"
            SELECT topic, article_count, source_count, avg_sentiment, score,
                   window_hours, computed_at
            FROM trending_topics
            WHERE window_hours = ?
            ORDER BY score DESC, article_count DESC, topic ASC
            LIMIT ?
        "#,
        )
        .bind(window_hours)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
