use anyhow::Result;

use super::schema::Database;
use super::types::{
    CategoryStat, OverviewStats, SentimentDistribution, SentimentPoint, SourceStat, ViewedArticle,
};

/// Longest lookback accepted by the time-series queries
pub const MAX_ANALYTICS_DAYS: i64 = 365;

impl Database {
    // ========================================================================
    // Analytics
    // ========================================================================

    /// Headline counters for the dashboard.
    pub async fn overview_stats(&self, now: i64) -> Result<OverviewStats> {
        let counts: (i64, i64, i64, i64, i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM articles),
                (SELECT COUNT(*) FROM sources),
                (SELECT COUNT(*) FROM users),
                (SELECT COUNT(*) FROM articles WHERE fetched_at >= ?),
                (SELECT COUNT(*) FROM articles WHERE processing_status = 'pending'),
                (SELECT COUNT(*) FROM articles WHERE processing_status = 'failed'),
                (SELECT AVG(sentiment_score) FROM articles WHERE sentiment_score IS NOT NULL)
        "#,
        )
        .bind(now - 86_400)
        .fetch_one(&self.pool)
        .await?;

        let labels: Vec<(Option<String>, i64)> = sqlx::query_as(
            "SELECT sentiment_label, COUNT(*) FROM articles GROUP BY sentiment_label",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut distribution = SentimentDistribution::default();
        for (label, count) in labels {
            match label.as_deref() {
                Some("positive") => distribution.positive += count,
                Some("neutral") => distribution.neutral += count,
                Some("negative") => distribution.negative += count,
                _ => distribution.unknown += count,
            }
        }

        Ok(OverviewStats {
            total_articles: counts.0,
            total_sources: counts.1,
            total_users: counts.2,
            articles_last_24h: counts.3,
            pending_analysis: counts.4,
            failed_analysis: counts.5,
            average_sentiment: counts.6,
            sentiment_distribution: distribution,
        })
    }

    /// Daily article count and mean sentiment over the last `days` UTC days.
    pub async fn sentiment_timeline(&self, days: i64, now: i64) -> Result<Vec<SentimentPoint>> {
        let days = days.clamp(1, MAX_ANALYTICS_DAYS);
        let since = now - days * 86_400;
        let rows = sqlx::query_as::<_, SentimentPoint>(
            r#"
            SELECT date(COALESCE(published_at, fetched_at), 'unixepoch') AS day,
                   COUNT(*) AS article_count,
                   AVG(sentiment_score) AS avg_sentiment
            FROM articles
            WHERE COALESCE(published_at, fetched_at) >= ?
            GROUP BY day
            ORDER BY day ASC
        "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Per-source volume and mean scores, busiest first.
    pub async fn source_breakdown(&self) -> Result<Vec<SourceStat>> {
        let rows = sqlx::query_as::<_, SourceStat>(
            r#"
            SELECT s.id AS source_id, s.name, s.provider,
                   COUNT(a.id) AS article_count,
                   AVG(a.sentiment_score) AS avg_sentiment,
                   AVG(a.bias_score) AS avg_bias
            FROM sources s
            LEFT JOIN articles a ON a.source_id = s.id
            GROUP BY s.id
            ORDER BY article_count DESC, s.name ASC
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn category_breakdown(&self) -> Result<Vec<CategoryStat>> {
        let rows = sqlx::query_as::<_, CategoryStat>(
            r#"
            SELECT COALESCE(category, 'uncategorized') AS category, COUNT(*) AS article_count
            FROM articles
            GROUP BY COALESCE(category, 'uncategorized')
            ORDER BY article_count DESC, category ASC
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Articles with the most recorded views in the last `days`.
    pub async fn most_viewed(&self, days: i64, limit: i64, now: i64) -> Result<Vec<ViewedArticle>> {
        let since = now - days.clamp(1, MAX_ANALYTICS_DAYS) * 86_400;
        let rows = sqlx::query_as::<_, ViewedArticle>(
            r#"
            SELECT v.article_id, a.title, COUNT(*) AS views
            FROM article_views v
            JOIN articles a ON a.id = v.article_id
            WHERE v.viewed_at >= ?
            GROUP BY v.article_id
            ORDER BY views DESC, v.article_id ASC
            LIMIT ?
        "#,
        )
        .bind(since)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;

        // Titles come from providers and skip the article row conversion
        Ok(rows
            .into_iter()
            .map(|mut row| {
                row.title = crate::util::strip_control_chars(&row.title).into_owned();
                row
            })
            .collect())
    }
}
