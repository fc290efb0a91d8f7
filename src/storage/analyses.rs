use anyhow::Result;

use super::schema::Database;
use super::types::{ArticleAnalysis, NewAnalysis};

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: i64,
    article_id: i64,
    analysis_type: String,
    result: String,
    model: String,
    input_tokens: i64,
    output_tokens: i64,
    cost_usd: f64,
    latency_ms: i64,
    created_at: i64,
}

impl AnalysisRow {
    fn into_analysis(self) -> ArticleAnalysis {
        ArticleAnalysis {
            id: self.id,
            article_id: self.article_id,
            analysis_type: self.analysis_type,
            result: serde_json::from_str(&self.result).unwrap_or(serde_json::Value::Null),
            model: self.model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cost_usd: self.cost_usd,
            latency_ms: self.latency_ms,
            created_at: self.created_at,
        }
    }
}

impl Database {
    // ========================================================================
    // Article Analyses
    // ========================================================================

    pub async fn insert_analysis(&self, analysis: &NewAnalysis) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO article_analyses
                (article_id, analysis_type, result, model, input_tokens, output_tokens,
                 cost_usd, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(analysis.article_id)
        .bind(&analysis.analysis_type)
        .bind(serde_json::to_string(&analysis.result)?)
        .bind(&analysis.model)
        .bind(analysis.input_tokens)
        .bind(analysis.output_tokens)
        .bind(analysis.cost_usd)
        .bind(analysis.latency_ms)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// All analysis calls for an article, newest first.
    pub async fn get_analyses_for_article(&self, article_id: i64) -> Result<Vec<ArticleAnalysis>> {
        let rows: Vec<AnalysisRow> = sqlx::query_as(
            r#"
            SELECT id, article_id, analysis_type, result, model, input_tokens,
                   output_tokens, cost_usd, latency_ms, created_at
            FROM article_analyses
            WHERE article_id = ?
            ORDER BY created_at DESC, id DESC
        "#,
        )
        .bind(article_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AnalysisRow::into_analysis).collect())
    }
}
