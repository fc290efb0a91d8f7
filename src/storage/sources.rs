use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, Source, SourceRef};

const SOURCE_COLUMNS: &str =
    "id, key, name, provider, url, last_fetched, error, consecutive_failures";

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Insert a source or refresh its display name, returning its ID.
    ///
    /// Keyed on `key`; fetch state and the failure counter are preserved.
    pub async fn upsert_source(&self, source: &SourceRef) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (key, name, provider, url, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                name = excluded.name,
                url = COALESCE(excluded.url, sources.url)
            RETURNING id
        "#,
        )
        .bind(&source.key)
        .bind(&source.name)
        .bind(&source.provider)
        .bind(&source.url)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    /// All sources ordered by name
    pub async fn get_sources(&self) -> Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(source)
    }

    pub async fn get_source_by_key(&self, key: &str) -> Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources WHERE key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(source)
    }

    /// Set or clear the error status for a source and stamp `last_fetched`
    pub async fn set_source_error(&self, source_id: i64, error: Option<&str>) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE sources SET error = ?, last_fetched = ? WHERE id = ?")
            .bind(error)
            .bind(now)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Batch-update error statuses for multiple sources in one statement.
    pub async fn batch_set_source_errors(&self, updates: &[(i64, Option<String>)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        // UPDATE sources SET error = CASE id WHEN 1 THEN 'e' WHEN 2 THEN NULL END
        // WHERE id IN (1, 2)
        let now = chrono::Utc::now().timestamp();
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE sources SET last_fetched = ");
        builder.push_bind(now);
        builder.push(", error = CASE id ");

        for (source_id, error) in updates {
            builder.push("WHEN ");
            builder.push_bind(*source_id);
            builder.push(" THEN ");
            builder.push_bind(error.clone());
            builder.push(" ");
        }

        builder.push("END WHERE id IN (");
        let mut separated = builder.separated(", ");
        for (source_id, _) in updates {
            separated.push_bind(*source_id);
        }
        separated.push_unseparated(")");

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    // ========================================================================
    // Circuit Breaker
    // ========================================================================

    /// Consecutive failures after which scheduled fetches skip a source.
    pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 5;

    /// Increment the consecutive failure counter, returning the new value.
    pub async fn increment_source_failures(&self, source_id: i64) -> Result<i64, DatabaseError> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE sources SET consecutive_failures = consecutive_failures + 1
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Reset the failure counter after a successful fetch.
    pub async fn reset_source_failures(&self, source_id: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sources SET consecutive_failures = 0, error = NULL WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
