use anyhow::Result;

use super::schema::Database;
use super::types::UserPreferences;

#[derive(sqlx::FromRow)]
struct PreferencesRow {
    preferred_categories: String,
    preferred_sources: String,
    excluded_topics: String,
    language: String,
    articles_per_page: i64,
    email_digest: bool,
}

fn json_list<T: serde::de::DeserializeOwned>(raw: &str, user_id: i64) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(user_id, error = %e, "Malformed preference list, using empty");
        Vec::new()
    })
}

impl Database {
    // ========================================================================
    // User Preferences Operations
    // ========================================================================

    /// Preferences for a user, or the defaults when none were saved.
    pub async fn get_preferences(&self, user_id: i64) -> Result<UserPreferences> {
        let row: Option<PreferencesRow> = sqlx::query_as(
            r#"
            SELECT preferred_categories, preferred_sources, excluded_topics,
                   language, articles_per_page, email_digest
            FROM user_preferences WHERE user_id = ?
        "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => UserPreferences {
                preferred_categories: json_list(&row.preferred_categories, user_id),
                preferred_sources: json_list(&row.preferred_sources, user_id),
                excluded_topics: json_list(&row.excluded_topics, user_id),
                language: row.language,
                articles_per_page: row.articles_per_page,
                email_digest: row.email_digest,
            },
            None => UserPreferences::default(),
        })
    }

    /// Replace a user's preferences (UPSERT).
    pub async fn set_preferences(&self, user_id: i64, prefs: &UserPreferences) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO user_preferences
                (user_id, preferred_categories, preferred_sources, excluded_topics,
                 language, articles_per_page, email_digest, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                preferred_categories = excluded.preferred_categories,
                preferred_sources = excluded.preferred_sources,
                excluded_topics = excluded.excluded_topics,
                language = excluded.language,
                articles_per_page = excluded.articles_per_page,
                email_digest = excluded.email_digest,
                updated_at = excluded.updated_at
        "#,
        )
        .bind(user_id)
        .bind(serde_json::to_string(&prefs.preferred_categories)?)
        .bind(serde_json::to_string(&prefs.preferred_sources)?)
        .bind(serde_json::to_string(&prefs.excluded_topics)?)
        .bind(&prefs.language)
        .bind(prefs.articles_per_page)
        .bind(prefs.email_digest)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
