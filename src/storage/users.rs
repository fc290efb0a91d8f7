use anyhow::Result;

use super::schema::Database;
use super::types::{StorageError, User};

const USER_COLUMNS: &str =
    "id, email, username, password_hash, password_salt, is_active, created_at, last_login_at";

/// Fields for a new account; the password is already hashed.
#[derive(Debug, Clone)]
pub struct NewUser<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub password_hash: &'a str,
    pub password_salt: &'a str,
}

impl Database {
    // ========================================================================
    // Users
    // ========================================================================

    /// Create a user. Email is stored lowercase; a taken email or username
    /// yields `StorageError::Conflict`.
    pub async fn create_user(&self, new_user: &NewUser<'_>) -> Result<User, StorageError> {
        let now = chrono::Utc::now().timestamp();
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, username, password_hash, password_salt, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {USER_COLUMNS}
        "#
        ))
        .bind(new_user.email.trim().to_lowercase())
        .bind(new_user.username)
        .bind(new_user.password_hash)
        .bind(new_user.password_salt)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::classify(e, "user"))?;

        tracing::info!(user_id = user.id, "Created user");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = ?"
        ))
        .bind(email.trim().to_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn touch_login(&self, user_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE users SET last_login_at = ? WHERE id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Store a session keyed by the SHA-256 of its bearer token.
    pub async fn create_session(
        &self,
        token_hash: &str,
        user_id: i64,
        ttl_secs: i64,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now.saturating_add(ttl_secs);
        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(expires_at)
    }

    /// The active user owning an unexpired session, if any.
    pub async fn get_session_user(&self, token_hash: &str) -> Result<Option<User>> {
        let now = chrono::Utc::now().timestamp();
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT u.id, u.email, u.username, u.password_hash, u.password_salt,
                   u.is_active, u.created_at, u.last_login_at
            FROM sessions se
            JOIN users u ON u.id = se.user_id
            WHERE se.token_hash = ? AND se.expires_at > ? AND u.is_active = 1
        "#,
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            tracing::debug!(purged = result.rows_affected(), "Purged expired sessions");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::NewUser;
    use crate::storage::{Database, StorageError};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn new_user<'a>(email: &'a str, username: &'a str) -> NewUser<'a> {
        NewUser {
            email,
            username,
            password_hash: "hash",
            password_salt: "salt",
        }
    }

    #[tokio::test]
    async fn test_create_user_normalises_email() {
        let db = test_db().await;
        let user = db
            .create_user(&new_user(" Alice@Example.COM ", "alice"))
            .await
            .unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert!(user.is_active);
        assert!(user.last_login_at.is_none());

        let found = db.get_user_by_email("ALICE@example.com").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some(user.id));
    }

    #[tokio::test]
    async fn test_duplicate_email_or_username_conflicts() {
        let db = test_db().await;
        db.create_user(&new_user("a@example.com", "alice")).await.unwrap();

        let err = db
            .create_user(&new_user("a@example.com", "other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict("user")));

        let err = db
            .create_user(&new_user("b@example.com", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict("user")));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let db = test_db().await;
        let user = db.create_user(&new_user("a@example.com", "alice")).await.unwrap();

        db.create_session("tok", user.id, 3600).await.unwrap();
        let found = db.get_session_user("tok").await.unwrap();
        assert_eq!(found.map(|u| u.username), Some("alice".to_string()));

        assert!(db.delete_session("tok").await.unwrap());
        assert!(db.get_session_user("tok").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_sessions_rejected_and_purged() {
        let db = test_db().await;
        let user = db.create_user(&new_user("a@example.com", "alice")).await.unwrap();

        db.create_session("old", user.id, -10).await.unwrap();
        db.create_session("new", user.id, 3600).await.unwrap();
        assert!(db.get_session_user("old").await.unwrap().is_none());

        assert_eq!(db.purge_expired_sessions().await.unwrap(), 1);
        assert!(db.get_session_user("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_touch_login() {
        let db = test_db().await;
        let user = db.create_user(&new_user("a@example.com", "alice")).await.unwrap();
        db.touch_login(user.id).await.unwrap();
        let user = db.get_user(user.id).await.unwrap().unwrap();
        assert!(user.last_login_at.is_some());
    }
}
