use anyhow::Result;

use super::schema::Database;
use super::types::{Bookmark, StorageError};

/// Bookmarks per user listing cap
const MAX_BOOKMARKS: i64 = 1000;

impl Database {
    // ========================================================================
    // Bookmarks
    // ========================================================================

    /// Bookmark an article. Duplicates yield `StorageError::Conflict`,
    /// unknown articles `StorageError::NotFound`.
    pub async fn add_bookmark(
        &self,
        user_id: i64,
        article_id: i64,
        note: Option<&str>,
    ) -> Result<Bookmark, StorageError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let row: (i64,) = sqlx::query_as(
            "INSERT INTO user_bookmarks (user_id, article_id, note, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(article_id)
        .bind(note)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StorageError::classify(e, "bookmark"))?;

        let bookmark = sqlx::query_as::<_, Bookmark>(
            r#"
            SELECT b.id, b.article_id, a.title AS article_title, a.url AS article_url,
                   b.note, b.created_at
            FROM user_bookmarks b JOIN articles a ON a.id = b.article_id
            WHERE b.id = ?
        "#,
        )
        .bind(row.0)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(bookmark)
    }

    pub async fn remove_bookmark(&self, user_id: i64, article_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_bookmarks WHERE user_id = ? AND article_id = ?")
            .bind(user_id)
            .bind(article_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Newest bookmarks first, with article title and URL.
    pub async fn list_bookmarks(&self, user_id: i64) -> Result<Vec<Bookmark>> {
        let rows = sqlx::query_as::<_, Bookmark>(
            r#"
            SELECT b.id, b.article_id, a.title AS article_title, a.url AS article_url,
                   b.note, b.created_at
            FROM user_bookmarks b JOIN articles a ON a.id = b.article_id
            WHERE b.user_id = ?
            ORDER BY b.created_at DESC, b.id DESC
            LIMIT ?
        "#,
        )
        .bind(user_id)
        .bind(MAX_BOOKMARKS)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, IncomingArticle, NewUser, SourceRef, StorageError};

    async fn fixture() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user = db
            .create_user(&NewUser {
                email: "a@example.com",
                username: "alice",
                password_hash: "h",
                password_salt: "s",
            })
            .await
            .unwrap();
        let source = db
            .upsert_source(&SourceRef {
                key: "manual".into(),
                name: "Manual".into(),
                provider: "manual".into(),
                url: None,
            })
            .await
            .unwrap();
        let article = db
            .insert_article(
                source,
                &IncomingArticle {
                    title: "Saved story".into(),
                    description: None,
                    content: None,
                    url: "https://example.com/saved".into(),
                    author: None,
                    category: None,
                    published_at: None,
                },
            )
            .await
            .unwrap();
        (db, user.id, article)
    }

    #[tokio::test]
    async fn test_add_list_remove() {
        let (db, user, article) = fixture().await;
        let bookmark = db.add_bookmark(user, article, Some("read later")).await.unwrap();
        assert_eq!(bookmark.article_title, "Saved story");
        assert_eq!(bookmark.note.as_deref(), Some("read later"));

        let list = db.list_bookmarks(user).await.unwrap();
        assert_eq!(list.len(), 1);

        assert!(db.remove_bookmark(user, article).await.unwrap());
        assert!(!db.remove_bookmark(user, article).await.unwrap());
        assert!(db.list_bookmarks(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_bookmark_conflicts() {
        let (db, user, article) = fixture().await;
        db.add_bookmark(user, article, None).await.unwrap();
        let err = db.add_bookmark(user, article, None).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict("bookmark")));
    }

    #[tokio::test]
    async fn test_bookmark_unknown_article() {
        let (db, user, _) = fixture().await;
        let err = db.add_bookmark(user, 999, None).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bookmarks_cascade_with_article() {
        let (db, user, article) = fixture().await;
        db.add_bookmark(user, article, None).await.unwrap();
        db.delete_article(article).await.unwrap();
        assert!(db.list_bookmarks(user).await.unwrap().is_empty());
    }
}
