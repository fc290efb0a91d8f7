use anyhow::Result;

use super::schema::Database;
use super::types::{TaskDbRow, TaskRecord, TaskStats, TaskStatus};

const TASK_COLUMNS: &str = "id, kind, payload, status, attempt, max_attempts, next_run_at, \
     last_error, created_at, updated_at, started_at, finished_at";

/// Stored error messages are cut to this many characters.
const MAX_ERROR_LEN: usize = 1000;

impl Database {
    // ========================================================================
    // Task Queue
    // ========================================================================

    pub async fn enqueue_task(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        max_attempts: i64,
        run_at: i64,
    ) -> Result<TaskRecord> {
        let now = chrono::Utc::now().timestamp();
        let row = sqlx::query_as::<_, TaskDbRow>(&format!(
            r#"
            INSERT INTO analysis_tasks
                (kind, payload, status, attempt, max_attempts, next_run_at, created_at, updated_at)
            VALUES (?, ?, 'queued', 0, ?, ?, ?, ?)
            RETURNING {TASK_COLUMNS}
        "#
        ))
        .bind(kind)
        .bind(serde_json::to_string(payload)?)
        .bind(max_attempts.max(1))
        .bind(run_at)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_record())
    }

    /// Claim the oldest due task, marking it `running`.
    ///
    /// The select and the status change are one statement, so concurrent
    /// workers can never claim the same row.
    pub async fn claim_next_task(&self, now: i64) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskDbRow>(&format!(
            r#"
            UPDATE analysis_tasks
            SET status = 'running', started_at = ?1, updated_at = ?1, finished_at = NULL
            WHERE id = (
                SELECT id FROM analysis_tasks
                WHERE status IN ('queued', 'failed') AND next_run_at <= ?1
                ORDER BY next_run_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {TASK_COLUMNS}
        "#
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TaskDbRow::into_record))
    }

    pub async fn complete_task(&self, task_id: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE analysis_tasks SET status = 'succeeded', last_error = NULL,
             updated_at = ?1, finished_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With `retry_at` the task returns to the queue as `failed` and becomes
    /// claimable again at that time; without it the task is `dead`.
    pub async fn fail_task(
        &self,
        task_id: i64,
        error: &str,
        retry_at: Option<i64>,
    ) -> Result<TaskStatus> {
        let now = chrono::Utc::now().timestamp();
        let error = crate::util::truncate_chars(error, MAX_ERROR_LEN);
        let status = if retry_at.is_some() {
            TaskStatus::Failed
        } else {
            TaskStatus::Dead
        };

        sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = ?1, attempt = attempt + 1, last_error = ?2,
                next_run_at = COALESCE(?3, next_run_at), updated_at = ?4,
                finished_at = CASE WHEN ?3 IS NULL THEN ?4 ELSE NULL END
            WHERE id = ?5
        "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(retry_at)
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(status)
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskDbRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM analysis_tasks WHERE id = ?"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TaskDbRow::into_record))
    }

    /// Whether a task of this kind is waiting or running.
    pub async fn has_open_task(&self, kind: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM analysis_tasks
             WHERE kind = ? AND status IN ('queued', 'running', 'failed'))",
        )
        .bind(kind)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 != 0)
    }

    pub async fn task_stats(&self) -> Result<TaskStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM analysis_tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = TaskStats::default();
        for (status, count) in rows {
            match TaskStatus::from_db(&status) {
                TaskStatus::Queued => stats.queued += count,
                TaskStatus::Running => stats.running += count,
                TaskStatus::Succeeded => stats.succeeded += count,
                TaskStatus::Failed => stats.failed += count,
                TaskStatus::Dead => stats.dead += count,
            }
        }
        Ok(stats)
    }

    /// Return `running` tasks started before `started_before` to the queue.
    ///
    /// Recovers work orphaned by a crash; the attempt counter is unchanged.
    pub async fn requeue_stale(&self, started_before: i64) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE analysis_tasks SET status = 'queued', next_run_at = ?1, updated_at = ?1
             WHERE status = 'running' AND started_at < ?2",
        )
        .bind(now)
        .bind(started_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(count = result.rows_affected(), "Requeued stale tasks");
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::storage::{Database, TaskStatus};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_claim_in_order() {
        let db = test_db().await;
        let first = db.enqueue_task("fetch_news", &json!({}), 3, 100).await.unwrap();
        let second = db.enqueue_task("compute_trending", &json!({}), 3, 100).await.unwrap();
        db.enqueue_task("later", &json!({}), 3, 500).await.unwrap();

        assert_eq!(first.status, TaskStatus::Queued);
        let claimed = db.claim_next_task(200).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.started_at, Some(200));

        let claimed = db.claim_next_task(200).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        // Third is not due yet
        assert!(db.claim_next_task(200).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_task_never_claimed_twice() {
        let db = test_db().await;
        db.enqueue_task("fetch_news", &json!({}), 3, 0).await.unwrap();
        assert!(db.claim_next_task(10).await.unwrap().is_some());
        assert!(db.claim_next_task(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_then_retry_then_dead() {
        let db = test_db().await;
        let task = db
            .enqueue_task("analyze_article", &json!({"article_id": 1}), 2, 0)
            .await
            .unwrap();

        db.claim_next_task(10).await.unwrap().unwrap();
        let status = db.fail_task(task.id, "timeout", Some(70)).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.next_run_at, 70);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));

        assert!(db.claim_next_task(60).await.unwrap().is_none());
        let retried = db.claim_next_task(70).await.unwrap().unwrap();
        assert_eq!(retried.id, task.id);

        let status = db.fail_task(task.id, "timeout again", None).await.unwrap();
        assert_eq!(status, TaskStatus::Dead);
        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Dead);
        assert_eq!(stored.attempt, 2);
        assert!(stored.finished_at.is_some());
        assert!(db.claim_next_task(i64::MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_and_stats() {
        let db = test_db().await;
        let a = db.enqueue_task("fetch_news", &json!({}), 3, 0).await.unwrap();
        db.enqueue_task("fetch_news", &json!({}), 3, 0).await.unwrap();

        db.claim_next_task(1).await.unwrap();
        db.complete_task(a.id).await.unwrap();

        let stats = db.task_stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.running, 0);
        assert!(db.has_open_task("fetch_news").await.unwrap());
        assert!(!db.has_open_task("compute_trending").await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let db = test_db().await;
        let task = db.enqueue_task("fetch_news", &json!({}), 3, 0).await.unwrap();
        db.claim_next_task(100).await.unwrap();

        assert_eq!(db.requeue_stale(50).await.unwrap(), 0);
        assert_eq!(db.requeue_stale(101).await.unwrap(), 1);

        let stored = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.attempt, 0);
    }
}
