//! Periodic producers for the task queue.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use super::queue::{TaskPayload, TaskQueue};
use crate::config::WorkerConfig;
use crate::storage::Database;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(3_600);

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    /// `None` disables scheduled fetches
    pub fetch_every: Option<Duration>,
    pub trending_every: Option<Duration>,
    pub purge_every: Duration,
}

impl ScheduleSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        let minutes = |m: u64| (m > 0).then(|| Duration::from_secs(m * 60));
        Self {
            fetch_every: minutes(config.fetch_interval_minutes),
            trending_every: minutes(config.trending_interval_minutes),
            purge_every: SESSION_PURGE_INTERVAL,
        }
    }
}

fn interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn enqueue(queue: &TaskQueue, payload: TaskPayload) {
    match queue.submit_unique(&payload).await {
        Ok(Some(task)) => tracing::info!(task_id = task.id, kind = %task.kind, "Scheduled task queued"),
        Ok(None) => {}
        Err(e) => tracing::warn!(kind = payload.kind().as_str(), error = %e, "Failed to schedule task"),
    }
}

/// Queue fetch and trending tasks on their intervals and purge expired
/// sessions, until `shutdown` flips to `true` or its sender is dropped.
///
/// Every interval fires once immediately at startup. A kind that already
/// has an open task is not queued again.
pub fn spawn_scheduler(
    db: Database,
    queue: TaskQueue,
    settings: ScheduleSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut fetch = settings.fetch_every.map(interval);
        let mut trending = settings.trending_every.map(interval);
        let mut purge = interval(settings.purge_every);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick(&mut fetch) => {
                    enqueue(&queue, TaskPayload::FetchNews { query: None, force: false }).await;
                }
                _ = tick(&mut trending) => {
                    enqueue(&queue, TaskPayload::ComputeTrending { window_hours: None }).await;
                }
                _ = purge.tick() => {
                    match db.purge_expired_sessions().await {
                        Ok(0) => {}
                        Ok(count) => tracing::info!(count, "Purged expired sessions"),
                        Err(e) => tracing::warn!(error = %e, "Failed to purge sessions"),
                    }
                }
            }
        }
        tracing::debug!("Scheduler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::queue::RetryPolicy;

    #[test]
    fn test_zero_minutes_disables() {
        let config = WorkerConfig {
            fetch_interval_minutes: 0,
            trending_interval_minutes: 5,
            ..WorkerConfig::default()
        };
        let settings = ScheduleSettings::from_config(&config);
        assert!(settings.fetch_every.is_none());
        assert_eq!(settings.trending_every, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_first_tick_queues_once() {
        let db = Database::open(":memory:").await.unwrap();
        let queue = TaskQueue::new(db.clone(), RetryPolicy::default());
        let settings = ScheduleSettings {
            fetch_every: None,
            trending_every: Some(Duration::from_millis(20)),
            purge_every: Duration::from_secs(3_600),
        };
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduler(db.clone(), queue, settings, rx);

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop")
            .unwrap();

        let stats = db.task_stats().await.unwrap();
        // Repeated ticks are deduplicated while the first task is still queued
        assert_eq!(stats.queued, 1);
        assert!(!db.has_open_task("fetch_news").await.unwrap());
        assert!(db.has_open_task("compute_trending").await.unwrap());
    }
}
