//! Fetch every enabled provider and store the results.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;

use super::{provider_source, FetchRequest, NewsProvider, ProviderArticle};
use crate::storage::{Database, IncomingArticle, SourceRef};

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Bypass the circuit breaker (manual fetches)
    pub force: bool,
    pub max_concurrent: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_concurrent: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub sources: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    Fetched(IngestStats),
    /// Circuit breaker open
    Skipped { consecutive_failures: i64 },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderFetchResult {
    pub provider: String,
    #[serde(flatten)]
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub results: Vec<ProviderFetchResult>,
    /// IDs of rows created by this round, for follow-up analysis
    #[serde(skip)]
    pub new_article_ids: Vec<i64>,
}

impl FetchReport {
    pub fn inserted(&self) -> usize {
        self.new_article_ids.len()
    }

    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, FetchOutcome::Failed { .. }))
            .count()
    }
}

/// Fetch all providers concurrently and upsert what they return.
///
/// Each provider owns a source row (keyed by its name) that carries the
/// error status and circuit breaker; providers at or above
/// [`Database::CIRCUIT_BREAKER_THRESHOLD`] are skipped unless `force` is
/// set. Error statuses are batch-updated once all fetches complete.
pub async fn run_fetch(
    db: &Database,
    providers: &[Arc<dyn NewsProvider>],
    request: &FetchRequest,
    options: FetchOptions,
) -> FetchReport {
    if providers.is_empty() {
        tracing::info!("No news providers configured, nothing to fetch");
        return FetchReport::default();
    }

    // Futures are built up front; a lazy `.map` closure here fails the
    // higher-ranked `Send` check once the round is spawned on a worker.
    let fetches: Vec<_> = providers
        .iter()
        .cloned()
        .map(|provider| async move { fetch_provider(db, provider.as_ref(), request, options).await })
        .collect();
    let results: Vec<(ProviderFetchResult, Option<(i64, Option<String>)>, Vec<i64>)> =
        stream::iter(fetches)
            .buffer_unordered(options.max_concurrent.max(1))
            .collect()
            .await;

    let mut report = FetchReport::default();
    let mut status_updates = Vec::new();
    for (result, status, ids) in results {
        report.results.push(result);
        report.new_article_ids.extend(ids);
        status_updates.extend(status);
    }
    report.results.sort_by(|a, b| a.provider.cmp(&b.provider));

    if let Err(e) = db.batch_set_source_errors(&status_updates).await {
        tracing::warn!(error = %e, "Failed to batch update source error statuses");
    }

    tracing::info!(
        providers = providers.len(),
        inserted = report.inserted(),
        failures = report.failures(),
        "Fetch round complete"
    );
    report
}

async fn fetch_provider(
    db: &Database,
    provider: &dyn NewsProvider,
    request: &FetchRequest,
    options: FetchOptions,
) -> (ProviderFetchResult, Option<(i64, Option<String>)>, Vec<i64>) {
    let name = provider.name().to_string();
    let failed = |error: String| ProviderFetchResult {
        provider: name.clone(),
        outcome: FetchOutcome::Failed { error },
    };

    let source = match db.upsert_source(&provider_source(provider)).await {
        Ok(id) => db.get_source(id).await.ok().flatten(),
        Err(e) => {
            tracing::warn!(provider = %name, error = %e, "Failed to register provider source");
            None
        }
    };
    let Some(source) = source else {
        return (failed("provider source unavailable".to_string()), None, Vec::new());
    };

    if !options.force && source.consecutive_failures >= Database::CIRCUIT_BREAKER_THRESHOLD {
        tracing::info!(
            provider = %name,
            failures = source.consecutive_failures,
            threshold = Database::CIRCUIT_BREAKER_THRESHOLD,
            "Skipping provider due to consecutive failures (force a manual fetch to retry)"
        );
        let result = ProviderFetchResult {
            provider: name,
            outcome: FetchOutcome::Skipped {
                consecutive_failures: source.consecutive_failures,
            },
        };
        return (result, None, Vec::new());
    }

    let fetched = match provider.fetch(request).await {
        Ok(articles) => articles,
        Err(e) => {
            let error = e.to_string();
            match db.increment_source_failures(source.id).await {
                Ok(failures) if failures >= Database::CIRCUIT_BREAKER_THRESHOLD => {
                    tracing::info!(
                        provider = %name,
                        failures,
                        "Provider circuit breaker tripped - will be skipped until manual retry"
                    );
                }
                Ok(_) => {}
                Err(db_err) => {
                    tracing::warn!(provider = %name, error = %db_err, "Failed to increment provider failure count");
                }
            }
            tracing::warn!(provider = %name, error = %error, "Provider fetch failed");
            return (failed(error.clone()), Some((source.id, Some(error))), Vec::new());
        }
    };

    match store_articles(db, &fetched).await {
        Ok((stats, ids)) => {
            if let Err(e) = db.reset_source_failures(source.id).await {
                tracing::warn!(provider = %name, error = %e, "Failed to reset provider failure count");
            }
            tracing::info!(
                provider = %name,
                fetched = stats.fetched,
                inserted = stats.inserted,
                updated = stats.updated,
                "Provider fetch stored"
            );
            let result = ProviderFetchResult {
                provider: name,
                outcome: FetchOutcome::Fetched(stats),
            };
            (result, Some((source.id, None)), ids)
        }
        Err(e) => {
            let error = format!("Database error: {e}");
            tracing::warn!(provider = %name, error = %e, "Failed to store provider articles");
            (failed(error.clone()), Some((source.id, Some(error))), Vec::new())
        }
    }
}

/// Group articles by outlet, upsert each outlet and its articles.
async fn store_articles(
    db: &Database,
    fetched: &[ProviderArticle],
) -> anyhow::Result<(IngestStats, Vec<i64>)> {
    let mut by_source: BTreeMap<&str, (&SourceRef, Vec<IncomingArticle>)> = BTreeMap::new();
    for item in fetched {
        by_source
            .entry(item.source.key.as_str())
            .or_insert_with(|| (&item.source, Vec::new()))
            .1
            .push(item.article.clone());
    }

    let mut stats = IngestStats {
        fetched: fetched.len(),
        sources: by_source.len(),
        ..Default::default()
    };
    let mut ids = Vec::new();
    for (source, articles) in by_source.into_values() {
        let source_id = db.upsert_source(source).await?;
        let outcome = db.upsert_articles(source_id, &articles).await?;
        stats.inserted += outcome.inserted_ids.len();
        stats.updated += outcome.updated;
        ids.extend(outcome.inserted_ids);
    }
    Ok((stats, ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn item(source: &str, url: &str) -> ProviderArticle {
        ProviderArticle {
            source: SourceRef {
                key: source.to_string(),
                name: source.to_uppercase(),
                provider: "stub".to_string(),
                url: None,
            },
            article: IncomingArticle {
                title: format!("Story at {url}"),
                description: None,
                content: None,
                url: url.to_string(),
                author: None,
                category: None,
                published_at: None,
            },
        }
    }

    #[async_trait]
    impl NewsProvider for StubProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn display_name(&self) -> &'static str {
            self.name
        }

        async fn fetch(&self, _: &FetchRequest) -> Result<Vec<ProviderArticle>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::HttpStatus(500));
            }
            Ok(vec![
                item("stub:one", "https://one.example.com/a"),
                item("stub:one", "https://one.example.com/b"),
                item("stub:two", "https://two.example.com/a"),
            ])
        }
    }

    #[tokio::test]
    async fn test_run_fetch_stores_articles_per_outlet() {
        let db = Database::open(":memory:").await.unwrap();
        let providers: Vec<Arc<dyn NewsProvider>> = vec![StubProvider::new("stub", false)];

        let report = run_fetch(&db, &providers, &FetchRequest::default(), FetchOptions::default()).await;
        assert_eq!(report.inserted(), 3);
        match &report.results[0].outcome {
            FetchOutcome::Fetched(stats) => {
                assert_eq!(stats.fetched, 3);
                assert_eq!(stats.sources, 2);
            }
            other => panic!("Expected Fetched, got {other:?}"),
        }
        assert!(db.get_source_by_key("stub:two").await.unwrap().is_some());

        // Second round sees the same URLs
        let report = run_fetch(&db, &providers, &FetchRequest::default(), FetchOptions::default()).await;
        assert_eq!(report.inserted(), 0);
    }

    #[tokio::test]
    async fn test_failures_trip_circuit_breaker() {
        let db = Database::open(":memory:").await.unwrap();
        let stub = StubProvider::new("flaky", true);
        let providers: Vec<Arc<dyn NewsProvider>> = vec![stub.clone()];

        for _ in 0..Database::CIRCUIT_BREAKER_THRESHOLD {
            let report =
                run_fetch(&db, &providers, &FetchRequest::default(), FetchOptions::default()).await;
            assert_eq!(report.failures(), 1);
        }
        let source = db.get_source_by_key("flaky").await.unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 5);
        assert!(source.error.unwrap().contains("500"));

        let report = run_fetch(&db, &providers, &FetchRequest::default(), FetchOptions::default()).await;
        assert!(matches!(
            report.results[0].outcome,
            FetchOutcome::Skipped { consecutive_failures: 5 }
        ));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 5);

        let forced = FetchOptions {
            force: true,
            ..Default::default()
        };
        run_fetch(&db, &providers, &FetchRequest::default(), forced).await;
        assert_eq!(stub.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let db = Database::open(":memory:").await.unwrap();
        let providers: Vec<Arc<dyn NewsProvider>> =
            vec![StubProvider::new("bad", true), StubProvider::new("good", false)];

        let report = run_fetch(&db, &providers, &FetchRequest::default(), FetchOptions::default()).await;
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].provider, "bad");
        assert!(matches!(report.results[0].outcome, FetchOutcome::Failed { .. }));
        assert_eq!(report.inserted(), 3);

        let good = db.get_source_by_key("good").await.unwrap().unwrap();
        assert!(good.error.is_none());
        assert!(good.last_fetched.is_some());
    }
}
