use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use newsdesk::ai::{AnthropicClient, LlmClient};
use newsdesk::api::{self, AppState};
use newsdesk::config::Config;
use newsdesk::providers;
use newsdesk::storage::{Database, DatabaseError};
use newsdesk::tasks::{spawn_scheduler, ScheduleSettings, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "newsdesk", version, about = "News aggregation API with AI enrichment")]
struct Args {
    /// TOML configuration file (missing file = defaults)
    #[arg(long, value_name = "FILE", default_value = "newsdesk.toml")]
    config: PathBuf,

    /// Listen address, overrides config and NEWSDESK_BIND
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// SQLite database path, overrides config and NEWSDESK_DATABASE
    #[arg(long, value_name = "FILE")]
    database: Option<String>,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,

    /// Rebuild the search index (FTS5)
    #[arg(long)]
    rebuild_search: bool,

    /// Serve the API only; no background workers or scheduler
    #[arg(long)]
    no_workers: bool,
}

fn reset_database(path: &str) -> Result<()> {
    if path == ":memory:" {
        return Ok(());
    }
    for suffix in ["", "-wal", "-shm"] {
        let file = format!("{path}{suffix}");
        if Path::new(&file).exists() {
            std::fs::remove_file(&file)
                .with_context(|| format!("Failed to delete database file '{file}'"))?;
        }
    }
    tracing::info!(path, "Database reset");
    Ok(())
}

async fn check_search_index(db: &Database, rebuild: bool) -> Result<()> {
    if rebuild {
        tracing::info!("Rebuilding search index...");
        let count = db
            .rebuild_fts_index()
            .await
            .context("Failed to rebuild search index")?;
        tracing::info!(articles = count, "Search index rebuilt");
        return Ok(());
    }

    match db.check_fts_consistency_detailed().await {
        Ok(report) if report.is_consistent => {
            tracing::debug!("FTS5 index is consistent");
        }
        Ok(report) => {
            tracing::warn!(
                articles = report.articles_count,
                fts = report.fts_count,
                orphaned = report.orphaned_fts_entries,
                missing = report.missing_fts_entries,
                "FTS index inconsistent, run with --rebuild-search"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to check FTS5 consistency");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config '{}'", args.config.display()))?;
    config.apply_env();
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate().context("Invalid configuration")?;
    tracing::debug!(?config, "Configuration loaded");

    if args.reset_db {
        reset_database(&config.database_path)?;
    }

    let db = match Database::open(&config.database_path).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!(
                "Database '{}' is locked by another process. Stop it and try again.",
                config.database_path
            );
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };
    check_search_index(&db, args.rebuild_search).await?;

    let http = reqwest::Client::builder()
        .user_agent(concat!("newsdesk/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        // Backstop above the per-request deadlines of providers (30s) and the LLM
        .timeout(Duration::from_secs(config.llm.timeout_secs.max(30) + 5))
        .build()
        .context("Failed to build HTTP client")?;

    let llm = AnthropicClient::new(http.clone(), &config.llm).context("Invalid LLM configuration")?;
    if !llm.is_configured() {
        tracing::warn!("No LLM API key configured, analysis tasks will fail");
    }
    let llm: Arc<dyn LlmClient> = Arc::new(llm);
    let providers =
        providers::from_config(&config.providers, http).context("Invalid provider configuration")?;
    if providers.is_empty() {
        tracing::warn!("No news provider has an API key, fetch tasks will do nothing");
    }

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    let workers = config.worker.workers;
    let schedule = ScheduleSettings::from_config(&config.worker);
    let state = Arc::new(AppState::new(db.clone(), config, llm, providers));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = if args.no_workers {
        tracing::info!("Background workers disabled");
        None
    } else {
        let pool = WorkerPool::spawn(Arc::new(state.task_context()), workers, shutdown_rx.clone())
            .await
            .context("Failed to start worker pool")?;
        let scheduler = spawn_scheduler(db.clone(), state.queue.clone(), schedule, shutdown_rx);
        Some((pool, scheduler))
    };

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    };
    api::serve(listener, state, shutdown).await?;

    if let Some((pool, scheduler)) = background {
        pool.join().await;
        if let Err(e) = scheduler.await {
            tracing::error!(error = %e, "Scheduler task panicked");
        }
    }
    db.close().await;
    tracing::info!("Goodbye");
    Ok(())
}
