use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pulse_common::{load_config, AppConfig, FileConfig, SourceId};
use pulse_ingest::{Scheduler, Stores};
use pulse_sources::{build_adapter, RetryPolicy, SourceAdapter};
use pulse_store::{FsLandingStore, InMemoryStore, PgStore};

#[derive(Parser)]
#[command(name = "pulse", about = "Idempotent multi-source ingestion and deduplication")]
struct Cli {
    /// Path to config TOML file (overrides PULSE_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted
    Run,
    /// Run a single tick, or one source
    Once {
        #[arg(long)]
        source: Option<String>,
    },
    /// Re-merge a landed run without refetching it
    Replay {
        #[arg(long)]
        source: String,
        #[arg(long)]
        run_id: Uuid,
    },
    /// Report the duplicate ratio of recent landing or canonical rows
    Audit {
        #[arg(long)]
        source: String,
        /// Audit canonical rows instead of landing objects
        #[arg(long)]
        canonical: bool,
        /// Audit a single landed run
        #[arg(long, conflicts_with = "canonical")]
        run_id: Option<Uuid>,
    },
    /// Move a cursor back for a backfill, or clear it
    ResetCursor {
        #[arg(long)]
        source: String,
        /// RFC 3339 timestamp; omit to clear the cursor
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Show cursor lag and last run per source
    Status,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("pulse=info".parse()?);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

async fn build_stores(app: &AppConfig) -> Result<Stores> {
    let landing = Arc::new(FsLandingStore::new(app.landing_dir.clone()));
    match &app.database_url {
        Some(url) => {
            let pg = PgStore::connect(url).await.context("Failed to connect to Postgres")?;
            pg.migrate().await.context("Failed to run migrations")?;
            info!("Postgres stores ready");
            Ok(Stores::postgres(pg, landing))
        }
        None => {
            warn!("DATABASE_URL not set, cursors and canonical rows live in memory only");
            let mem = Arc::new(InMemoryStore::new());
            Ok(Stores {
                cursors: mem.clone(),
                canonical: mem.clone(),
                runs: mem,
                landing,
            })
        }
    }
}

fn build_adapters(app: &AppConfig, config: &FileConfig) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let client = reqwest::Client::builder()
        .user_agent(app.reddit_user_agent.clone())
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;
    let retry = RetryPolicy::from_config(&config.scheduler.retry);

    config
        .enabled_sources()
        .map(|source| {
            build_adapter(source, app, client.clone(), retry.clone())
                .with_context(|| format!("Failed to build adapter for {}", source.id))
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    let mut app = AppConfig::from_env()?;
    if let Some(path) = cli.config {
        app.config_path = path;
    }
    let config = load_config(&app.config_path)?;
    info!(
        config = %app.config_path.display(),
        sources = config.sources.len(),
        "Config loaded"
    );

    let stores = build_stores(&app).await?;
    let adapters = build_adapters(&app, &config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Scheduler::new(adapters, stores, &config).with_shutdown(shutdown_rx);

    match cli.command {
        Command::Run => scheduler.run_forever().await,
        Command::Once { source: None } => {
            for (source, result) in scheduler.tick().await {
                match result {
                    Ok(summary) => println!(
                        "{source}: {} run={} fetched={} landed={}",
                        summary.status, summary.run_id, summary.fetched, summary.landed
                    ),
                    Err(e) => println!("{source}: not started ({e})"),
                }
            }
        }
        Command::Once { source: Some(id) } => {
            let summary = scheduler.run_source(&SourceId::new(id)).await?;
            println!(
                "{}: {} run={} fetched={} landed={} cursor={:?}",
                summary.source_id,
                summary.status,
                summary.run_id,
                summary.fetched,
                summary.landed,
                summary.cursor
            );
        }
        Command::Replay { source, run_id } => {
            let summary = scheduler.replay_run(&SourceId::new(source), run_id).await?;
            println!(
                "{}: replayed run={} records={} inserted={} updated={} unchanged={} cursor={:?}",
                summary.source_id,
                summary.run_id,
                summary.records,
                summary.merge.inserted,
                summary.merge.updated,
                summary.merge.unchanged,
                summary.cursor
            );
        }
        Command::Audit {
            source,
            canonical,
            run_id,
        } => {
            let source = SourceId::new(source);
            let now = Utc::now();
            let auditor = scheduler.auditor();
            let result = match (run_id, canonical) {
                (Some(run_id), _) => auditor.audit_run(&source, run_id, now).await?,
                (None, true) => auditor.audit_canonical(&source, now).await?,
                (None, false) => auditor.audit_landing(&source, now).await?,
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::ResetCursor { source, to } => {
            let source = SourceId::new(source);
            scheduler.reset_cursor(&source, to).await?;
            match to {
                Some(t) => println!("{source}: cursor reset to {t}"),
                None => println!("{source}: cursor cleared"),
            }
        }
        Command::Status => {
            let statuses = scheduler.status(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&statuses)?);
        }
    }

    Ok(())
}
