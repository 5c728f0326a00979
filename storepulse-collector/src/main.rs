use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storepulse_config::{AppConfig, ConfigLoader, ProxySource};
use storepulse_core::MIGRATOR;
use storepulse_core::collection::{
    AutomationContext, InMemoryJobQueue, JobPriority, PostgresJobQueue,
};
use storepulse_core::store::{InMemoryExtensionStore, PostgresExtensionStore};
use storepulse_core::types::ExtensionId;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "storepulse-collector")]
#[command(about = "Discovers and refreshes Chrome Web Store extension listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Collector tuning file (TOML or JSON)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Keep the queue and datastore in process memory instead of Postgres
    #[arg(long, env = "STOREPULSE_IN_MEMORY", default_value_t = false, global = true)]
    in_memory: bool,

    /// Maximum database connections
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a single scheduling cycle plus housekeeping, then exit
    Once,
    /// Queue update jobs for the given extension ids
    Enqueue {
        #[arg(required = true)]
        ids: Vec<String>,
        /// high, medium or low
        #[arg(long, default_value = "high")]
        priority: String,
    },
    /// Print queue, proxy and scrape statistics as JSON
    Status,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,storepulse_core=info,sqlx=warn,reqwest=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.run.config.clone() {
        loader = loader.with_config_path(path);
    }
    let config = loader.load().context("failed to load configuration")?;
    log_config(&config);

    if let Some(Command::Db(DbCommand::Migrate)) = cli.command {
        run_db_migrate(&config, &cli.run).await?;
        return Ok(());
    }

    let ctx = build_context(&config, &cli.run).await?;

    match cli.command {
        None => run_collector(ctx).await,
        Some(Command::Once) => run_once(ctx).await,
        Some(Command::Enqueue { ids, priority }) => {
            if cli.run.in_memory {
                bail!("enqueue needs a shared database; drop --in-memory");
            }
            run_enqueue(ctx, ids, &priority).await
        }
        Some(Command::Status) => print_status(&ctx).await,
        Some(Command::Db(_)) => Ok(()),
    }
}

fn log_config(config: &AppConfig) {
    if let Some(path) = &config.metadata.env_file_loaded {
        info!(path = %path.display(), "loaded .env file");
    }
    match &config.metadata.proxy_source {
        ProxySource::None => warn!("no proxies configured; requests go direct"),
        ProxySource::File(path) => {
            info!(path = %path.display(), proxies = config.proxies.len(), "proxy list loaded from file")
        }
        ProxySource::Env => {
            info!(proxies = config.proxies.len(), "proxy list loaded from environment")
        }
    }

    let collector = &config.collector;
    info!(
        workers.discovery = collector.workers.discovery_workers,
        workers.update = collector.workers.update_workers,
        scheduler.tick_secs = collector.scheduler.tick_interval_secs,
        scheduler.max_jobs_per_run = collector.scheduler.max_jobs_per_run,
        queue.max_retries = collector.queue.retry.max_retries,
        queue.lease_ttl_secs = collector.queue.lease.lease_ttl_secs,
        "collector configuration in effect"
    );
}

async fn connect(config: &AppConfig, args: &RunArgs) -> anyhow::Result<sqlx::PgPool> {
    let url = config.require_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(args.max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    Ok(pool)
}

async fn run_db_migrate(config: &AppConfig, args: &RunArgs) -> anyhow::Result<()> {
    connect(config, args).await?;
    info!("database migrations applied successfully");
    Ok(())
}

async fn build_context(
    config: &AppConfig,
    args: &RunArgs,
) -> anyhow::Result<AutomationContext> {
    let builder = AutomationContext::builder(config.collector.clone())
        .with_proxies(config.proxies.clone());

    let builder = if args.in_memory {
        info!("using in-memory queue and datastore; state is lost on exit");
        builder
            .with_queue(Arc::new(InMemoryJobQueue::new(config.collector.queue.clone())))
            .with_store(Arc::new(InMemoryExtensionStore::new()))
    } else {
        let pool = connect(config, args).await?;
        let queue = PostgresJobQueue::new(pool.clone(), config.collector.queue.clone())
            .await
            .context("failed to initialise job queue")?;
        builder
            .with_queue(Arc::new(queue))
            .with_store(Arc::new(PostgresExtensionStore::new(pool)))
    };

    builder
        .build()
        .context("failed to assemble collection pipeline")
}

async fn run_collector(ctx: AutomationContext) -> anyhow::Result<()> {
    let status = ctx.start().await.context("failed to start collector")?;
    info!(
        workers = status.workers.total_workers,
        proxies = status.proxies.total,
        "collector running; press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    let status = ctx.stop().await.context("failed to stop collector")?;
    info!(
        scrapes.ok = status.scrape.successful_scrapes,
        scrapes.failed = status.scrape.failed_scrapes,
        "collector stopped"
    );
    Ok(())
}

async fn run_once(ctx: AutomationContext) -> anyhow::Result<()> {
    let report = ctx
        .scheduler()
        .run_cycle()
        .await
        .context("scheduling cycle failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_enqueue(
    ctx: AutomationContext,
    ids: Vec<String>,
    priority: &str,
) -> anyhow::Result<()> {
    let priority: JobPriority = priority.parse()?;
    let ids = ids
        .into_iter()
        .map(ExtensionId::new)
        .collect::<Result<Vec<_>, _>>()?;

    let handles = ctx.schedule_bulk_updates(ids, priority).await?;
    let merged = handles.iter().filter(|h| h.merged_into.is_some()).count();
    info!(jobs = handles.len(), merged, %priority, "update jobs queued");
    println!("{}", serde_json::to_string_pretty(&handles)?);
    Ok(())
}

async fn print_status(ctx: &AutomationContext) -> anyhow::Result<()> {
    let status = ctx.status().await?;
    let completed = ctx.completed_stats(10).await?;
    let report = serde_json::json!({
        "status": status,
        "completed": completed,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
