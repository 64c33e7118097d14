use anyhow::{bail, Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use std::{fmt::Debug, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use meeting_aggregator::config::{self, parse_source_arg};
use meeting_aggregator::server::{self, metrics, ServerConfig};
use meeting_aggregator::store::{MeetingStore, SqliteMeetingStore, DEFAULT_READ_POOL_SIZE};
use meeting_aggregator::sync::{create_scheduler, SyncOrchestrator, SystemClock};
use meeting_aggregator::{HttpSourceClient, RequestsLoggingLevel};

const MEMORY_METRICS_INTERVAL: Duration = Duration::from_secs(60);

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    if path_buf.is_absolute() {
        return Ok(path_buf);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(path_buf))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML configuration file. Values in it override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the meetings database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 3001)]
    pub port: u16,

    /// The level of logging to perform on each request.
    #[clap(long, default_value = "path")]
    pub logging_level: RequestsLoggingLevel,

    /// Seconds between sync ticks.
    #[clap(long)]
    pub sync_interval_secs: Option<u64>,

    /// Timeout in seconds of each upstream request.
    #[clap(long)]
    pub request_timeout_secs: Option<u64>,

    /// An upstream root server, as ID=URL. Repeatable. Ignored when the
    /// config file declares `[[sources]]`.
    #[clap(long = "source", value_parser = parse_source_arg)]
    pub sources: Vec<(i64, String)>,

    /// Run a single sync tick and exit without serving.
    #[clap(long)]
    pub once: bool,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            port: args.port,
            logging_level: args.logging_level,
            sync_interval_secs: args.sync_interval_secs,
            request_timeout_secs: args.request_timeout_secs,
            sources: args.sources.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  port: {}", app_config.port);
    info!("  sync interval: {:?}", app_config.sync.interval());
    for source in &app_config.sources {
        info!(
            "  {}: {} ({}{})",
            source.display_name(),
            source.url,
            source.shape.as_str(),
            if source.enabled { "" } else { ", disabled" }
        );
    }

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!(
        "Opening SQLite meetings database at {:?}...",
        app_config.meetings_db_path()
    );
    let store = Arc::new(SqliteMeetingStore::new(
        app_config.meetings_db_path(),
        DEFAULT_READ_POOL_SIZE,
    )?);

    let client = Arc::new(HttpSourceClient::new(
        app_config.sync.request_timeout(),
        &app_config.sync.user_agent,
    )?);
    let orchestrator = SyncOrchestrator::new(
        app_config.sources.clone(),
        client,
        store.clone() as Arc<dyn MeetingStore>,
        Arc::new(SystemClock),
        app_config.sync.clone(),
    );

    let shutdown_token = CancellationToken::new();

    if cli_args.once {
        if let Err(e) = orchestrator.purge_removed_sources().await {
            error!("Failed to purge removed sources: {}", e);
        }
        let report = orchestrator.run_once(&shutdown_token).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.failed_count() > 0 {
            bail!("{} sources failed to sync", report.failed_count());
        }
        return Ok(());
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MEMORY_METRICS_INTERVAL);
        loop {
            ticker.tick().await;
            metrics::update_memory_usage();
        }
    });

    let (mut scheduler, sync_handle) = create_scheduler(orchestrator, shutdown_token.clone());
    let server_config = ServerConfig {
        requests_logging_level: app_config.logging_level,
        port: app_config.port,
    };

    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    // Run HTTP server until it fails or Ctrl+C
    let result = tokio::select! {
        result = server::run_server(
            server_config,
            store as Arc<dyn MeetingStore>,
            Some(sync_handle),
            shutdown_token.clone(),
        ) => {
            info!("HTTP server stopped: {:?}", result);
            result
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown");
            Ok(())
        }
    };

    shutdown_token.cancel();
    if let Err(e) = scheduler_task.await {
        error!("Sync scheduler task failed: {}", e);
    }
    result
}
