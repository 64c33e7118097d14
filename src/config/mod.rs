mod file_config;

pub use file_config::{FileConfig, SourceConfig, SyncConfig};

use crate::model::{ResponseShape, Source};
use crate::server::RequestsLoggingLevel;
use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub sync_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    /// `(id, base url)` pairs from `--source ID=URL`.
    pub sources: Vec<(i64, String)>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub port: u16,
    pub logging_level: RequestsLoggingLevel,
    pub sync: SyncSettings,
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub interval_secs: u64,
    /// Per-request deadline for upstream fetches.
    pub request_timeout_secs: u64,
    /// Deadline for fetching and reconciling one source.
    pub cycle_timeout_secs: u64,
    pub max_concurrent_sources: usize,
    /// 0 disables backoff: a failed source is retried on the next tick.
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_multiplier: f64,
    /// Consecutive ticks in which every attempted source failed on the store
    /// before the process reports itself degraded.
    pub unavailable_escalation_ticks: u32,
    pub user_agent: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            request_timeout_secs: 20,
            cycle_timeout_secs: 120,
            max_concurrent_sources: 8,
            backoff_initial_secs: 600,
            backoff_max_secs: 21600, // 6 hours
            backoff_multiplier: 2.0,
            unavailable_escalation_ticks: 3,
            user_agent: crate::source_client::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let port = file.port.unwrap_or(cli.port);

        let logging_level = match file.logging_level {
            Some(s) => parse_logging_level(&s)
                .ok_or_else(|| anyhow::anyhow!("Invalid logging_level: {:?}", s))?,
            None => cli.logging_level.clone(),
        };

        let defaults = SyncSettings::default();
        let sync_file = file.sync.unwrap_or_default();
        let sync = SyncSettings {
            interval_secs: sync_file
                .interval_secs
                .or(cli.sync_interval_secs)
                .unwrap_or(defaults.interval_secs),
            request_timeout_secs: sync_file
                .request_timeout_secs
                .or(cli.request_timeout_secs)
                .unwrap_or(defaults.request_timeout_secs),
            cycle_timeout_secs: sync_file
                .cycle_timeout_secs
                .unwrap_or(defaults.cycle_timeout_secs),
            max_concurrent_sources: sync_file
                .max_concurrent_sources
                .unwrap_or(defaults.max_concurrent_sources),
            backoff_initial_secs: sync_file
                .backoff_initial_secs
                .unwrap_or(defaults.backoff_initial_secs),
            backoff_max_secs: sync_file
                .backoff_max_secs
                .unwrap_or(defaults.backoff_max_secs),
            backoff_multiplier: sync_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            unavailable_escalation_ticks: sync_file
                .unavailable_escalation_ticks
                .unwrap_or(defaults.unavailable_escalation_ticks),
            user_agent: sync_file.user_agent.unwrap_or(defaults.user_agent),
        };
        validate_sync_settings(&sync)?;

        // [[sources]] in the file replace any --source flags
        let source_configs: Vec<SourceConfig> = if !file.sources.is_empty() {
            file.sources
        } else {
            cli.sources
                .iter()
                .map(|(id, url)| SourceConfig {
                    id: *id,
                    url: url.clone(),
                    name: None,
                    enabled: true,
                    shape: None,
                    trust_last_changed: false,
                    incremental: false,
                })
                .collect()
        };
        let sources = resolve_sources(source_configs)?;

        Ok(Self {
            db_dir,
            port,
            logging_level,
            sync,
            sources,
        })
    }

    pub fn meetings_db_path(&self) -> PathBuf {
        self.db_dir.join("meetings.db")
    }
}

fn validate_sync_settings(sync: &SyncSettings) -> Result<()> {
    if sync.interval_secs == 0 {
        bail!("sync.interval_secs must be greater than zero");
    }
    if sync.request_timeout_secs == 0 {
        bail!("sync.request_timeout_secs must be greater than zero");
    }
    if sync.cycle_timeout_secs == 0 {
        bail!("sync.cycle_timeout_secs must be greater than zero");
    }
    if sync.max_concurrent_sources == 0 {
        bail!("sync.max_concurrent_sources must be greater than zero");
    }
    if !sync.backoff_multiplier.is_finite() || sync.backoff_multiplier < 1.0 {
        bail!(
            "sync.backoff_multiplier must be at least 1.0, got {}",
            sync.backoff_multiplier
        );
    }
    if sync.unavailable_escalation_ticks == 0 {
        bail!("sync.unavailable_escalation_ticks must be greater than zero");
    }
    Ok(())
}

fn resolve_sources(configs: Vec<SourceConfig>) -> Result<Vec<Source>> {
    if configs.is_empty() {
        bail!("No sources configured: add [[sources]] to the config file or pass --source ID=URL");
    }

    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(configs.len());
    for config in configs {
        if config.id <= 0 {
            bail!("Source id must be a positive integer, got {}", config.id);
        }
        if !seen.insert(config.id) {
            bail!("Duplicate source id {}", config.id);
        }

        let url = reqwest::Url::parse(config.url.trim())
            .with_context(|| format!("Source {} has a malformed url: {:?}", config.id, config.url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!(
                "Source {} url must be http or https, got {:?}",
                config.id,
                config.url
            );
        }

        let shape = match config.shape.as_deref() {
            Some(raw) => ResponseShape::parse(raw).ok_or_else(|| {
                anyhow::anyhow!("Source {} has an unknown shape {:?}", config.id, raw)
            })?,
            None => ResponseShape::default(),
        };

        let mut source = Source::new(config.id, config.url.trim());
        source.name = config.name.filter(|n| !n.trim().is_empty());
        source.enabled = config.enabled;
        source.shape = shape;
        source.trust_last_changed = config.trust_last_changed;
        source.incremental = config.incremental;
        sources.push(source);
    }
    Ok(sources)
}

/// Parses a `--source ID=URL` argument.
pub fn parse_source_arg(s: &str) -> Result<(i64, String), String> {
    let (id, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got {:?}", s))?;
    let id = id
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("source id must be an integer, got {:?}", id))?;
    Ok((id, url.trim().to_string()))
}

/// Parses a logging level string into RequestsLoggingLevel.
/// Uses clap's ValueEnum trait for parsing.
fn parse_logging_level(s: &str) -> Option<RequestsLoggingLevel> {
    RequestsLoggingLevel::from_str(s, true).ok()
}
