use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub port: Option<u16>,
    pub logging_level: Option<String>,

    pub sync: Option<SyncConfig>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub cycle_timeout_secs: Option<u64>,
    pub max_concurrent_sources: Option<usize>,
    pub backoff_initial_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub unavailable_escalation_ticks: Option<u32>,
    pub user_agent: Option<String>,
}

/// One `[[sources]]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// "bmlt" or "typed"
    #[serde(default)]
    pub shape: Option<String>,
    #[serde(default)]
    pub trust_last_changed: bool,
    #[serde(default)]
    pub incremental: bool,
}

fn default_true() -> bool {
    true
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sync_section_and_sources() {
        let config: FileConfig = toml::from_str(
            r#"
            db_dir = "/var/lib/aggregator"
            logging_level = "headers"

            [sync]
            interval_secs = 300
            max_concurrent_sources = 2

            [[sources]]
            id = 1
            url = "https://bmlt.example.org/main_server"
            name = "Example Region"

            [[sources]]
            id = 2
            url = "https://typed.example.org"
            shape = "typed"
            incremental = true
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.db_dir.as_deref(), Some("/var/lib/aggregator"));
        let sync = config.sync.unwrap();
        assert_eq!(sync.interval_secs, Some(300));
        assert_eq!(sync.max_concurrent_sources, Some(2));
        assert!(sync.request_timeout_secs.is_none());

        assert_eq!(config.sources.len(), 2);
        assert!(config.sources[0].enabled);
        assert_eq!(config.sources[0].name.as_deref(), Some("Example Region"));
        assert!(!config.sources[1].enabled);
        assert!(config.sources[1].incremental);
        assert_eq!(config.sources[1].shape.as_deref(), Some("typed"));
    }

    #[test]
    fn source_without_url_is_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str("[[sources]]\nid = 1\n");
        assert!(parsed.is_err());
    }
}
