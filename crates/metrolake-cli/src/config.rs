//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono_tz::Tz;
use metrolake_core::RetryPolicy;
use metrolake_pipeline::{DatasetConfig, PipelineConfig, default_workers};
use metrolake_sources::{SourceConfig, SourceKind};
use metrolake_sources::socrata::{NYC_EVENTS_URL, OFFICIAL_ALERTS_URL};
use metrolake_store::StoreSettings;
use serde::Deserialize;

/// Global configuration for metrolake
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSettings,
    pub pipeline: PipelineSection,
    pub datasets: Vec<DatasetConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreSettings::default(),
            pipeline: PipelineSection::default(),
            datasets: default_datasets(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub fetch_timeout_secs: u64,
    pub max_coercion_failure_ratio: f64,
    pub timezone: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            workers: default_workers(),
            max_retries: defaults.retry.max_retries,
            backoff_ms: defaults.retry.base_backoff.as_millis() as u64,
            fetch_timeout_secs: defaults.fetch_timeout.as_secs(),
            max_coercion_failure_ratio: defaults.max_coercion_failure_ratio,
            timezone: defaults.tz.name().to_string(),
        }
    }
}

impl PipelineSection {
    pub fn to_pipeline_config(&self) -> Result<PipelineConfig> {
        let tz: Tz = self
            .timezone
            .parse()
            .map_err(|e| anyhow!("invalid timezone {:?}: {e}", self.timezone))?;
        if !(0.0..=1.0).contains(&self.max_coercion_failure_ratio) {
            anyhow::bail!(
                "max_coercion_failure_ratio must be within 0..=1, got {}",
                self.max_coercion_failure_ratio
            );
        }
        Ok(PipelineConfig {
            workers: self.workers.max(1),
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_backoff: Duration::from_millis(self.backoff_ms),
            },
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_coercion_failure_ratio: self.max_coercion_failure_ratio,
            tz,
        })
    }
}

fn socrata(url: &str, date_field: &str, key: &[&str]) -> SourceConfig {
    let mut source = SourceConfig::new(SourceKind::Socrata);
    source.base_url = Some(url.to_string());
    source.date_field = Some(date_field.to_string());
    source.natural_key = key.iter().map(|s| s.to_string()).collect();
    source
}

fn events(variant: &str, filter: Option<&str>) -> SourceConfig {
    let mut source = socrata(NYC_EVENTS_URL, "start_date_time", &["event_name", "start_date_time"])
        .with_variant(variant);
    source.filter = filter.map(str::to_string);
    source
}

/// Datasets run when the config file names none.
///
/// `gtfs_with_delays` needs a feed URL and is only run when configured.
pub fn default_datasets() -> Vec<DatasetConfig> {
    vec![
        DatasetConfig {
            name: "clima".into(),
            sources: vec![SourceConfig::new(SourceKind::Weather)],
            ..Default::default()
        },
        DatasetConfig {
            name: "official_alerts".into(),
            sources: vec![socrata(OFFICIAL_ALERTS_URL, "date", &["alert_id"])],
            ..Default::default()
        },
        DatasetConfig {
            name: "eventos_nyc".into(),
            sources: vec![
                events("eventos", None),
                events("eventos_deporte", Some("event_type like 'Sport%'")),
                events("eventos_concierto", Some("upper(event_name) like '%CONCERT%'")),
            ],
            ..Default::default()
        },
    ]
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

fn expand_in_place(value: &mut Option<String>) {
    *value = value.take().and_then(|s| expand_env_var(&s));
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./metrolake.toml (current directory)
    /// 2. ~/.config/metrolake/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("metrolake.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "metrolake") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        let mut config = Self::default();
        config.resolve_env();
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.resolve_env();
        Ok(config)
    }

    /// Resolve `${VAR}` references in credentials and endpoints.
    fn resolve_env(&mut self) {
        expand_in_place(&mut self.store.endpoint);
        expand_in_place(&mut self.store.access_key);
        expand_in_place(&mut self.store.secret_key);
        for source in self.datasets.iter_mut().flat_map(|d| d.sources.iter_mut()) {
            expand_in_place(&mut source.token);
            expand_in_place(&mut source.base_url);
        }
    }
}
