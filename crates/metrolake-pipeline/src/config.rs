//! Run settings and the datasets a run works on

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;
use metrolake_clean::{
    Bounds, DEFAULT_MAX_COERCION_FAILURE_RATIO, DatasetSchema, Split, StopDirectory, builtin,
};
use metrolake_core::{MalformedKeyError, RetryPolicy, SERVICE_TZ, SourceError};
use metrolake_sources::{SourceAdapter, SourceConfig, build_source};
use metrolake_store::{Layer, PartitionKey, default_variant, is_valid_dataset, make_key};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound for the default worker count.
pub const DEFAULT_MAX_WORKERS: usize = 8;

/// `min(cpus, 8)`
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map_or(1, |n| n.get())
        .min(DEFAULT_MAX_WORKERS)
}

/// Settings shared by every job of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Per-request timeout handed to HTTP sources.
    pub fetch_timeout: Duration,
    pub max_coercion_failure_ratio: f64,
    /// Timezone partition dates are local to.
    pub tz: Tz,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(60),
            max_coercion_failure_ratio: DEFAULT_MAX_COERCION_FAILURE_RATIO,
            tz: SERVICE_TZ,
        }
    }
}

/// One `[[datasets]]` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub name: String,
    /// Needed only for datasets without a built-in schema.
    pub natural_key: Vec<String>,
    /// Replace or extend the schema's outlier bounds.
    pub bounds: Vec<Bounds>,
    /// JSON object mapping stop names to GTFS stop ids, for datasets that
    /// list affected stops.
    pub stops_file: Option<PathBuf>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid dataset name {0:?}")]
    InvalidName(String),
    #[error("{0}: no built-in schema, set `natural_key`")]
    UnknownDataset(String),
    #[error("{0}: no sources configured")]
    NoSources(String),
    #[error("{0}: configured twice")]
    DuplicateDataset(String),
    #[error("{dataset}: cannot load stop directory {path}: {reason}")]
    StopDirectory {
        dataset: String,
        path: PathBuf,
        reason: String,
    },
    #[error("{dataset}: duplicate source variant {variant:?}")]
    DuplicateVariant { dataset: String, variant: String },
    #[error(transparent)]
    Key(#[from] MalformedKeyError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// A raw feed of a dataset.
#[derive(Clone)]
pub struct RawSource {
    /// Named variants are stored as `{variant}_{date}`; `None` uses the
    /// dataset's default variant.
    pub variant: Option<String>,
    pub adapter: Arc<dyn SourceAdapter>,
}

impl RawSource {
    /// Value of the `source_variant` column for rows from this feed.
    pub fn tag<'a>(&'a self, dataset: &'a str) -> &'a str {
        self.variant.as_deref().unwrap_or(dataset)
    }

    pub fn raw_key(&self, dataset: &str, date: NaiveDate) -> PartitionKey {
        let variant = match &self.variant {
            Some(v) => format!("{v}_{}", date.format("%Y-%m-%d")),
            None => default_variant(dataset, date),
        };
        PartitionKey::with_variant(Layer::Raw, dataset, date, &variant)
    }
}

impl std::fmt::Debug for RawSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSource")
            .field("variant", &self.variant)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}

/// A dataset ready to run: schema plus its raw feeds.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub name: String,
    pub schema: DatasetSchema,
    pub sources: Vec<RawSource>,
}

impl Dataset {
    pub fn new(schema: DatasetSchema) -> Self {
        Self {
            name: schema.name.clone(),
            schema,
            sources: Vec::new(),
        }
    }

    /// Dataset with a built-in schema and no sources yet.
    pub fn builtin(name: &str) -> Result<Self, ConfigError> {
        builtin(name)
            .map(|s| Self::new(s.clone()))
            .ok_or_else(|| ConfigError::UnknownDataset(name.to_string()))
    }

    pub fn with_source(mut self, variant: Option<&str>, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.sources.push(RawSource {
            variant: variant.map(str::to_string),
            adapter,
        });
        self
    }

    /// Resolve a config entry: schema, bounds overrides and source adapters.
    pub fn from_config(cfg: &DatasetConfig, pipeline: &PipelineConfig) -> Result<Self, ConfigError> {
        let schema = match builtin(&cfg.name) {
            Some(schema) => schema.clone(),
            None if !cfg.natural_key.is_empty() => {
                let key: Vec<&str> = cfg.natural_key.iter().map(String::as_str).collect();
                DatasetSchema::new(&cfg.name, &key)
            }
            None => return Err(ConfigError::UnknownDataset(cfg.name.clone())),
        };

        let mut schema = schema.with_bounds(&cfg.bounds);
        if let Some(path) = &cfg.stops_file {
            let directory = load_stop_directory(&cfg.name, path)?;
            log::debug!("{}: {} stops in {}", cfg.name, directory.len(), path.display());
            schema = schema.with_stop_directory(Arc::new(directory));
        }

        let mut dataset = Self::new(schema);
        for source in &cfg.sources {
            let adapter = build_source(&cfg.name, source, pipeline.tz, pipeline.fetch_timeout)?;
            dataset = dataset.with_source(source.variant.as_deref(), Arc::from(adapter));
        }
        dataset.validate()?;
        Ok(dataset)
    }

    /// Names and variants must form valid, distinct partition keys.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_dataset(&self.name) {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources(self.name.clone()));
        }
        let sample_date = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default();
        let mut seen = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let key = source.raw_key(&self.name, sample_date);
            make_key(&key)?;
            if seen.contains(&key.variant) {
                return Err(ConfigError::DuplicateVariant {
                    dataset: self.name.clone(),
                    variant: source.tag(&self.name).to_string(),
                });
            }
            seen.push(key.variant);
        }
        for key in self.cleaned_keys(sample_date) {
            make_key(&key)?;
        }
        Ok(())
    }

    pub fn raw_keys(&self, date: NaiveDate) -> Vec<PartitionKey> {
        self.sources
            .iter()
            .map(|s| s.raw_key(&self.name, date))
            .collect()
    }

    /// One cleaned partition per split, `{split}_{date}`; the default
    /// variant when the schema has no splits.
    pub fn cleaned_keys(&self, date: NaiveDate) -> Vec<PartitionKey> {
        if self.schema.splits.is_empty() {
            return vec![PartitionKey::new(Layer::Cleaned, &self.name, date)];
        }
        self.schema
            .splits
            .iter()
            .map(|s| {
                PartitionKey::with_variant(Layer::Cleaned, &self.name, date, &split_variant(s, date))
            })
            .collect()
    }

    /// Split a cleaned partition holds; `None` for unsplit datasets.
    pub fn split_for(&self, key: &PartitionKey) -> Option<&Split> {
        self.schema
            .splits
            .iter()
            .find(|s| split_variant(s, key.date) == key.variant)
    }
}

fn split_variant(split: &Split, date: NaiveDate) -> String {
    format!("{}_{}", split.name, date.format("%Y-%m-%d"))
}

fn load_stop_directory(dataset: &str, path: &std::path::Path) -> Result<StopDirectory, ConfigError> {
    let err = |reason: String| ConfigError::StopDirectory {
        dataset: dataset.to_string(),
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
    StopDirectory::from_json(&text).map_err(|e| err(e.to_string()))
}

/// Resolve every configured dataset, rejecting duplicates.
pub fn build_datasets(
    configs: &[DatasetConfig],
    pipeline: &PipelineConfig,
) -> Result<Vec<Dataset>, ConfigError> {
    let mut datasets: Vec<Dataset> = Vec::with_capacity(configs.len());
    for cfg in configs {
        if datasets.iter().any(|d| d.name == cfg.name) {
            return Err(ConfigError::DuplicateDataset(cfg.name.clone()));
        }
        datasets.push(Dataset::from_config(cfg, pipeline)?);
    }
    Ok(datasets)
}
