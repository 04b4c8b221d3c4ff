//! Source selection from configuration

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use metrolake_core::SourceError;
use serde::{Deserialize, Serialize};

use crate::adapter::SourceAdapter;
use crate::socrata::SocrataSource;
use crate::static_records::StaticSource;
use crate::stop_events::StopEventsSource;
use crate::weather::WeatherSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    StopEvents,
    Weather,
    Socrata,
    Static,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StopEvents => "stop_events",
            Self::Weather => "weather",
            Self::Socrata => "socrata",
            Self::Static => "static",
        }
    }
}

/// One `[[datasets.sources]]` entry.
///
/// Tokens arrive already resolved; nothing here reads the environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Raw partition variant; defaults to `{dataset}_{date}` when absent.
    pub variant: Option<String>,
    pub kind: Option<SourceKind>,
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub natural_key: Vec<String>,
    /// Socrata/static: field holding the row timestamp.
    pub date_field: Option<String>,
    /// Socrata: extra SoQL condition.
    pub filter: Option<String>,
    pub page_size: Option<usize>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timeout_secs: Option<u64>,
    /// Static: JSON file with saved rows.
    pub path: Option<PathBuf>,
    pub params: BTreeMap<String, String>,
}

impl SourceConfig {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }

    /// Name used in logs and errors.
    pub fn display_name(&self, dataset: &str) -> String {
        self.variant.clone().unwrap_or_else(|| dataset.to_string())
    }
}

fn required<'a>(name: &str, value: &'a Option<String>, what: &str) -> Result<&'a str, SourceError> {
    value
        .as_deref()
        .ok_or_else(|| SourceError::schema(name, format!("source config needs `{what}`")))
}

/// Build the adapter a source entry asks for.
///
/// Configuration mistakes are schema errors: they need a human to fix.
pub fn build_source(
    dataset: &str,
    config: &SourceConfig,
    tz: Tz,
    default_timeout: Duration,
) -> Result<Box<dyn SourceAdapter>, SourceError> {
    let name = config.display_name(dataset);
    let timeout = config
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);
    let kind = config
        .kind
        .ok_or_else(|| SourceError::schema(&name, "source config needs `kind`"))?;

    let source: Box<dyn SourceAdapter> = match kind {
        SourceKind::StopEvents => {
            let url = required(&name, &config.base_url, "base_url")?;
            Box::new(
                StopEventsSource::new(&name, url, timeout)
                    .with_token(config.token.clone())
                    .with_natural_key(config.natural_key.clone()),
            )
        }
        SourceKind::Weather => {
            let mut source = WeatherSource::new(&name, timeout);
            if let Some(url) = &config.base_url {
                source = source.with_base_url(url);
            }
            if let (Some(lat), Some(lon)) = (config.latitude, config.longitude) {
                source = source.with_location(lat, lon);
            }
            Box::new(source)
        }
        SourceKind::Socrata => {
            let url = required(&name, &config.base_url, "base_url")?;
            let date_field = required(&name, &config.date_field, "date_field")?;
            if config.natural_key.is_empty() {
                return Err(SourceError::schema(&name, "socrata source needs `natural_key`"));
            }
            let mut source = SocrataSource::new(
                &name,
                url,
                date_field,
                config.natural_key.clone(),
                tz,
                timeout,
            )
            .with_token(config.token.clone())
            .with_filter(config.filter.clone());
            if let Some(size) = config.page_size {
                source = source.with_page_size(size);
            }
            Box::new(source)
        }
        SourceKind::Static => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| SourceError::schema(&name, "source config needs `path`"))?;
            let date_field = required(&name, &config.date_field, "date_field")?;
            Box::new(StaticSource::from_json_file(
                &name,
                config.natural_key.clone(),
                path,
                date_field,
                tz,
            )?)
        }
    };

    log::debug!("{dataset}: source {name} ({})", kind.as_str());
    Ok(source)
}
