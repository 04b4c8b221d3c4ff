//! Fixed record source: tests and replays of saved payloads

use std::path::Path;

use chrono::Utc;
use chrono_tz::Tz;
use metrolake_core::{Record, SourceError, parse_timestamp};

use crate::adapter::{FetchWindow, RecordStream, SourceAdapter, record_from_object};

/// Serves a fixed set of records, ignoring the window (drain filters).
#[derive(Debug, Clone)]
pub struct StaticSource {
    name: String,
    natural_key: Vec<String>,
    records: Vec<Record>,
    /// Error raised instead of records, for failure injection.
    failure: Option<SourceError>,
}

impl StaticSource {
    pub fn new(name: &str, natural_key: &[&str], records: Vec<Record>) -> Self {
        Self {
            name: name.to_string(),
            natural_key: natural_key.iter().map(|s| s.to_string()).collect(),
            records,
            failure: None,
        }
    }

    /// Source that always fails with `error`.
    pub fn failing(name: &str, natural_key: &[&str], error: SourceError) -> Self {
        let mut source = Self::new(name, natural_key, Vec::new());
        source.failure = Some(error);
        source
    }

    /// Load a JSON array of objects saved from an upstream API.
    ///
    /// `date_field` gives each row its source timestamp (naive values are
    /// local to `tz`). Rows without a parseable timestamp are a schema error.
    pub fn from_json_file(
        name: &str,
        natural_key: Vec<String>,
        path: &Path,
        date_field: &str,
        tz: Tz,
    ) -> Result<Self, SourceError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SourceError::schema(name, format!("{}: {e}", path.display())))?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&text)
            .map_err(|e| SourceError::schema(name, format!("{}: {e}", path.display())))?;

        let ingested_at = Utc::now();
        let records = rows
            .iter()
            .map(|row| {
                let ts = row
                    .get(date_field)
                    .and_then(|v| v.as_str())
                    .and_then(|s| parse_timestamp(s, tz))
                    .ok_or_else(|| {
                        SourceError::schema(name, format!("row without valid {date_field:?}"))
                    })?;
                record_from_object(name, row, ts, ingested_at)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            natural_key,
            records,
            failure: None,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl SourceAdapter for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    fn fetch(&self, _window: &FetchWindow) -> Result<RecordStream, SourceError> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(Box::new(self.records.clone().into_iter().map(Ok)))
    }
}
