//! Open-Meteo hourly weather archive

use std::time::Duration;

use chrono::{DateTime, DurationRound, NaiveDateTime, TimeZone, Utc};
use metrolake_core::{Record, SourceError, Value, get_json};

use crate::adapter::{FetchWindow, RecordStream, SourceAdapter, http_to_source};

pub const ARCHIVE_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

/// Central Park.
pub const DEFAULT_LATITUDE: f64 = 40.78;
pub const DEFAULT_LONGITUDE: f64 = -73.97;

pub const HOURLY_FIELDS: &[&str] = &[
    "temperature_2m",
    "rain",
    "precipitation",
    "wind_speed_10m",
    "snowfall",
    "cloud_cover",
];

pub struct WeatherSource {
    name: String,
    base_url: String,
    latitude: f64,
    longitude: f64,
    natural_key: Vec<String>,
    timeout: Duration,
}

impl WeatherSource {
    pub fn new(name: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: ARCHIVE_URL.to_string(),
            latitude: DEFAULT_LATITUDE,
            longitude: DEFAULT_LONGITUDE,
            natural_key: vec!["time".to_string()],
            timeout,
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub fn with_location(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }

    /// The archive is queried by UTC date; the local day spans two of them.
    /// A resumed window asks for the hours after the watermark instead.
    fn query(&self, window: &FetchWindow) -> Vec<(String, String)> {
        let last = window.until - chrono::Duration::seconds(1);
        let mut query = vec![
            ("latitude".into(), self.latitude.to_string()),
            ("longitude".into(), self.longitude.to_string()),
        ];
        match window.resume_point().and_then(next_hour) {
            Some(first) => {
                let hour = "%Y-%m-%dT%H:%M";
                let last_hour = window.until - chrono::Duration::hours(1);
                query.push(("start_hour".into(), first.format(hour).to_string()));
                query.push(("end_hour".into(), last_hour.format(hour).to_string()));
            }
            None => {
                query.push(("start_date".into(), window.since.format("%Y-%m-%d").to_string()));
                query.push(("end_date".into(), last.format("%Y-%m-%d").to_string()));
            }
        }
        query.push(("hourly".into(), HOURLY_FIELDS.join(",")));
        query.push(("timezone".into(), "GMT".into()));
        query
    }
}

/// First whole hour strictly after `ts`.
fn next_hour(ts: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor = ts.duration_trunc(chrono::Duration::hours(1)).ok()?;
    Some(floor + chrono::Duration::hours(1))
}

/// Turn the column-oriented `hourly` block into one record per hour.
fn parse_hourly(
    name: &str,
    body: &serde_json::Value,
    ingested_at: DateTime<Utc>,
) -> Result<Vec<Record>, SourceError> {
    let hourly = body
        .get("hourly")
        .and_then(|h| h.as_object())
        .ok_or_else(|| SourceError::schema(name, "response has no `hourly` block"))?;
    let times = hourly
        .get("time")
        .and_then(|t| t.as_array())
        .ok_or_else(|| SourceError::schema(name, "missing hourly.time"))?;

    let mut columns = Vec::with_capacity(HOURLY_FIELDS.len());
    for field in HOURLY_FIELDS {
        let values = hourly
            .get(*field)
            .and_then(|v| v.as_array())
            .ok_or_else(|| SourceError::schema(name, format!("missing hourly.{field}")))?;
        if values.len() != times.len() {
            return Err(SourceError::schema(
                name,
                format!(
                    "hourly.{field} has {} values for {} timestamps",
                    values.len(),
                    times.len()
                ),
            ));
        }
        columns.push((*field, values));
    }

    let mut records = Vec::with_capacity(times.len());
    for (i, time) in times.iter().enumerate() {
        let text = time
            .as_str()
            .ok_or_else(|| SourceError::schema(name, format!("bad timestamp {time}")))?;
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M")
            .map_err(|e| SourceError::schema(name, format!("bad timestamp {text:?}: {e}")))?;
        let ts = Utc.from_utc_datetime(&naive);

        let mut record = Record::new(ts, ingested_at).with("time", ts);
        for (field, values) in &columns {
            record.set(field, Value::from_json(&values[i]));
        }
        records.push(record);
    }
    Ok(records)
}

impl SourceAdapter for WeatherSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    fn fetch(&self, window: &FetchWindow) -> Result<RecordStream, SourceError> {
        let body = get_json(&self.base_url, &self.query(window), &[], self.timeout)
            .map_err(|e| http_to_source(&self.name, e))?;
        let records = parse_hourly(&self.name, &body, Utc::now())?;
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}
