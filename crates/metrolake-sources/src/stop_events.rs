//! GTFS stop-time events with computed delays
//!
//! The feed serves one JSON document per service date: either a bare array
//! of events or an object wrapping it under `data` or `events`. Times are
//! seconds after local midnight of the service day and may exceed 86 400 for
//! trips running past midnight; such events stay on their service date.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrolake_core::{Record, SourceError, get_json};

use crate::adapter::{FetchWindow, RecordStream, SourceAdapter, http_to_source, record_from_object};

/// Last representable second of a service day.
const LAST_SECOND: i64 = 86_399;

pub struct StopEventsSource {
    name: String,
    /// URL template; `{date}` is replaced by the service date.
    url_template: String,
    token: Option<String>,
    natural_key: Vec<String>,
    timeout: Duration,
}

impl StopEventsSource {
    pub fn new(name: &str, url_template: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            token: None,
            natural_key: ["match_key", "stop_id", "actual_seconds"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_natural_key(mut self, key: Vec<String>) -> Self {
        if !key.is_empty() {
            self.natural_key = key;
        }
        self
    }

    fn url_for(&self, window: &FetchWindow) -> String {
        self.url_template
            .replace("{date}", &window.date.format("%Y-%m-%d").to_string())
    }

    /// A resumed window asks only for events after the watermark, as
    /// seconds past the start of the service day.
    fn query(&self, window: &FetchWindow) -> Vec<(String, String)> {
        match window.resume_point() {
            Some(after) => {
                let offset = (after - window.since).num_seconds();
                vec![("after_seconds".into(), offset.to_string())]
            }
            None => Vec::new(),
        }
    }
}

/// Pull the event array out of the feed document.
fn event_rows(name: &str, body: serde_json::Value) -> Result<Vec<serde_json::Value>, SourceError> {
    match body {
        serde_json::Value::Array(rows) => Ok(rows),
        serde_json::Value::Object(mut obj) => {
            for field in ["data", "events"] {
                if let Some(serde_json::Value::Array(rows)) = obj.remove(field) {
                    return Ok(rows);
                }
            }
            Err(SourceError::schema(
                name,
                "expected an array or an object with `data`/`events`",
            ))
        }
        other => Err(SourceError::schema(
            name,
            format!("unexpected document type: {other}"),
        )),
    }
}

/// Event time: service-day start plus the actual (else scheduled) offset.
fn event_ts(row: &serde_json::Value, window: &FetchWindow) -> DateTime<Utc> {
    let seconds = ["actual_seconds", "scheduled_seconds"]
        .iter()
        .find_map(|f| row.get(*f).and_then(|v| v.as_f64()))
        .map(|s| (s as i64).clamp(0, LAST_SECOND))
        .unwrap_or(0);
    // Clamp keeps events inside the day even when the day is short (DST)
    let ts = window.since + chrono::Duration::seconds(seconds);
    ts.min(window.until - chrono::Duration::seconds(1))
}

fn parse_events(
    name: &str,
    body: serde_json::Value,
    window: &FetchWindow,
    ingested_at: DateTime<Utc>,
) -> Result<Vec<Record>, SourceError> {
    let rows = event_rows(name, body)?;
    let mut records = Vec::with_capacity(rows.len());
    for row in &rows {
        if matches!(row.get("match_key"), None | Some(serde_json::Value::Null)) {
            return Err(SourceError::schema(name, "event without match_key"));
        }
        let ts = event_ts(row, window);
        let mut record = record_from_object(name, row, ts, ingested_at)?;
        record.set("service_date", window.date.format("%Y-%m-%d").to_string());
        records.push(record);
    }
    Ok(records)
}

impl SourceAdapter for StopEventsSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    fn fetch(&self, window: &FetchWindow) -> Result<RecordStream, SourceError> {
        let url = self.url_for(window);
        log::debug!("{}: GET {url}", self.name);

        let mut headers = Vec::new();
        if let Some(token) = &self.token {
            headers.push(("Authorization", token.as_str()));
        }
        let body = get_json(&url, &self.query(window), &headers, self.timeout)
            .map_err(|e| http_to_source(&self.name, e))?;

        let records = parse_events(&self.name, body, window, Utc::now())?;
        Ok(Box::new(records.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use metrolake_core::{SERVICE_TZ, Value};
    use serde_json::json;

    fn window() -> FetchWindow {
        FetchWindow::for_date(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(), SERVICE_TZ)
    }

    #[test]
    fn url_template() {
        let source = StopEventsSource::new(
            "mta_delays",
            "https://feeds.example/delays/{date}.json",
            Duration::from_secs(5),
        );
        assert_eq!(
            source.url_for(&window()),
            "https://feeds.example/delays/2025-01-01.json"
        );
    }

    #[test]
    fn resumed_window_sends_offset() {
        let source = StopEventsSource::new(
            "mta_delays",
            "https://feeds.example/{date}.json",
            Duration::from_secs(5),
        );
        let w = window();
        assert!(source.query(&w).is_empty());
        let resumed = w.resuming_after(Some(w.since + chrono::Duration::seconds(30_600)));
        assert_eq!(
            source.query(&resumed),
            [("after_seconds".to_string(), "30600".to_string())]
        );
    }

    #[test]
    fn parses_wrapped_array() {
        let body = json!({"data": [{
            "match_key": "A_0800_N", "route_id": "A", "stop_id": "A02N",
            "scheduled_seconds": 28800, "actual_seconds": 28860, "delay_seconds": 60
        }]});
        let w = window();
        let records = parse_events("mta_delays", body, &w, Utc::now()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source_ts, w.since + chrono::Duration::seconds(28860));
        assert_eq!(records[0].get("delay_seconds"), Some(&Value::Int(60)));
        assert_eq!(records[0].get("service_date"), Some(&Value::from("2025-01-01")));
    }

    #[test]
    fn after_midnight_stays_on_service_date() {
        let body = json!([{"match_key": "1_2350_S", "stop_id": "101S", "actual_seconds": 90000}]);
        let w = window();
        let records = parse_events("mta_delays", body, &w, Utc::now()).unwrap();
        assert!(w.contains(records[0].source_ts));
    }

    #[test]
    fn falls_back_to_scheduled_time() {
        let body = json!([{"match_key": "k", "scheduled_seconds": 3600, "actual_seconds": null}]);
        let w = window();
        let records = parse_events("mta_delays", body, &w, Utc::now()).unwrap();
        assert_eq!(records[0].source_ts, w.since + chrono::Duration::hours(1));
    }

    #[test]
    fn missing_match_key_is_schema_error() {
        let body = json!([{"stop_id": "A02N"}]);
        assert!(matches!(
            parse_events("mta_delays", body, &window(), Utc::now()),
            Err(SourceError::Schema { .. })
        ));
    }

    #[test]
    fn unexpected_document_is_schema_error() {
        assert!(event_rows("mta_delays", json!({"rows": []})).is_err());
        assert!(event_rows("mta_delays", json!("nope")).is_err());
    }
}
