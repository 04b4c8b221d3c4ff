//! Draining behaviour across adapters

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use metrolake_core::{Record, Retryable, SERVICE_TZ, SourceError, Value};
use metrolake_sources::{FetchWindow, RecordStream, SourceAdapter, StaticSource, drain};

fn window() -> FetchWindow {
    FetchWindow::for_date(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(), SERVICE_TZ)
}

fn hour(h: i64) -> DateTime<Utc> {
    window().since + Duration::hours(h)
}

/// Yields a few records, then drops the connection.
struct FlakyFeed {
    key: Vec<String>,
    good: usize,
}

impl SourceAdapter for FlakyFeed {
    fn name(&self) -> &str {
        "clima"
    }

    fn natural_key(&self) -> &[String] {
        &self.key
    }

    fn fetch(&self, _window: &FetchWindow) -> Result<RecordStream, SourceError> {
        let now = Utc::now();
        let records = (0..self.good as i64)
            .map(move |h| Ok(Record::new(hour(h), now).with("time", hour(h))));
        let failure = std::iter::once(Err(SourceError::unavailable("clima", "connection reset")));
        Ok(Box::new(records.chain(failure)))
    }
}

#[test]
fn mid_stream_failure_is_transient_and_yields_nothing() {
    let feed = FlakyFeed {
        key: vec!["time".into()],
        good: 5,
    };
    let err = drain(&feed, &window()).unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn overlapping_batches_keep_latest_ingestion() {
    let first_fetch = Utc.with_ymd_and_hms(2025, 3, 11, 1, 0, 0).unwrap();
    let second_fetch = first_fetch + Duration::hours(1);

    let mut rows = Vec::new();
    for h in 0..3 {
        rows.push(
            Record::new(hour(h), first_fetch)
                .with("time", hour(h))
                .with("temperature_2m", 1.0),
        );
    }
    // Second batch overlaps hour 2 with a corrected reading, out of order
    rows.insert(
        0,
        Record::new(hour(2), second_fetch)
            .with("time", hour(2))
            .with("temperature_2m", 2.5),
    );
    rows.push(
        Record::new(hour(3), second_fetch)
            .with("time", hour(3))
            .with("temperature_2m", 3.0),
    );

    let out = drain(&StaticSource::new("clima", &["time"], rows), &window()).unwrap();
    assert_eq!(out.records.len(), 4);
    assert_eq!(out.duplicates, 1);

    let times: Vec<_> = out.records.iter().map(|r| r.source_ts).collect();
    assert!(times.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(out.records[2].ingested_at, second_fetch);
    assert_eq!(out.records[2].get("temperature_2m"), Some(&Value::Float(2.5)));
}

#[test]
fn resume_skips_already_ingested_range() {
    let now = Utc::now();
    let rows: Vec<Record> = (0..6)
        .map(|h| Record::new(hour(h), now).with("time", hour(h)))
        .collect();
    let source = StaticSource::new("clima", &["time"], rows);

    let resumed = window().resuming_after(Some(hour(3)));
    let out = drain(&source, &resumed).unwrap();
    assert_eq!(out.records.len(), 2);
    assert_eq!(out.records[0].source_ts, hour(4));
}
