//! Source adapter capability and window draining

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use metrolake_core::{
    HttpError, Record, Retryable, SourceError, day_bounds, dedup_by_natural_key, sort_canonical,
};

/// Lazy stream of records from one upstream fetch.
pub type RecordStream = Box<dyn Iterator<Item = Result<Record, SourceError>> + Send>;

/// Time range requested from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    /// Inclusive.
    pub since: DateTime<Utc>,
    /// Exclusive.
    pub until: DateTime<Utc>,
    /// Exclusive watermark: records at or before it were already ingested.
    pub resume_after: Option<DateTime<Utc>>,
    /// Local service date the window covers.
    pub date: NaiveDate,
    pub tz: Tz,
}

impl FetchWindow {
    /// Window covering one local service day.
    pub fn for_date(date: NaiveDate, tz: Tz) -> Self {
        let (since, until) = day_bounds(date, tz);
        Self {
            since,
            until,
            resume_after: None,
            date,
            tz,
        }
    }

    pub fn resuming_after(mut self, watermark: Option<DateTime<Utc>>) -> Self {
        self.resume_after = watermark;
        self
    }

    /// Watermark at or past the window start: the request only needs what
    /// came after it.
    pub fn resume_point(&self) -> Option<DateTime<Utc>> {
        self.resume_after.filter(|w| *w >= self.since)
    }

    /// Everything the window could return was already ingested.
    pub fn is_exhausted(&self) -> bool {
        self.resume_after.is_some_and(|w| w >= self.until)
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.since && ts < self.until && !matches!(self.resume_after, Some(w) if ts <= w)
    }
}

/// One upstream feed.
pub trait SourceAdapter: Send + Sync {
    /// Variant name; becomes the raw partition variant.
    fn name(&self) -> &str;

    /// Fields identifying a record across fetches.
    fn natural_key(&self) -> &[String];

    /// Start fetching. Errors before the first record are returned here,
    /// later ones come through the stream.
    fn fetch(&self, window: &FetchWindow) -> Result<RecordStream, SourceError>;
}

/// Result of draining a source for one window.
#[derive(Debug, Clone, Default)]
pub struct Drained {
    /// Deduplicated, in canonical order.
    pub records: Vec<Record>,
    pub fetched: usize,
    pub out_of_window: usize,
    pub duplicates: usize,
}

impl Drained {
    /// Latest source timestamp kept, for watermarking.
    pub fn max_source_ts(&self) -> Option<DateTime<Utc>> {
        self.records.iter().map(|r| r.source_ts).max()
    }
}

/// Fetch everything for `window`, filter, deduplicate and sort.
///
/// The result does not depend on the order in which the upstream returned
/// records.
pub fn drain(adapter: &dyn SourceAdapter, window: &FetchWindow) -> Result<Drained, SourceError> {
    if window.is_exhausted() {
        log::debug!("{}: window already ingested, not fetching", adapter.name());
        return Ok(Drained::default());
    }

    let mut kept = Vec::new();
    let mut fetched = 0usize;
    let mut out_of_window = 0usize;

    for item in adapter.fetch(window)? {
        let record = item?;
        fetched += 1;
        if window.contains(record.source_ts) {
            kept.push(record);
        } else {
            out_of_window += 1;
        }
    }

    let key = adapter.natural_key();
    let (mut records, duplicates) = dedup_by_natural_key(kept, key);
    sort_canonical(&mut records, key);

    log::debug!(
        "{}: fetched {fetched}, kept {}, {duplicates} duplicates, {out_of_window} outside window",
        adapter.name(),
        records.len()
    );
    Ok(Drained {
        records,
        fetched,
        out_of_window,
        duplicates,
    })
}

/// Classify an HTTP failure: retryable ones mean the source is unavailable,
/// the rest mean the request or payload is wrong.
pub(crate) fn http_to_source(name: &str, e: HttpError) -> SourceError {
    if e.is_retryable() {
        SourceError::unavailable(name, e.to_string())
    } else {
        SourceError::schema(name, e.to_string())
    }
}

/// Build a record from one JSON object, every member becoming a field.
pub(crate) fn record_from_object(
    name: &str,
    row: &serde_json::Value,
    source_ts: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
) -> Result<Record, SourceError> {
    let obj = row
        .as_object()
        .ok_or_else(|| SourceError::schema(name, format!("expected JSON object, got {row}")))?;
    let mut record = Record::new(source_ts, ingested_at);
    for (field, value) in obj {
        record.set(field, metrolake_core::Value::from_json(value));
    }
    Ok(record)
}
