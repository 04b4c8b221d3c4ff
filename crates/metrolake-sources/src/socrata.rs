//! Socrata open-data APIs (data.ny.gov alerts, NYC permitted events)
//!
//! Pages are fetched lazily with `$limit`/`$offset` until a short page comes
//! back. Rows are ordered by the date field and `:id` so paging is stable.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use metrolake_core::{Record, SourceError, get_json, parse_timestamp};

use crate::adapter::{FetchWindow, RecordStream, SourceAdapter, http_to_source, record_from_object};

pub const DEFAULT_PAGE_SIZE: usize = 50_000;

/// MTA service alerts on data.ny.gov.
pub const OFFICIAL_ALERTS_URL: &str = "https://data.ny.gov/resource/7kct-peq7.json";
/// NYC permitted event information.
pub const NYC_EVENTS_URL: &str = "https://data.cityofnewyork.us/resource/tvpp-9vvx.json";

#[derive(Debug, Clone)]
pub struct SocrataSource {
    name: String,
    base_url: String,
    token: Option<String>,
    date_field: String,
    /// Extra SoQL condition ANDed to the date range.
    filter: Option<String>,
    page_size: usize,
    natural_key: Vec<String>,
    tz: Tz,
    timeout: Duration,
}

impl SocrataSource {
    pub fn new(
        name: &str,
        base_url: &str,
        date_field: &str,
        natural_key: Vec<String>,
        tz: Tz,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.to_string(),
            token: None,
            date_field: date_field.to_string(),
            filter: None,
            page_size: DEFAULT_PAGE_SIZE,
            natural_key,
            tz,
            timeout,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// SoQL `$where` for the window. Socrata stores floating local times.
    ///
    /// A resumed window starts strictly after the watermark.
    fn where_clause(&self, window: &FetchWindow) -> String {
        let fmt = "%Y-%m-%dT%H:%M:%S%.3f";
        let local = |ts: DateTime<Utc>| ts.with_timezone(&self.tz).format(fmt).to_string();
        let lower = match window.resume_point() {
            Some(after) => format!("{} > '{}'", self.date_field, local(after)),
            None => format!("{} >= '{}'", self.date_field, local(window.since)),
        };
        let mut clause = format!("{lower} AND {} < '{}'", self.date_field, local(window.until));
        if let Some(filter) = &self.filter {
            clause.push_str(&format!(" AND ({filter})"));
        }
        clause
    }

    fn page_query(&self, window: &FetchWindow, offset: usize) -> Vec<(String, String)> {
        vec![
            ("$where".into(), self.where_clause(window)),
            ("$order".into(), format!("{}, :id", self.date_field)),
            ("$limit".into(), self.page_size.to_string()),
            ("$offset".into(), offset.to_string()),
        ]
    }

    /// One page of records plus the raw row count (before skipping).
    fn fetch_page(
        &self,
        window: &FetchWindow,
        offset: usize,
    ) -> Result<(Vec<Record>, usize), SourceError> {
        let mut headers = Vec::new();
        if let Some(token) = &self.token {
            headers.push(("X-App-Token", token.as_str()));
        }
        log::debug!("{}: page offset={offset}", self.name);
        let body = get_json(&self.base_url, &self.page_query(window, offset), &headers, self.timeout)
            .map_err(|e| http_to_source(&self.name, e))?;
        let rows = body.as_array().map_or(0, Vec::len);
        let records = parse_page(&self.name, &body, &self.date_field, self.tz, Utc::now())?;
        Ok((records, rows))
    }
}

/// Rows without a usable date are skipped with a warning.
fn parse_page(
    name: &str,
    body: &serde_json::Value,
    date_field: &str,
    tz: Tz,
    ingested_at: DateTime<Utc>,
) -> Result<Vec<Record>, SourceError> {
    let rows = body
        .as_array()
        .ok_or_else(|| SourceError::schema(name, "expected a JSON array page"))?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let ts = row
            .get(date_field)
            .and_then(|v| v.as_str())
            .and_then(|s| parse_timestamp(s, tz));
        match ts {
            Some(ts) => records.push(record_from_object(name, row, ts, ingested_at)?),
            None => log::warn!("{name}: skipping row without valid {date_field:?}"),
        }
    }
    Ok(records)
}

/// Lazy page iterator.
struct Pages {
    source: SocrataSource,
    window: FetchWindow,
    offset: usize,
    buffer: VecDeque<Record>,
    done: bool,
}

impl Iterator for Pages {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            match self.source.fetch_page(&self.window, self.offset) {
                Ok((page, rows)) => {
                    self.done = rows < self.source.page_size;
                    self.offset += self.source.page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl SourceAdapter for SocrataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn natural_key(&self) -> &[String] {
        &self.natural_key
    }

    fn fetch(&self, window: &FetchWindow) -> Result<RecordStream, SourceError> {
        // First page eagerly so connection errors surface before streaming
        let (first, rows) = self.fetch_page(window, 0)?;
        Ok(Box::new(Pages {
            source: self.clone(),
            window: *window,
            offset: self.page_size,
            done: rows < self.page_size,
            buffer: first.into(),
        }))
    }
}
