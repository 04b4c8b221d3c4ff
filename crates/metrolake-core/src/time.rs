//! Calendar helpers: local service days and upstream timestamp parsing

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Timezone the subway runs on; partition dates are local service days.
pub const SERVICE_TZ: Tz = chrono_tz::America::New_York;

/// Naive layouts accepted from upstream APIs, tried in order.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Interpret a local wall-clock time in `tz`.
///
/// Times skipped by a DST jump resolve to the first valid instant after
/// them; ambiguous times take the earlier offset.
pub fn local_to_utc(naive: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    let mut candidate = naive;
    // A DST gap is at most an hour; step forward until the clock exists
    for _ in 0..=60 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return dt.with_timezone(&Utc);
        }
        candidate += chrono::Duration::minutes(1);
    }
    Utc.from_utc_datetime(&naive)
}

/// `[start, end)` of a local calendar day, in UTC.
pub fn day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_to_utc(date.and_time(chrono::NaiveTime::MIN), tz);
    let next = date.succ_opt().unwrap_or(date);
    let end = local_to_utc(next.and_time(chrono::NaiveTime::MIN), tz);
    (start, end)
}

/// Local calendar date of an instant.
pub fn local_date(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// Parse an upstream timestamp.
///
/// RFC 3339 strings carry their own offset. Naive date-times (Socrata
/// "floating timestamps") and bare dates are read as local time in `tz`.
pub fn parse_timestamp(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(local_to_utc(naive, tz));
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .map(|d| local_to_utc(d.and_time(chrono::NaiveTime::MIN), tz))
}

/// Iterate `start..=end` one day at a time.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn day_bounds_winter_offset() {
        let (start, end) = day_bounds(d(2025, 1, 1), SERVICE_TZ);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 2, 5, 0, 0).unwrap());
    }

    #[test]
    fn dst_start_day_is_23_hours() {
        let (start, end) = day_bounds(d(2025, 3, 9), SERVICE_TZ);
        assert_eq!((end - start).num_hours(), 23);
    }

    #[test]
    fn parse_rfc3339_keeps_offset() {
        let ts = parse_timestamp("2025-03-10T12:00:00Z", SERVICE_TZ).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap());
    }

    #[test]
    fn parse_floating_timestamp_as_local() {
        let ts = parse_timestamp("2025-03-10T08:15:00.000", SERVICE_TZ).unwrap();
        // EDT (UTC-4) after the March 9 switch
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 3, 10, 12, 15, 0).unwrap());
    }

    #[test]
    fn parse_skipped_local_time_moves_forward() {
        let ts = parse_timestamp("2025-03-09 02:30:00", SERVICE_TZ).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2025, 3, 9, 7, 0, 0).unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(parse_timestamp("yesterday", SERVICE_TZ), None);
        assert_eq!(parse_timestamp("", SERVICE_TZ), None);
    }

    #[test]
    fn date_range_inclusive() {
        let days: Vec<_> = date_range(d(2025, 1, 30), d(2025, 2, 2)).collect();
        assert_eq!(days.len(), 4);
        assert_eq!(days[3], d(2025, 2, 2));
        assert_eq!(date_range(d(2025, 1, 2), d(2025, 1, 1)).count(), 0);
    }

    #[test]
    fn local_date_crosses_midnight() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 3, 0, 0).unwrap();
        assert_eq!(local_date(ts, SERVICE_TZ), d(2025, 1, 1));
    }
}
