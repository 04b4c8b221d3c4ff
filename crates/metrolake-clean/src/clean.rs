//! processed → cleaned: the cleaning and validation stage
//!
//! Order of operations:
//! 1. defaults fill missing fields
//! 2. declared fields are coerced; a failing record is dropped and counted
//! 3. the coercion-failure ratio is checked against the validation gate
//! 4. deduplicate by natural key, latest ingestion wins
//! 5. events with affected stops are exploded to one row per stop
//! 6. outlier flags, calendar features, derivations
//!
//! Per-record problems never abort the partition; only the gate does.
//! Datasets with splits are then cut into one output per split with
//! [`take_split`].

use chrono::NaiveDate;
use chrono_tz::Tz;
use metrolake_core::{
    CoercionError, Record, SERVICE_TZ, ValidationFailure, Value, dedup_by_natural_key,
    sort_canonical,
};

use crate::coerce::coerce;
use crate::features::{add_calendar_features, apply_defaults};
use crate::report::{FieldStats, QualityReport};
use crate::schema::{DatasetSchema, Split};

pub const DEFAULT_MAX_COERCION_FAILURE_RATIO: f64 = 0.5;

/// Settings for one cleaning run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleanContext {
    pub date: NaiveDate,
    pub tz: Tz,
    /// Partitions losing a larger share of rows to coercion fail validation.
    pub max_coercion_failure_ratio: f64,
}

impl CleanContext {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            tz: SERVICE_TZ,
            max_coercion_failure_ratio: DEFAULT_MAX_COERCION_FAILURE_RATIO,
        }
    }

    pub fn with_tz(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    pub fn with_max_ratio(mut self, ratio: f64) -> Self {
        self.max_coercion_failure_ratio = ratio;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Cleaned {
    pub records: Vec<Record>,
    pub report: QualityReport,
}

/// Coerce every declared field in place. The first failure wins.
fn coerce_record(
    record: &mut Record,
    schema: &DatasetSchema,
    tz: Tz,
) -> Result<(), CoercionError> {
    for declared in &schema.fields {
        let current = record.fields.get(&declared.name).cloned().unwrap_or(Value::Null);
        let coerced = coerce(&declared.name, &current, declared.ty, tz)?;
        if declared.required && coerced.is_null() {
            return Err(CoercionError {
                field: declared.name.clone(),
                value: String::new(),
                expected: "required value",
            });
        }
        record.set(&declared.name, coerced);
    }
    Ok(())
}

/// Prior-day records go through the same coercion; failures are ignored.
fn coerce_prior(prior: &[Record], schema: &DatasetSchema, tz: Tz) -> Vec<Record> {
    prior
        .iter()
        .filter_map(|r| {
            let mut r = r.clone();
            apply_defaults(&mut r, &schema.defaults);
            coerce_record(&mut r, schema, tz).ok().map(|()| r)
        })
        .collect()
}

/// Clean one processed partition.
///
/// `prior` holds the previous day's processed records (possibly empty) and
/// only seeds history-based features; it never appears in the output.
pub fn clean(
    records: Vec<Record>,
    prior: &[Record],
    schema: &DatasetSchema,
    ctx: &CleanContext,
) -> Result<Cleaned, ValidationFailure> {
    let label = format!("cleaned/{}/{}", schema.name, ctx.date);
    let mut report = QualityReport::new(&schema.name, ctx.date);
    report.rows_in = records.len();

    let mut coerced = Vec::with_capacity(records.len());
    for mut record in records {
        apply_defaults(&mut record, &schema.defaults);
        match coerce_record(&mut record, schema, ctx.tz) {
            Ok(()) => coerced.push(record),
            Err(e) => {
                log::debug!("{label}: dropping record: {e}");
                report.coercion_failures += 1;
                *report.coercion_failures_by_field.entry(e.field).or_insert(0) += 1;
            }
        }
    }

    if report.coercion_failures > 0 {
        log::warn!(
            "{label}: {} of {} records failed coercion",
            report.coercion_failures,
            report.rows_in
        );
    }
    let ratio = report.coercion_failure_ratio();
    if ratio > ctx.max_coercion_failure_ratio {
        return Err(ValidationFailure {
            partition: label,
            reason: format!(
                "{:.1}% of records failed coercion (limit {:.1}%)",
                ratio * 100.0,
                ctx.max_coercion_failure_ratio * 100.0
            ),
        });
    }

    let (mut records, duplicates) = dedup_by_natural_key(coerced, &schema.natural_key);
    report.duplicates_removed = duplicates;

    let row_key = schema.row_key();
    if let Some(rule) = &schema.stops {
        if rule.directory.is_none() {
            log::warn!("{label}: no stop directory, {} left unmapped", rule.id_field);
        }
        let exploded = rule.explode(records);
        report.dropped_without_stops = exploded.without_stops;
        report.unmapped_stops = exploded.unmapped;
        let (rows, duplicates) = dedup_by_natural_key(exploded.records, &row_key);
        report.duplicates_removed += duplicates;
        records = rows;
    }

    for bounds in &schema.bounds {
        let flag = bounds.flag_name();
        for r in records.iter_mut() {
            let out = r
                .get(&bounds.field)
                .and_then(Value::as_f64)
                .is_some_and(|v| !bounds.contains(v));
            r.set(&flag, out);
        }
    }

    if schema.calendar {
        add_calendar_features(&mut records, ctx.tz);
    }
    let prior = if schema.derivations.is_empty() {
        Vec::new()
    } else {
        coerce_prior(prior, schema, ctx.tz)
    };
    for derivation in &schema.derivations {
        derivation.apply(&mut records, &prior);
    }

    sort_canonical(&mut records, &row_key);
    summarize(&mut report, &records, schema);

    log::debug!(
        "{label}: {} → {} records, {} duplicates, {} outliers flagged",
        report.rows_in,
        report.rows_out,
        report.duplicates_removed,
        report.total_outliers()
    );
    Ok(Cleaned { records, report })
}

/// Output counts, nulls, outliers and stats over `records`.
fn summarize(report: &mut QualityReport, records: &[Record], schema: &DatasetSchema) {
    report.rows_out = records.len();
    report.count_nulls(records);
    report.outliers_flagged.clear();
    report.stats.clear();
    for bounds in &schema.bounds {
        let flag = bounds.flag_name();
        let flagged = records
            .iter()
            .filter(|r| r.get(&flag) == Some(&Value::Bool(true)))
            .count();
        report.outliers_flagged.insert(bounds.field.clone(), flagged);
        if let Some(stats) = FieldStats::compute(records, &bounds.field) {
            report.stats.insert(bounds.field.clone(), stats);
        }
    }
}

/// The rows of one split of a cleaned partition, with a report of their own.
pub fn take_split(cleaned: &Cleaned, split: &Split, schema: &DatasetSchema) -> Cleaned {
    let mut report = cleaned.report.clone();
    report.split = Some(split.name.clone());
    report.dropped_incomplete = 0;

    let mut records = Vec::new();
    for r in cleaned.records.iter().filter(|r| split.contains(r)) {
        if split.is_complete(r) {
            records.push(r.clone());
        } else {
            report.dropped_incomplete += 1;
        }
    }
    if report.dropped_incomplete > 0 {
        log::debug!(
            "{}/{}: {} rows lack a required field",
            schema.name,
            split.name,
            report.dropped_incomplete
        );
    }
    summarize(&mut report, &records, schema);
    Cleaned { records, report }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::builtin;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()
    }

    fn ctx() -> CleanContext {
        CleanContext::new(date())
    }

    fn midnight() -> DateTime<Utc> {
        // 2025-01-02 00:00 in New York
        Utc.with_ymd_and_hms(2025, 1, 2, 5, 0, 0).unwrap()
    }

    fn stop_event(trip: &str, stop: &str, actual: i64, delay: Value, ingested: i64) -> Record {
        Record::new(
            midnight() + Duration::seconds(actual),
            midnight() + Duration::days(1) + Duration::minutes(ingested),
        )
        .with("match_key", trip)
        .with("stop_id", stop)
        .with("route_id", "A")
        .with("actual_seconds", actual)
        .with("scheduled_seconds", actual - 60)
        .with("delay_seconds", delay)
        .with("is_unscheduled", "false")
    }

    #[test]
    fn dedup_keeps_later_ingestion() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let older = stop_event("A_0800", "A02N", 28_800, Value::Int(60), 0);
        let newer = stop_event("A_0800", "A02N", 28_800, Value::Int(75), 30);

        let out = clean(vec![newer, older], &[], schema, &ctx()).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].get("delay_seconds"), Some(&Value::Int(75)));
        assert_eq!(out.report.duplicates_removed, 1);
    }

    #[test]
    fn coercion_failure_drops_only_that_record() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let records = vec![
            stop_event("A_0800", "A02N", 28_800, Value::from("60"), 0),
            stop_event("A_0800", "A03N", 28_900, Value::from("late"), 0),
            stop_event("A_0800", "A04N", 29_000, Value::Int(90), 0),
        ];
        let out = clean(records, &[], schema, &ctx()).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.report.coercion_failures, 1);
        assert_eq!(out.report.coercion_failures_by_field["delay_seconds"], 1);
        assert_eq!(out.records[0].get("delay_seconds"), Some(&Value::Int(60)));
        assert_eq!(out.records[0].get("is_unscheduled"), Some(&Value::Bool(false)));
    }

    #[test]
    fn too_many_failures_fail_validation() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let records = vec![
            stop_event("A", "s1", 100, Value::from("x"), 0),
            stop_event("A", "s2", 200, Value::from("y"), 0),
            stop_event("A", "s3", 300, Value::Int(1), 0),
        ];
        let err = clean(records, &[], schema, &ctx()).unwrap_err();
        assert!(err.partition.contains("gtfs_with_delays"));
        assert!(err.reason.contains("coercion"));
    }

    #[test]
    fn outliers_are_flagged_not_dropped() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let records = vec![
            stop_event("A", "s1", 100, Value::Int(12_000), 0),
            stop_event("A", "s2", 200, Value::Int(30), 0),
        ];
        let out = clean(records, &[], schema, &ctx()).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.report.outliers_flagged["delay_seconds"], 1);
        assert_eq!(out.records[0].get("delay_seconds_outlier"), Some(&Value::Bool(true)));
        assert_eq!(out.records[1].get("delay_seconds_outlier"), Some(&Value::Bool(false)));
        let stats = &out.report.stats["delay_seconds"];
        assert_eq!(stats.max, 12_000.0);
    }

    #[test]
    fn lag_seeded_from_prior_day_processed_records() {
        let schema = builtin("gtfs_with_delays").unwrap();
        // Prior processed rows still carry raw string types
        let prior = vec![
            stop_event("A_2350", "A40S", 85_000, Value::from("45"), 0),
        ];
        let records = vec![stop_event("A_2350", "A41S", 100, Value::Int(50), 0)];
        let out = clean(records, &prior, schema, &ctx()).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].get("lagged_delay_1"), Some(&Value::Int(45)));
        assert_eq!(out.records[0].get("lagged_delay_2"), None);
    }

    #[test]
    fn events_defaults_and_renamed_fields() {
        let schema = builtin("eventos_nyc").unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 15, 0, 0).unwrap();
        let record = Record::new(ts, ts)
            .with("nombre_evento", "Winter Jam")
            .with("fecha_inicio", "2025-01-02T10:00:00");
        let out = clean(vec![record], &[], schema, &ctx()).unwrap();
        let r = &out.records[0];
        assert_eq!(r.get("score"), Some(&Value::Float(1.0)));
        assert_eq!(r.get("fecha_final"), r.get("fecha_inicio"));
        assert!(matches!(r.get("fecha_inicio"), Some(Value::Timestamp(_))));
        assert_eq!(r.get("period_of_day"), Some(&Value::from("midday")));
    }

    #[test]
    fn missing_required_field_drops_record() {
        let schema = builtin("clima").unwrap();
        let ts = midnight();
        let ok = Record::new(ts, ts).with("time", ts).with("temperature_2m", 1.0);
        let missing = Record::new(ts + Duration::hours(1), ts).with("time", ts + Duration::hours(1));
        let out = clean(vec![ok, missing], &[], schema, &ctx()).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.report.coercion_failures_by_field["temperature_2m"], 1);
    }

    #[test]
    fn output_is_order_independent() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let rows = vec![
            stop_event("A", "s1", 100, Value::Int(1), 0),
            stop_event("B", "s1", 150, Value::Int(2), 0),
            stop_event("A", "s2", 200, Value::Int(3), 0),
        ];
        let mut reversed = rows.clone();
        reversed.reverse();
        let one = clean(rows, &[], schema, &ctx()).unwrap();
        let two = clean(reversed, &[], schema, &ctx()).unwrap();
        assert_eq!(one.records, two.records);
    }

    #[test]
    fn gtfs_features_and_splits() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let mut unscheduled = stop_event("X_0900", "A05S", 32_400, Value::Int(0), 0)
            .with("is_unscheduled", "true");
        unscheduled.remove("scheduled_seconds");
        let mut no_route = stop_event("B_0800", "A06N", 28_950, Value::Int(5), 0);
        no_route.remove("route_id");
        let records = vec![
            stop_event("A_0800", "A02N", 28_800, Value::Int(60), 0).with("trip_uid", "t1"),
            stop_event("A_0800", "A03N", 29_100, Value::Int(120), 0).with("trip_uid", "t1"),
            no_route,
            unscheduled,
        ];
        let out = clean(records, &[], schema, &ctx()).unwrap();
        assert_eq!(out.records.len(), 4);

        let second = out
            .records
            .iter()
            .find(|r| r.get("stop_id") == Some(&Value::from("A03N")))
            .unwrap();
        assert_eq!(second.get("route_rolling_delay"), Some(&Value::Float(60.0)));
        assert_eq!(second.get("rolling_mean_delay_trip"), Some(&Value::Float(60.0)));
        assert_eq!(second.get("trip_progress"), Some(&Value::Float(1.0)));
        assert_eq!(second.get("actual_time"), Some(&Value::from("08:05:00")));
        assert_eq!(second.get("direction"), Some(&Value::from("N")));

        let [scheduled_split, unscheduled_split] = &schema.splits[..] else {
            panic!("gtfs has two splits");
        };
        let scheduled = take_split(&out, scheduled_split, schema);
        assert_eq!(scheduled.records.len(), 2);
        assert_eq!(scheduled.report.dropped_incomplete, 1);
        assert_eq!(scheduled.report.rows_out, 2);
        assert_eq!(scheduled.report.split.as_deref(), Some("gtfs_scheduled"));
        assert_eq!(scheduled.report.stats["delay_seconds"].max, 120.0);

        let unscheduled = take_split(&out, unscheduled_split, schema);
        assert_eq!(unscheduled.records.len(), 1);
        assert_eq!(unscheduled.records[0].get("scheduled_time"), None);
        assert_eq!(unscheduled.report.stats["delay_seconds"].count, 1);
    }

    #[test]
    fn events_explode_to_directional_stops() {
        use crate::stops::StopDirectory;
        use std::sync::Arc;

        let mut directory = StopDirectory::default();
        directory.insert("34 St-Penn Station", &["A28N", "A28S", "128"]);
        let schema = builtin("eventos_nyc")
            .unwrap()
            .clone()
            .with_stop_directory(Arc::new(directory));
        let ts = Utc.with_ymd_and_hms(2025, 1, 2, 15, 0, 0).unwrap();
        let event = |name: &str, stops: &str, ingested: i64| {
            Record::new(ts, ts + Duration::minutes(ingested))
                .with("nombre_evento", name)
                .with("fecha_inicio", "2025-01-02T10:00:00")
                .with("paradas_afectadas", stops)
        };
        let stops = r#"[["34 St-Penn Station", "A C E"], ["34 St-Penn Station", "A C E"]]"#;
        let records = vec![
            event("Knicks vs Celtics", stops, 0),
            event("Knicks vs Celtics", stops, 5),
            event("Street Fair", "[]", 0),
        ];
        let out = clean(records, &[], &schema, &ctx()).unwrap();

        let ids: Vec<_> = out.records.iter().filter_map(|r| r.get("stop_id").cloned()).collect();
        assert_eq!(ids, [Value::from("A28N"), Value::from("A28S")]);
        assert_eq!(out.report.dropped_without_stops, 1);
        // one re-ingested event, then one repeated stop pair
        assert_eq!(out.report.duplicates_removed, 3);
        assert_eq!(out.records[0].get("parada_lineas"), Some(&Value::from("A C E")));
        assert_eq!(out.records[0].get("paradas_afectadas"), None);
    }

    #[test]
    fn rush_hour_follows_local_hour() {
        let schema = builtin("clima").unwrap();
        let at = |h: i64| {
            let ts = midnight() + Duration::hours(h);
            Record::new(ts, ts).with("time", ts).with("temperature_2m", 1.0)
        };
        let out = clean(vec![at(8), at(12)], &[], schema, &ctx()).unwrap();
        assert_eq!(out.records[0].get("is_rush_hour"), Some(&Value::Bool(true)));
        assert_eq!(out.records[1].get("is_rush_hour"), Some(&Value::Bool(false)));
    }

    #[test]
    fn empty_partition_cleans_to_empty() {
        let out = clean(Vec::new(), &[], builtin("clima").unwrap(), &ctx()).unwrap();
        assert!(out.records.is_empty());
        assert_eq!(out.report.rows_in, 0);
    }
}
