//! Dataset declarations: natural keys, typed fields, bounds, derivations
//!
//! The built-in datasets mirror what the subway project ingests. Field names
//! follow the upstream APIs, except for events, which are renamed to the
//! Spanish names the downstream notebooks expect.

use std::sync::{Arc, LazyLock};

use metrolake_core::{Record, Value};
use serde::{Deserialize, Serialize};

use crate::coerce::FieldType;
use crate::features::{CmpOp, Derivation, Fill};
use crate::stops::{StopDirectory, StopExplode};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    /// Null after coercion drops the record.
    pub required: bool,
}

/// Inclusive numeric bounds; values outside are flagged, never dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl Bounds {
    pub fn new(field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            field: field.to_string(),
            min,
            max,
        }
    }

    pub fn contains(&self, v: f64) -> bool {
        self.min.map_or(true, |m| v >= m) && self.max.map_or(true, |m| v <= m)
    }

    /// Name of the flag column.
    pub fn flag_name(&self) -> String {
        format!("{}_outlier", self.field)
    }
}

/// A cleaned output holding the rows whose boolean `field` equals `value`.
///
/// Rows missing the flag count as `when_missing`. Rows of the split that
/// lack any `required` field are left out.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    /// Variant prefix of the split's cleaned partition.
    pub name: String,
    pub field: String,
    pub value: bool,
    pub when_missing: bool,
    pub required: Vec<String>,
}

impl Split {
    pub fn contains(&self, r: &Record) -> bool {
        let flag = match r.get(&self.field) {
            Some(Value::Bool(b)) => *b,
            _ => self.when_missing,
        };
        flag == self.value
    }

    pub fn is_complete(&self, r: &Record) -> bool {
        self.required.iter().all(|f| r.get(f).is_some())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSchema {
    pub name: String,
    /// Field names after renaming.
    pub natural_key: Vec<String>,
    /// `(from, to)` applied in the processed layer.
    pub renames: Vec<(String, String)>,
    pub defaults: Vec<(String, Fill)>,
    /// Undeclared fields pass through untouched.
    pub fields: Vec<FieldSpec>,
    pub bounds: Vec<Bounds>,
    pub derivations: Vec<Derivation>,
    /// Add hour/dow/period features from the event time.
    pub calendar: bool,
    /// One row per affected stop.
    pub stops: Option<StopExplode>,
    /// Cleaned outputs; empty means one output with every row.
    pub splits: Vec<Split>,
}

impl DatasetSchema {
    pub fn new(name: &str, natural_key: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            natural_key: strings(natural_key),
            renames: Vec::new(),
            defaults: Vec::new(),
            fields: Vec::new(),
            bounds: Vec::new(),
            derivations: Vec::new(),
            calendar: false,
            stops: None,
            splits: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required: false,
        });
        self
    }

    pub fn required(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required: true,
        });
        self
    }

    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.renames.push((from.to_string(), to.to_string()));
        self
    }

    pub fn default_value(mut self, field: &str, fill: Fill) -> Self {
        self.defaults.push((field.to_string(), fill));
        self
    }

    pub fn bounded(mut self, field: &str, min: Option<f64>, max: Option<f64>) -> Self {
        self.bounds.push(Bounds::new(field, min, max));
        self
    }

    pub fn derive(mut self, derivation: Derivation) -> Self {
        self.derivations.push(derivation);
        self
    }

    pub fn with_calendar(mut self) -> Self {
        self.calendar = true;
        self
    }

    pub fn explode_stops(mut self, rule: StopExplode) -> Self {
        self.stops = Some(rule);
        self
    }

    /// Attach the name → stop id table; no-op for datasets without stops.
    pub fn with_stop_directory(mut self, directory: Arc<StopDirectory>) -> Self {
        if let Some(rule) = self.stops.as_mut() {
            rule.directory = Some(directory);
        }
        self
    }

    pub fn split(mut self, name: &str, field: &str, value: bool, required: &[&str]) -> Self {
        self.splits.push(Split {
            name: name.to_string(),
            field: field.to_string(),
            value,
            when_missing: true,
            required: strings(required),
        });
        self
    }

    /// Key of a cleaned row; exploded datasets add the stop.
    pub fn row_key(&self) -> Vec<String> {
        match &self.stops {
            Some(rule) => rule.row_key(&self.natural_key),
            None => self.natural_key.clone(),
        }
    }

    /// Replace bounds for the same field, add the rest.
    pub fn with_bounds(mut self, overrides: &[Bounds]) -> Self {
        for b in overrides {
            match self.bounds.iter_mut().find(|x| x.field == b.field) {
                Some(existing) => *existing = b.clone(),
                None => self.bounds.push(b.clone()),
            }
        }
        self
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

static GTFS_WITH_DELAYS: LazyLock<DatasetSchema> = LazyLock::new(|| {
    DatasetSchema::new("gtfs_with_delays", &["match_key", "stop_id", "actual_seconds"])
        .required("match_key", FieldType::Str)
        .required("stop_id", FieldType::Str)
        .field("route_id", FieldType::Str)
        .field("trip_uid", FieldType::Str)
        .field("is_unscheduled", FieldType::Bool)
        .field("scheduled_seconds", FieldType::Int)
        .field("actual_seconds", FieldType::Int)
        .field("delay_seconds", FieldType::Int)
        .field("delay_minutes", FieldType::Float)
        // ±2.5 h is sensor noise rather than a real delay
        .bounded("delay_seconds", Some(-9000.0), Some(9000.0))
        .derive(Derivation::Lag {
            source: "delay_seconds".into(),
            group_by: "match_key".into(),
            order_by: "actual_seconds".into(),
            names: strings(&["lagged_delay_1", "lagged_delay_2"]),
        })
        .derive(Derivation::Diff {
            source: "actual_seconds".into(),
            group_by: "stop_id".into(),
            name: "actual_headway_seconds".into(),
        })
        .derive(Derivation::RatioToPrevious {
            source: "actual_headway_seconds".into(),
            group_by: strings(&["stop_id"]),
            order_by: "actual_seconds".into(),
            name: "headway_ratio".into(),
        })
        .derive(Derivation::LastChar {
            source: "stop_id".into(),
            name: "direction".into(),
        })
        .derive(Derivation::RollingMean {
            source: "delay_seconds".into(),
            group_by: strings(&["route_id", "direction"]),
            order_by: "actual_seconds".into(),
            window: 5,
            name: "route_rolling_delay".into(),
        })
        .derive(Derivation::Progress {
            source: "scheduled_seconds".into(),
            group_by: strings(&["trip_uid"]),
            name: "trip_progress".into(),
        })
        .derive(Derivation::RollingMean {
            source: "delay_seconds".into(),
            group_by: strings(&["trip_uid"]),
            order_by: "scheduled_seconds".into(),
            window: 3,
            name: "rolling_mean_delay_trip".into(),
        })
        .derive(Derivation::ClockTime {
            source: "scheduled_seconds".into(),
            name: "scheduled_time".into(),
        })
        .derive(Derivation::ClockTime {
            source: "actual_seconds".into(),
            name: "actual_time".into(),
        })
        .with_calendar()
        .split("gtfs_scheduled", "is_unscheduled", false, &["route_id", "scheduled_seconds"])
        .split("gtfs_unscheduled", "is_unscheduled", true, &["actual_seconds"])
});

static CLIMA: LazyLock<DatasetSchema> = LazyLock::new(|| {
    DatasetSchema::new("clima", &["time"])
        .required("time", FieldType::Timestamp)
        .required("temperature_2m", FieldType::Float)
        .field("rain", FieldType::Float)
        .field("precipitation", FieldType::Float)
        .field("wind_speed_10m", FieldType::Float)
        .field("snowfall", FieldType::Float)
        .field("cloud_cover", FieldType::Float)
        .bounded("temperature_2m", Some(-35.0), Some(45.0))
        .bounded("wind_speed_10m", Some(0.0), Some(150.0))
        .bounded("precipitation", Some(0.0), Some(100.0))
        .bounded("cloud_cover", Some(0.0), Some(100.0))
        .derive(Derivation::WindChill {
            temperature: "temperature_2m".into(),
            wind_speed: "wind_speed_10m".into(),
            name: "apparent_temp".into(),
        })
        .derive(Derivation::RollingSum {
            source: "precipitation".into(),
            window: 3,
            name: "precip_3h_accum".into(),
        })
        .derive(Derivation::Threshold {
            source: "temperature_2m".into(),
            op: CmpOp::Le,
            value: 0.0,
            name: "is_freezing".into(),
        })
        .derive(Derivation::Threshold {
            source: "wind_speed_10m".into(),
            op: CmpOp::Gt,
            value: 50.0,
            name: "is_high_wind".into(),
        })
        .derive(Derivation::OneOf {
            source: "hour".into(),
            values: vec![7, 8, 9, 16, 17, 18, 19],
            name: "is_rush_hour".into(),
        })
        .with_calendar()
});

static EVENTOS_NYC: LazyLock<DatasetSchema> = LazyLock::new(|| {
    DatasetSchema::new("eventos_nyc", &["nombre_evento", "fecha_inicio"])
        .rename("event_name", "nombre_evento")
        .rename("start_date_time", "fecha_inicio")
        .rename("end_date_time", "fecha_final")
        .default_value("fecha_final", Fill::CopyFrom("fecha_inicio".into()))
        .default_value("score", Fill::Constant(Value::Float(1.0)))
        .required("nombre_evento", FieldType::Str)
        .required("fecha_inicio", FieldType::Timestamp)
        .field("fecha_final", FieldType::Timestamp)
        .field("event_type", FieldType::Str)
        .field("event_borough", FieldType::Str)
        .field("event_location", FieldType::Str)
        .field("score", FieldType::Float)
        .field("paradas_afectadas", FieldType::Str)
        .bounded("score", Some(0.0), Some(1.0))
        .explode_stops(StopExplode::new(
            "paradas_afectadas",
            "parada_nombre",
            "parada_lineas",
            "stop_id",
        ))
        .with_calendar()
});

static OFFICIAL_ALERTS: LazyLock<DatasetSchema> = LazyLock::new(|| {
    DatasetSchema::new("official_alerts", &["alert_id"])
        .required("alert_id", FieldType::Str)
        .required("date", FieldType::Timestamp)
        .field("event_id", FieldType::Str)
        .field("update_number", FieldType::Int)
        .field("agency", FieldType::Str)
        .field("status_label", FieldType::Str)
        .field("affected", FieldType::Str)
        .field("header", FieldType::Str)
        .field("description", FieldType::Str)
        .with_calendar()
});

/// Built-in dataset schema by name.
pub fn builtin(name: &str) -> Option<&'static DatasetSchema> {
    match name {
        "gtfs_with_delays" => Some(&GTFS_WITH_DELAYS),
        "clima" => Some(&CLIMA),
        "eventos_nyc" => Some(&EVENTOS_NYC),
        "official_alerts" => Some(&OFFICIAL_ALERTS),
        _ => None,
    }
}

pub fn builtin_names() -> &'static [&'static str] {
    &["gtfs_with_delays", "clima", "eventos_nyc", "official_alerts"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_resolves() {
        for name in builtin_names() {
            let schema = builtin(name).unwrap();
            assert_eq!(schema.name, *name);
            assert!(!schema.natural_key.is_empty());
            for key in &schema.natural_key {
                assert!(schema.field_spec(key).is_some(), "{name}: key {key} undeclared");
            }
        }
        assert!(builtin("unknown").is_none());
    }

    #[test]
    fn bounds_override_replaces_same_field() {
        let schema = builtin("clima").unwrap().clone().with_bounds(&[
            Bounds::new("temperature_2m", Some(-10.0), None),
            Bounds::new("snowfall", None, Some(50.0)),
        ]);
        let temp = schema.bounds.iter().find(|b| b.field == "temperature_2m").unwrap();
        assert_eq!(temp.max, None);
        assert_eq!(schema.bounds.len(), 5);
    }

    #[test]
    fn gtfs_splits_on_unscheduled_flag() {
        use chrono::{TimeZone, Utc};
        let schema = builtin("gtfs_with_delays").unwrap();
        let [scheduled, unscheduled] = &schema.splits[..] else {
            panic!("expected two splits, got {:?}", schema.splits);
        };
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let base = Record::new(ts, ts).with("actual_seconds", 100i64);

        let on_time = base.clone().with("is_unscheduled", false);
        assert!(scheduled.contains(&on_time));
        assert!(!scheduled.is_complete(&on_time));
        assert!(scheduled.is_complete(
            &on_time.clone().with("route_id", "A").with("scheduled_seconds", 40i64)
        ));

        // Unknown flag counts as unscheduled
        assert!(unscheduled.contains(&base));
        assert!(!scheduled.contains(&base));
        assert!(unscheduled.is_complete(&base));
    }

    #[test]
    fn stop_directory_only_attaches_to_exploding_datasets() {
        let directory = Arc::new(StopDirectory::default());
        let events = builtin("eventos_nyc").unwrap().clone().with_stop_directory(directory.clone());
        assert_eq!(events.row_key(), ["nombre_evento", "fecha_inicio", "stop_id"]);
        let clima = builtin("clima").unwrap().clone().with_stop_directory(directory);
        assert!(clima.stops.is_none());
        assert_eq!(clima.row_key(), ["time"]);
    }

    #[test]
    fn bounds_are_inclusive() {
        let b = Bounds::new("delay_seconds", Some(-9000.0), Some(9000.0));
        assert!(b.contains(9000.0));
        assert!(!b.contains(9000.5));
        assert!(Bounds::new("x", None, None).contains(f64::MAX));
        assert_eq!(b.flag_name(), "delay_seconds_outlier");
    }
}
