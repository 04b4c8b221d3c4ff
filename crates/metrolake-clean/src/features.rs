//! Derived features added by the cleaning stage
//!
//! Derivations run on coerced records. History-based ones (lags, rolling
//! sums) are seeded from the previous day's records so the first rows of a
//! partition get values too.

use std::collections::VecDeque;
use std::f64::consts::PI;

use chrono::{Datelike, Timelike};
use chrono_tz::Tz;
use metrolake_core::{Record, Value};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }
}

/// Value used to fill a missing field.
#[derive(Debug, Clone, PartialEq)]
pub enum Fill {
    Constant(Value),
    CopyFrom(String),
}

/// One derived column.
#[derive(Debug, Clone, PartialEq)]
pub enum Derivation {
    /// `names[k-1]` = value of `source` k rows earlier for the same `group_by`,
    /// rows ordered by `order_by`.
    Lag {
        source: String,
        group_by: String,
        order_by: String,
        names: Vec<String>,
    },
    /// Difference to the previous row of the same group, ordered by `source`.
    /// Not seeded: values are only comparable within one day.
    Diff {
        source: String,
        group_by: String,
        name: String,
    },
    /// Sum over the last `window` rows in time order, current included.
    RollingSum {
        source: String,
        window: usize,
        name: String,
    },
    /// Boolean flag `source <op> value`.
    Threshold {
        source: String,
        op: CmpOp,
        value: f64,
        name: String,
    },
    /// Simplified wind chill from temperature (°C) and wind speed (km/h).
    WindChill {
        temperature: String,
        wind_speed: String,
        name: String,
    },
    /// Mean of `source` over the previous `window` rows of the same group,
    /// current row excluded. Null on a group's first row.
    RollingMean {
        source: String,
        group_by: Vec<String>,
        order_by: String,
        window: usize,
        name: String,
    },
    /// `source` divided by its value on the previous row of the group.
    /// Null when either is missing or the previous one is zero.
    RatioToPrevious {
        source: String,
        group_by: Vec<String>,
        order_by: String,
        name: String,
    },
    /// Position of `source` between the group's minimum (0) and maximum (1).
    Progress {
        source: String,
        group_by: Vec<String>,
        name: String,
    },
    /// Seconds after midnight as `HH:MM:SS`, wrapping past 24 h.
    ClockTime { source: String, name: String },
    /// Last character of a string field, e.g. the direction of a stop id.
    LastChar { source: String, name: String },
    /// Whether an integer field is one of `values`.
    OneOf {
        source: String,
        values: Vec<i64>,
        name: String,
    },
}

impl Derivation {
    pub fn output_names(&self) -> Vec<&str> {
        match self {
            Self::Lag { names, .. } => names.iter().map(String::as_str).collect(),
            Self::Diff { name, .. }
            | Self::RollingSum { name, .. }
            | Self::Threshold { name, .. }
            | Self::WindChill { name, .. }
            | Self::RollingMean { name, .. }
            | Self::RatioToPrevious { name, .. }
            | Self::Progress { name, .. }
            | Self::ClockTime { name, .. }
            | Self::LastChar { name, .. }
            | Self::OneOf { name, .. } => vec![name.as_str()],
        }
    }

    /// Add this derivation's columns to `records`.
    pub fn apply(&self, records: &mut [Record], prior: &[Record]) {
        match self {
            Self::Lag {
                source,
                group_by,
                order_by,
                names,
            } => lag(records, prior, source, group_by, order_by, names),
            Self::Diff {
                source,
                group_by,
                name,
            } => diff(records, source, group_by, name),
            Self::RollingSum {
                source,
                window,
                name,
            } => rolling_sum(records, prior, source, *window, name),
            Self::Threshold {
                source,
                op,
                value,
                name,
            } => {
                for r in records.iter_mut() {
                    let flag = r.get(source).and_then(Value::as_f64).map(|v| op.apply(v, *value));
                    r.set(name, flag);
                }
            }
            Self::WindChill {
                temperature,
                wind_speed,
                name,
            } => {
                for r in records.iter_mut() {
                    let t = r.get(temperature).and_then(Value::as_f64);
                    let ws = r.get(wind_speed).and_then(Value::as_f64);
                    let chill = t.zip(ws).map(|(t, ws)| wind_chill(t, ws));
                    r.set(name, chill);
                }
            }
            Self::RollingMean {
                source,
                group_by,
                order_by,
                window,
                name,
            } => rolling_mean(records, source, group_by, order_by, *window, name),
            Self::RatioToPrevious {
                source,
                group_by,
                order_by,
                name,
            } => ratio_to_previous(records, source, group_by, order_by, name),
            Self::Progress {
                source,
                group_by,
                name,
            } => progress(records, source, group_by, name),
            Self::ClockTime { source, name } => {
                for r in records.iter_mut() {
                    let clock = r.get(source).and_then(Value::as_f64).map(|s| clock_time(s as i64));
                    r.set(name, clock);
                }
            }
            Self::LastChar { source, name } => {
                for r in records.iter_mut() {
                    let last = r
                        .get(source)
                        .and_then(Value::as_str)
                        .and_then(|s| s.chars().last())
                        .map(String::from);
                    r.set(name, last);
                }
            }
            Self::OneOf {
                source,
                values,
                name,
            } => {
                for r in records.iter_mut() {
                    let hit = match r.get(source) {
                        Some(Value::Int(v)) => Some(values.contains(v)),
                        _ => None,
                    };
                    r.set(name, hit);
                }
            }
        }
    }
}

/// `HH:MM:SS` of a seconds-after-midnight offset.
pub fn clock_time(seconds: i64) -> String {
    let s = seconds.rem_euclid(86_400);
    format!("{:02}:{:02}:{:02}", s / 3600, s % 3600 / 60, s % 60)
}

pub fn wind_chill(t: f64, ws: f64) -> f64 {
    let v = ws.max(0.0).powf(0.16);
    13.12 + 0.6215 * t - 11.37 * v + 0.3965 * t * v
}

fn group_of(r: &Record, field: &str) -> Option<String> {
    r.get(field).map(ToString::to_string)
}

/// Sort key: numeric value (missing last), then source time.
fn order_key(r: &Record, field: &str) -> (bool, f64, i64) {
    let v = r.get(field).and_then(Value::as_f64);
    (v.is_none(), v.unwrap_or(0.0), r.source_ts.timestamp_micros())
}

fn ordered_indices(records: &[Record], order_by: &str) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..records.len()).collect();
    idx.sort_by(|&a, &b| {
        order_key(&records[a], order_by)
            .partial_cmp(&order_key(&records[b], order_by))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    idx
}

fn lag(
    records: &mut [Record],
    prior: &[Record],
    source: &str,
    group_by: &str,
    order_by: &str,
    names: &[String],
) {
    let depth = names.len();
    let mut history: FxHashMap<String, VecDeque<Value>> = FxHashMap::default();

    let push = |history: &mut FxHashMap<String, VecDeque<Value>>, group: String, v: Value| {
        let h = history.entry(group).or_default();
        h.push_back(v);
        if h.len() > depth {
            h.pop_front();
        }
    };

    for i in ordered_indices(prior, order_by) {
        if let Some(g) = group_of(&prior[i], group_by) {
            let v = prior[i].get(source).cloned().unwrap_or(Value::Null);
            push(&mut history, g, v);
        }
    }

    for i in ordered_indices(records, order_by) {
        let Some(g) = group_of(&records[i], group_by) else {
            for name in names {
                records[i].set(name, Value::Null);
            }
            continue;
        };
        let h = history.get(&g);
        for (k, name) in names.iter().enumerate() {
            let lagged = h
                .and_then(|h| h.len().checked_sub(k + 1).map(|j| h[j].clone()))
                .unwrap_or(Value::Null);
            records[i].set(name, lagged);
        }
        let v = records[i].get(source).cloned().unwrap_or(Value::Null);
        push(&mut history, g, v);
    }
}

fn diff(records: &mut [Record], source: &str, group_by: &str, name: &str) {
    let mut last: FxHashMap<String, f64> = FxHashMap::default();
    for i in ordered_indices(records, source) {
        let current = records[i].get(source).and_then(Value::as_f64);
        let out = match (group_of(&records[i], group_by), current) {
            (Some(g), Some(v)) => {
                let prev = last.insert(g, v);
                prev.map(|p| v - p)
            }
            _ => None,
        };
        records[i].set(name, out);
    }
}

fn rolling_sum(records: &mut [Record], prior: &[Record], source: &str, window: usize, name: &str) {
    let window = window.max(1);
    let mut recent: VecDeque<Option<f64>> = VecDeque::with_capacity(window);
    let value = |r: &Record| r.get(source).and_then(Value::as_f64);

    let mut prior_sorted: Vec<&Record> = prior.iter().collect();
    prior_sorted.sort_by_key(|r| r.source_ts);
    for &r in prior_sorted.iter().rev().take(window - 1).rev() {
        recent.push_back(value(r));
    }

    let mut idx: Vec<usize> = (0..records.len()).collect();
    idx.sort_by_key(|&i| records[i].source_ts);
    for i in idx {
        if recent.len() == window {
            recent.pop_front();
        }
        recent.push_back(value(&records[i]));
        let present: Vec<f64> = recent.iter().flatten().copied().collect();
        let sum = (!present.is_empty()).then(|| present.iter().sum::<f64>());
        records[i].set(name, sum);
    }
}

fn rolling_mean(
    records: &mut [Record],
    source: &str,
    group_by: &[String],
    order_by: &str,
    window: usize,
    name: &str,
) {
    let window = window.max(1);
    let mut recent: FxHashMap<String, VecDeque<Option<f64>>> = FxHashMap::default();
    for i in ordered_indices(records, order_by) {
        let Some(g) = records[i].natural_key(group_by) else {
            records[i].set(name, Value::Null);
            continue;
        };
        let h = recent.entry(g).or_default();
        let present: Vec<f64> = h.iter().flatten().copied().collect();
        let mean = (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64);
        if h.len() == window {
            h.pop_front();
        }
        h.push_back(records[i].get(source).and_then(Value::as_f64));
        records[i].set(name, mean);
    }
}

fn ratio_to_previous(
    records: &mut [Record],
    source: &str,
    group_by: &[String],
    order_by: &str,
    name: &str,
) {
    let mut last: FxHashMap<String, Option<f64>> = FxHashMap::default();
    for i in ordered_indices(records, order_by) {
        let current = records[i].get(source).and_then(Value::as_f64);
        let ratio = records[i].natural_key(group_by).and_then(|g| {
            let prev = last.insert(g, current).flatten().filter(|p| *p != 0.0);
            current.zip(prev).map(|(c, p)| c / p)
        });
        records[i].set(name, ratio);
    }
}

fn progress(records: &mut [Record], source: &str, group_by: &[String], name: &str) {
    let mut span: FxHashMap<String, (f64, f64)> = FxHashMap::default();
    for r in records.iter() {
        if let (Some(g), Some(v)) = (r.natural_key(group_by), r.get(source).and_then(Value::as_f64)) {
            let e = span.entry(g).or_insert((v, v));
            e.0 = e.0.min(v);
            e.1 = e.1.max(v);
        }
    }
    for r in records.iter_mut() {
        let v = r.get(source).and_then(Value::as_f64);
        let out = r
            .natural_key(group_by)
            .and_then(|g| span.get(&g).copied())
            .zip(v)
            .and_then(|((lo, hi), v)| (hi > lo).then(|| (v - lo) / (hi - lo)));
        r.set(name, out);
    }
}

/// Operating period used by the MTA for peak fares.
pub fn period_of_day(hour: u32) -> &'static str {
    match hour {
        6..=9 => "morning_peak",
        10..=15 => "midday",
        16..=19 => "evening_peak",
        _ => "off_peak",
    }
}

/// Calendar features from the event time, in local service time.
///
/// `dow` counts from Monday = 0.
pub fn add_calendar_features(records: &mut [Record], tz: Tz) {
    for r in records.iter_mut() {
        let local = r.source_ts.with_timezone(&tz);
        let hour = local.hour();
        let angle = 2.0 * PI * f64::from(hour) / 24.0;
        let dow = local.weekday().num_days_from_monday();
        let period = period_of_day(hour);

        r.set("hour", i64::from(hour));
        r.set("hour_sin", angle.sin());
        r.set("hour_cos", angle.cos());
        r.set("dow", i64::from(dow));
        r.set("is_weekend", dow >= 5);
        r.set("period_of_day", period);
        r.set("is_peak", matches!(period, "morning_peak" | "evening_peak"));
    }
}

/// Fill missing fields before coercion.
pub fn apply_defaults(record: &mut Record, defaults: &[(String, Fill)]) {
    for (field, fill) in defaults {
        if record.get(field).is_some() {
            continue;
        }
        let value = match fill {
            Fill::Constant(v) => v.clone(),
            Fill::CopyFrom(other) => record.get(other).cloned().unwrap_or(Value::Null),
        };
        record.set(field, value);
    }
}
