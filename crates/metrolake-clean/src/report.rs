//! Quality report stored next to each cleaned partition

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use metrolake_core::{Record, Value};
use serde::{Deserialize, Serialize};

/// Summary statistics of one numeric field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

impl FieldStats {
    /// `None` when no record has a numeric value for `field`.
    pub fn compute(records: &[Record], field: &str) -> Option<Self> {
        let mut values: Vec<f64> = records
            .iter()
            .filter_map(|r| r.get(field).and_then(Value::as_f64))
            .collect();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let count = values.len();
        let sum: f64 = values.iter().sum();
        Some(Self {
            count,
            min: values[0],
            max: values[count - 1],
            mean: sum / count as f64,
            p50: quantile(&values, 0.5),
            p95: quantile(&values, 0.95),
        })
    }
}

/// Linear interpolation between closest ranks; `sorted` must be non-empty.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub dataset: String,
    pub date: NaiveDate,
    pub rows_in: usize,
    pub rows_out: usize,
    pub duplicates_removed: usize,
    pub coercion_failures: usize,
    pub coercion_failures_by_field: BTreeMap<String, usize>,
    pub outliers_flagged: BTreeMap<String, usize>,
    pub nulls_after: BTreeMap<String, usize>,
    pub stats: BTreeMap<String, FieldStats>,
    /// Set on the report of one split of the partition.
    #[serde(default)]
    pub split: Option<String>,
    /// Split rows missing a field the split requires.
    #[serde(default)]
    pub dropped_incomplete: usize,
    #[serde(default)]
    pub dropped_without_stops: usize,
    #[serde(default)]
    pub unmapped_stops: usize,
    pub generated_at: DateTime<Utc>,
}

impl QualityReport {
    pub fn new(dataset: &str, date: NaiveDate) -> Self {
        Self {
            dataset: dataset.to_string(),
            date,
            rows_in: 0,
            rows_out: 0,
            duplicates_removed: 0,
            coercion_failures: 0,
            coercion_failures_by_field: BTreeMap::new(),
            outliers_flagged: BTreeMap::new(),
            nulls_after: BTreeMap::new(),
            stats: BTreeMap::new(),
            split: None,
            dropped_incomplete: 0,
            dropped_without_stops: 0,
            unmapped_stops: 0,
            generated_at: Utc::now(),
        }
    }

    /// Share of input rows dropped for coercion failures.
    pub fn coercion_failure_ratio(&self) -> f64 {
        if self.rows_in == 0 {
            0.0
        } else {
            self.coercion_failures as f64 / self.rows_in as f64
        }
    }

    /// Count nulls per column over the output; a column absent from a
    /// record counts as null there.
    pub fn count_nulls(&mut self, records: &[Record]) {
        let mut columns: BTreeMap<String, usize> = BTreeMap::new();
        for r in records {
            for name in r.fields.keys() {
                columns.entry(name.clone()).or_insert(0);
            }
        }
        for (name, nulls) in columns.iter_mut() {
            *nulls = records.iter().filter(|r| r.get(name).is_none()).count();
        }
        self.nulls_after = columns;
    }

    pub fn total_outliers(&self) -> usize {
        self.outliers_flagged.values().sum()
    }
}
