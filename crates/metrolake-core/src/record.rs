//! Record model shared by every lake layer
//!
//! A [`Record`] is a loosely-typed row: the schema varies per dataset and is
//! only enforced when a partition moves from processed to cleaned.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use rustc_hash::FxHashMap;

/// Separator between natural-key components (ASCII unit separator).
const KEY_SEP: char = '\u{1f}';

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view used by outlier bounds and statistics.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "string",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Convert a JSON value as returned by upstream APIs.
    ///
    /// Arrays and objects are kept as their JSON text.
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => n.as_f64().map_or(Self::Null, Self::Float),
            },
            serde_json::Value::String(s) => Self::Str(s.clone()),
            other => Self::Str(other.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Timestamp(ts) => f.write_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// A structured row tagged with its source and ingestion timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fields: BTreeMap<String, Value>,
    /// When the event happened upstream.
    pub source_ts: DateTime<Utc>,
    /// When the pipeline fetched it.
    pub ingested_at: DateTime<Utc>,
}

impl Record {
    pub fn new(source_ts: DateTime<Utc>, ingested_at: DateTime<Utc>) -> Self {
        Self {
            fields: BTreeMap::new(),
            source_ts,
            ingested_at,
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.to_string(), value.into());
    }

    /// Field value; `None` when absent or null.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// Stable natural-key string, `None` if any component is missing.
    ///
    /// Each component carries its type, so `5` and `"5"` are different keys.
    pub fn natural_key(&self, key: &[String]) -> Option<String> {
        let mut out = String::new();
        for (i, name) in key.iter().enumerate() {
            let value = self.get(name)?;
            if i > 0 {
                out.push(KEY_SEP);
            }
            out.push_str(value.type_name());
            out.push(':');
            out.push_str(&value.to_string());
        }
        Some(out)
    }

    /// Canonical text of fields and source timestamp (ingestion time excluded).
    pub fn fingerprint(&self) -> String {
        let mut out = self.source_ts.timestamp_micros().to_string();
        for (name, value) in &self.fields {
            if value.is_null() {
                continue;
            }
            out.push(KEY_SEP);
            out.push_str(name);
            out.push('=');
            out.push_str(value.type_name());
            out.push(':');
            out.push_str(&value.to_string());
        }
        out
    }
}

/// Keep one record per natural key: the one with the latest `ingested_at`.
///
/// Ties go to the record seen last. Records missing a key component pass
/// through untouched. Returns the survivors and the number removed.
pub fn dedup_by_natural_key(records: Vec<Record>, key: &[String]) -> (Vec<Record>, usize) {
    let mut index: FxHashMap<String, usize> = FxHashMap::default();
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    let mut removed = 0usize;

    for record in records {
        let Some(k) = record.natural_key(key) else {
            out.push(record);
            continue;
        };
        match index.get(&k) {
            Some(&i) => {
                removed += 1;
                if record.ingested_at >= out[i].ingested_at {
                    out[i] = record;
                }
            }
            None => {
                index.insert(k, out.len());
                out.push(record);
            }
        }
    }

    (out, removed)
}

/// Sort into the canonical partition order: source time, natural key, content.
pub fn sort_canonical(records: &mut [Record], key: &[String]) {
    records.sort_by_cached_key(|r| {
        (
            r.source_ts,
            r.natural_key(key).unwrap_or_default(),
            r.fingerprint(),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, 0, 0).unwrap()
    }

    fn key(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn natural_key_requires_all_components() {
        let r = Record::new(ts(0), ts(1))
            .with("trip", "A1")
            .with("stop", Value::Null);
        assert_eq!(r.natural_key(&key(&["trip"])), Some("string:A1".to_string()));
        assert_eq!(r.natural_key(&key(&["trip", "stop"])), None);
    }

    #[test]
    fn dedup_keeps_latest_ingestion() {
        let early = Record::new(ts(0), ts(1)).with("id", "x").with("v", 1i64);
        let late = Record::new(ts(0), ts(5)).with("id", "x").with("v", 2i64);
        // Late arrives first: arrival order must not matter
        let (out, removed) = dedup_by_natural_key(vec![late, early], &key(&["id"]));
        assert_eq!(removed, 1);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("v"), Some(&Value::Int(2)));
    }

    #[test]
    fn key_components_keep_their_type() {
        let number = Record::new(ts(0), ts(1)).with("id", 5i64);
        let text = Record::new(ts(0), ts(2)).with("id", "5");
        let k = key(&["id"]);
        assert_ne!(number.natural_key(&k), text.natural_key(&k));

        let (out, removed) = dedup_by_natural_key(vec![number, text], &k);
        assert_eq!(removed, 0);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn dedup_passes_unkeyed_records() {
        let a = Record::new(ts(0), ts(1)).with("v", 1i64);
        let b = Record::new(ts(0), ts(1)).with("v", 1i64);
        let (out, removed) = dedup_by_natural_key(vec![a, b], &key(&["id"]));
        assert_eq!(out.len(), 2);
        assert_eq!(removed, 0);
    }

    #[test]
    fn sort_canonical_is_order_independent() {
        let a = Record::new(ts(2), ts(9)).with("id", "a");
        let b = Record::new(ts(1), ts(9)).with("id", "b");
        let c = Record::new(ts(1), ts(9)).with("id", "a");
        let k = key(&["id"]);

        let mut one = vec![a.clone(), b.clone(), c.clone()];
        let mut two = vec![c, a, b];
        sort_canonical(&mut one, &k);
        sort_canonical(&mut two, &k);
        assert_eq!(one, two);
        assert_eq!(one[0].get("id"), Some(&Value::from("a")));
        assert_eq!(one[2].source_ts, ts(2));
    }

    #[test]
    fn fingerprint_ignores_ingestion_time() {
        let a = Record::new(ts(0), ts(1)).with("id", "x");
        let b = Record::new(ts(0), ts(7)).with("id", "x");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn value_from_json_numbers() {
        assert_eq!(Value::from_json(&serde_json::json!(3)), Value::Int(3));
        assert_eq!(Value::from_json(&serde_json::json!(2.5)), Value::Float(2.5));
        assert_eq!(
            Value::from_json(&serde_json::json!(["a"])),
            Value::Str("[\"a\"]".into())
        );
    }
}
