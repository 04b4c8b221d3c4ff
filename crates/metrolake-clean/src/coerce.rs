//! Per-field type coercion
//!
//! Upstream APIs are sloppy about types: Socrata sends every number as a
//! string, GTFS feeds mix `1`/`true`. Coercion accepts the lossless
//! conversions and rejects everything else with a [`CoercionError`].

use chrono_tz::Tz;
use metrolake_core::{CoercionError, Value, parse_timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Int,
    Float,
    Bool,
    Timestamp,
}

impl FieldType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Str => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
        }
    }
}

fn fail(field: &str, value: &Value, ty: FieldType) -> CoercionError {
    CoercionError {
        field: field.to_string(),
        value: value.to_string(),
        expected: ty.as_str(),
    }
}

/// Convert `value` to `ty`. Null stays null.
///
/// Naive timestamp strings are read as local time in `tz`.
pub fn coerce(field: &str, value: &Value, ty: FieldType, tz: Tz) -> Result<Value, CoercionError> {
    let out = match (ty, value) {
        (_, Value::Null) => Some(Value::Null),

        (FieldType::Str, Value::Str(_)) => Some(value.clone()),
        (FieldType::Str, other) => Some(Value::Str(other.to_string())),

        (FieldType::Int, Value::Int(_)) => Some(value.clone()),
        (FieldType::Int, Value::Float(f)) => float_to_int(*f).map(Value::Int),
        (FieldType::Int, Value::Bool(b)) => Some(Value::Int(i64::from(*b))),
        (FieldType::Int, Value::Str(s)) => parse_int(s).map(Value::Int),

        (FieldType::Float, Value::Float(_)) => Some(value.clone()),
        (FieldType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
        (FieldType::Float, Value::Str(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::Float),

        (FieldType::Bool, Value::Bool(_)) => Some(value.clone()),
        (FieldType::Bool, Value::Int(0)) => Some(Value::Bool(false)),
        (FieldType::Bool, Value::Int(1)) => Some(Value::Bool(true)),
        (FieldType::Bool, Value::Str(s)) => parse_bool(s).map(Value::Bool),

        (FieldType::Timestamp, Value::Timestamp(_)) => Some(value.clone()),
        (FieldType::Timestamp, Value::Str(s)) => parse_timestamp(s, tz).map(Value::Timestamp),

        _ => None,
    };
    out.ok_or_else(|| fail(field, value, ty))
}

fn float_to_int(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Some(true),
        "false" | "f" | "0" | "no" => Some(false),
        _ => None,
    }
}
