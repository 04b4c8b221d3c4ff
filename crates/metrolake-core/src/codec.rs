//! Parquet codec for partition objects
//!
//! A partition is encoded whole, in memory, and handed to the object store
//! as one buffer. Column layout:
//!
//! - `_source_ts`, `_ingested_at`: `Timestamp(Microsecond, "UTC")`, non-null
//! - one column per field name, sorted, nullable, type inferred from values
//!
//! Type inference: all ints → Int64, ints mixed with floats → Float64,
//! bools → Boolean, timestamps → Timestamp, anything else → Utf8 (Display).

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{
    DataType, Field, Float64Type, Int64Type, Schema, TimeUnit, TimestampMicrosecondType,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use crate::error::StoreError;
use crate::record::{Record, Value};

/// Default zstd level for partition objects
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

const SOURCE_TS_COL: &str = "_source_ts";
const INGESTED_AT_COL: &str = "_ingested_at";

/// Physical column type chosen for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Int,
    Float,
    Bool,
    Timestamp,
    Utf8,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        match self {
            Self::Int => DataType::Int64,
            Self::Float => DataType::Float64,
            Self::Bool => DataType::Boolean,
            Self::Timestamp => utc_micros(),
            Self::Utf8 => DataType::Utf8,
        }
    }

    /// Narrowest kind holding `v`; `None` for null.
    fn of(v: &Value) -> Option<Self> {
        match v {
            Value::Null => None,
            Value::Int(_) => Some(Self::Int),
            Value::Float(_) => Some(Self::Float),
            Value::Bool(_) => Some(Self::Bool),
            Value::Timestamp(_) => Some(Self::Timestamp),
            Value::Str(_) => Some(Self::Utf8),
        }
    }

    /// Widest of two kinds.
    fn merge(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Int, Self::Float) | (Self::Float, Self::Int) => Self::Float,
            _ => Self::Utf8,
        }
    }
}

fn utc_micros() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

fn codec_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Codec(e.to_string())
}

/// Inferred column kinds plus the columns whose values had incompatible
/// kinds and were stored as text.
struct Columns<'a> {
    kinds: BTreeMap<&'a str, ColumnKind>,
    as_text: Vec<&'a str>,
}

/// Infer one column kind per field name. Fields that are null everywhere
/// become Utf8.
fn infer_columns(records: &[Record]) -> Columns<'_> {
    let mut kinds: BTreeMap<&str, Option<ColumnKind>> = BTreeMap::new();
    let mut as_text = Vec::new();
    for record in records {
        for (name, value) in &record.fields {
            let slot = kinds.entry(name.as_str()).or_insert(None);
            *slot = match (*slot, ColumnKind::of(value)) {
                (Some(a), Some(b)) => {
                    let merged = a.merge(b);
                    let mixed = merged == ColumnKind::Utf8 && a != b;
                    if mixed && !as_text.contains(&name.as_str()) {
                        as_text.push(name.as_str());
                    }
                    Some(merged)
                }
                (a, b) => a.or(b),
            };
        }
    }
    Columns {
        kinds: kinds
            .into_iter()
            .map(|(name, kind)| (name, kind.unwrap_or(ColumnKind::Utf8)))
            .collect(),
        as_text,
    }
}

fn build_column(records: &[Record], name: &str, kind: ColumnKind) -> ArrayRef {
    let cells = records.iter().map(|r| r.get(name));
    match kind {
        ColumnKind::Int => Arc::new(
            cells
                .map(|v| match v {
                    Some(Value::Int(i)) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        ColumnKind::Float => Arc::new(
            cells
                .map(|v| v.and_then(Value::as_f64))
                .collect::<Float64Array>(),
        ),
        ColumnKind::Bool => Arc::new(
            cells
                .map(|v| match v {
                    Some(Value::Bool(b)) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        ColumnKind::Timestamp => Arc::new(
            cells
                .map(|v| match v {
                    Some(Value::Timestamp(ts)) => Some(ts.timestamp_micros()),
                    _ => None,
                })
                .collect::<TimestampMicrosecondArray>()
                .with_timezone("UTC"),
        ),
        ColumnKind::Utf8 => Arc::new(
            cells
                .map(|v| v.map(Value::to_string))
                .collect::<StringArray>(),
        ),
    }
}

fn to_batch(records: &[Record]) -> Result<RecordBatch, StoreError> {
    let Columns { kinds: columns, as_text } = infer_columns(records);
    for name in as_text {
        log::warn!("column {name:?} mixes value kinds, storing it as text");
    }

    let mut fields = Vec::with_capacity(columns.len() + 2);
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len() + 2);

    fields.push(Field::new(SOURCE_TS_COL, utc_micros(), false));
    arrays.push(Arc::new(
        TimestampMicrosecondArray::from(
            records
                .iter()
                .map(|r| r.source_ts.timestamp_micros())
                .collect::<Vec<_>>(),
        )
        .with_timezone("UTC"),
    ));
    fields.push(Field::new(INGESTED_AT_COL, utc_micros(), false));
    arrays.push(Arc::new(
        TimestampMicrosecondArray::from(
            records
                .iter()
                .map(|r| r.ingested_at.timestamp_micros())
                .collect::<Vec<_>>(),
        )
        .with_timezone("UTC"),
    ));

    for (name, kind) in columns {
        fields.push(Field::new(name, kind.data_type(), true));
        arrays.push(build_column(records, name, kind));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(codec_err)
}

/// Encode a partition as a zstd-compressed parquet buffer.
pub fn encode_partition(records: &[Record], zstd_level: i32) -> Result<Bytes, StoreError> {
    let batch = to_batch(records)?;
    let level = ZstdLevel::try_new(zstd_level).map_err(codec_err)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(level))
        .set_max_row_group_size(1024 * 1024) // 1M rows per row group
        .build();

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), Some(props)).map_err(codec_err)?;
    writer.write(&batch).map_err(codec_err)?;
    writer.close().map_err(codec_err)?;
    Ok(Bytes::from(buf))
}

fn micros_to_utc(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Codec(format!("timestamp out of range: {micros}")))
}

fn timestamp_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a TimestampMicrosecondArray, StoreError> {
    let idx = batch.schema().index_of(name).map_err(codec_err)?;
    batch
        .column(idx)
        .as_primitive_opt::<TimestampMicrosecondType>()
        .ok_or_else(|| StoreError::Codec(format!("{name}: not a microsecond timestamp")))
}

/// Decode a partition buffer back into records. Null cells become absent
/// fields.
pub fn decode_partition(data: Bytes) -> Result<Vec<Record>, StoreError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(data)
        .map_err(codec_err)?
        .build()
        .map_err(codec_err)?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.map_err(codec_err)?;
        let schema = batch.schema();

        let source_ts = timestamp_column(&batch, SOURCE_TS_COL)?;
        let ingested_at = timestamp_column(&batch, INGESTED_AT_COL)?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            rows.push(Record::new(
                micros_to_utc(source_ts.value(row))?,
                micros_to_utc(ingested_at.value(row))?,
            ));
        }

        for (field, column) in schema.fields().iter().zip(batch.columns()) {
            let name = field.name();
            if name == SOURCE_TS_COL || name == INGESTED_AT_COL {
                continue;
            }
            for (row, record) in rows.iter_mut().enumerate() {
                if column.is_null(row) {
                    continue;
                }
                let value = match field.data_type() {
                    DataType::Int64 => Value::Int(column.as_primitive::<Int64Type>().value(row)),
                    DataType::Float64 => {
                        Value::Float(column.as_primitive::<Float64Type>().value(row))
                    }
                    DataType::Boolean => Value::Bool(column.as_boolean().value(row)),
                    DataType::Utf8 => Value::Str(column.as_string::<i32>().value(row).to_string()),
                    DataType::Timestamp(TimeUnit::Microsecond, _) => Value::Timestamp(
                        micros_to_utc(column.as_primitive::<TimestampMicrosecondType>().value(row))?,
                    ),
                    other => {
                        return Err(StoreError::Codec(format!(
                            "column {name}: unsupported type {other}"
                        )));
                    }
                };
                record.fields.insert(name.clone(), value);
            }
        }
        out.extend(rows);
    }
    Ok(out)
}

/// Check that a buffer holds a readable parquet file (valid footer)
pub fn is_valid_parquet(data: &Bytes) -> bool {
    parquet::file::reader::SerializedFileReader::new(data.clone()).is_ok()
}
