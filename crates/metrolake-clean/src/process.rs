//! raw → processed: union the raw variants of one dataset-day

use metrolake_core::{Record, ValidationFailure, dedup_by_natural_key, sort_canonical};

use crate::schema::DatasetSchema;

/// Column recording which raw variant a processed row came from.
pub const SOURCE_VARIANT_FIELD: &str = "source_variant";

#[derive(Debug, Clone, Default)]
pub struct Processed {
    pub records: Vec<Record>,
    pub rows_in: usize,
    pub duplicates: usize,
    /// Rows dropped because a natural-key field was missing.
    pub missing_key: usize,
}

/// Union `inputs` (variant name, records), rename fields, check the natural
/// key, deduplicate and sort.
///
/// Fails when every input row lacks the natural key: the feed changed shape
/// and cleaning it would only produce garbage.
pub fn process(
    schema: &DatasetSchema,
    label: &str,
    inputs: Vec<(String, Vec<Record>)>,
) -> Result<Processed, ValidationFailure> {
    let mut rows_in = 0usize;
    let mut keyed = Vec::new();
    let mut missing_key = 0usize;

    for (variant, records) in inputs {
        rows_in += records.len();
        for mut record in records {
            for (from, to) in &schema.renames {
                if let Some(v) = record.remove(from) {
                    record.fields.entry(to.clone()).or_insert(v);
                }
            }
            record.set(SOURCE_VARIANT_FIELD, variant.as_str());
            if record.natural_key(&schema.natural_key).is_some() {
                keyed.push(record);
            } else {
                missing_key += 1;
            }
        }
    }

    if rows_in > 0 && keyed.is_empty() {
        return Err(ValidationFailure {
            partition: label.to_string(),
            reason: format!(
                "none of {rows_in} rows carries the natural key ({})",
                schema.natural_key.join(", ")
            ),
        });
    }
    if missing_key > 0 {
        log::warn!("{label}: dropped {missing_key} rows without natural key");
    }

    let (mut records, duplicates) = dedup_by_natural_key(keyed, &schema.natural_key);
    sort_canonical(&mut records, &schema.natural_key);

    Ok(Processed {
        records,
        rows_in,
        duplicates,
        missing_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::builtin;
    use chrono::{TimeZone, Utc};
    use metrolake_core::Value;

    fn event(name: &str, start: &str, h: u32) -> Record {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, h, 0, 0).unwrap();
        Record::new(ts, ts)
            .with("event_name", name)
            .with("start_date_time", start)
    }

    #[test]
    fn unions_variants_with_renames() {
        let schema = builtin("eventos_nyc").unwrap();
        let inputs = vec![
            ("eventos".to_string(), vec![event("Street Fair", "2025-06-01T10:00:00", 14)]),
            (
                "eventos_deporte".to_string(),
                vec![event("Yankees vs Red Sox", "2025-06-01T19:05:00", 23)],
            ),
            ("eventos_concierto".to_string(), vec![]),
        ];
        let out = process(schema, "processed/eventos_nyc/2025-06-01", inputs).unwrap();
        assert_eq!(out.rows_in, 2);
        assert_eq!(out.records.len(), 2);
        let game = &out.records[1];
        assert_eq!(game.get("nombre_evento"), Some(&Value::from("Yankees vs Red Sox")));
        assert_eq!(game.get("event_name"), None);
        assert_eq!(game.get(SOURCE_VARIANT_FIELD), Some(&Value::from("eventos_deporte")));
    }

    #[test]
    fn same_event_in_two_variants_kept_once() {
        let schema = builtin("eventos_nyc").unwrap();
        let e = event("Street Fair", "2025-06-01T10:00:00", 14);
        let inputs = vec![
            ("eventos".to_string(), vec![e.clone()]),
            ("eventos_concierto".to_string(), vec![e]),
        ];
        let out = process(schema, "p", inputs).unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.duplicates, 1);
    }

    #[test]
    fn feed_without_keys_fails() {
        let schema = builtin("gtfs_with_delays").unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let inputs = vec![("mta".to_string(), vec![Record::new(ts, ts).with("trip", "x")])];
        let err = process(schema, "processed/gtfs_with_delays/2025-01-01", inputs).unwrap_err();
        assert!(err.reason.contains("natural key"));
    }

    #[test]
    fn no_input_is_empty_output() {
        let out = process(builtin("clima").unwrap(), "p", vec![]).unwrap();
        assert!(out.records.is_empty());
    }
}
