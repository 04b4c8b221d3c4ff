//! Partition key scheme
//!
//! ```text
//! grupo5/
//! ├── _state/manifest.json
//! ├── raw/{dataset}/date=YYYY-MM-DD/{variant}.parquet
//! ├── processed/{dataset}/date=YYYY-MM-DD/{variant}.parquet
//! └── cleaned/{dataset}/date=YYYY-MM-DD/
//!     ├── {variant}.parquet
//!     └── quality_report_YYYY-MM-DD.json   (quality_report_{variant}.json
//!                                          for non-default variants)
//! ```
//!
//! Staging objects live next to their final key as `{key}.{hash}.tmp` and
//! never parse as partition keys.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use metrolake_core::MalformedKeyError;
use serde::{Deserialize, Serialize};

/// Root prefix of the lake inside the bucket.
pub const LAKE_ROOT: &str = "grupo5";

/// Location of the manifest object.
pub const MANIFEST_KEY: &str = "grupo5/_state/manifest.json";

const PARQUET_EXT: &str = ".parquet";
const TMP_EXT: &str = ".tmp";
const DATE_PREFIX: &str = "date=";
const DATE_FMT: &str = "%Y-%m-%d";

/// Lake layer. Ordered: raw < processed < cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Raw,
    Processed,
    Cleaned,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Self::Raw, Self::Processed, Self::Cleaned];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Processed => "processed",
            Self::Cleaned => "cleaned",
        }
    }

    /// Layer this one is derived from.
    pub fn input(self) -> Option<Self> {
        match self {
            Self::Raw => None,
            Self::Processed => Some(Self::Raw),
            Self::Cleaned => Some(Self::Processed),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "processed" => Ok(Self::Processed),
            "cleaned" => Ok(Self::Cleaned),
            other => Err(format!("unknown layer: {other}")),
        }
    }
}

/// Identity of one partition: (layer, dataset, date, variant).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey {
    pub layer: Layer,
    pub dataset: String,
    pub date: NaiveDate,
    pub variant: String,
}

impl PartitionKey {
    /// Key with the default variant `{dataset}_{date}`.
    pub fn new(layer: Layer, dataset: &str, date: NaiveDate) -> Self {
        Self::with_variant(layer, dataset, date, &default_variant(dataset, date))
    }

    pub fn with_variant(layer: Layer, dataset: &str, date: NaiveDate, variant: &str) -> Self {
        Self {
            layer,
            dataset: dataset.to_string(),
            date,
            variant: variant.to_string(),
        }
    }

    pub fn is_default_variant(&self) -> bool {
        self.variant == default_variant(&self.dataset, self.date)
    }

    /// Short label for logs: `raw/clima/2025-03-10[/variant]`.
    pub fn label(&self) -> String {
        let base = format!("{}/{}/{}", self.layer, self.dataset, self.date);
        if self.is_default_variant() {
            base
        } else {
            format!("{base}/{}", self.variant)
        }
    }

    /// Check dataset and variant names; the key string is built by [`make_key`].
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_valid_dataset(&self.dataset) {
            return Err("dataset must be non-empty lowercase ASCII, digits or '_'");
        }
        if !is_valid_variant(&self.variant) {
            return Err("variant must be non-empty [A-Za-z0-9_.-] and not start with '.'");
        }
        Ok(())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Default variant name for a dataset's date.
pub fn default_variant(dataset: &str, date: NaiveDate) -> String {
    format!("{dataset}_{}", date.format(DATE_FMT))
}

/// Dataset names: lowercase ASCII letters, digits and `_`.
pub fn is_valid_dataset(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

fn is_valid_variant(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(TMP_EXT)
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// `grupo5/{layer}/{dataset}/date=YYYY-MM-DD/{variant}.parquet`
pub fn make_key(key: &PartitionKey) -> Result<String, MalformedKeyError> {
    let display = format!(
        "{}{}{}",
        date_prefix(key.layer, &key.dataset, key.date),
        key.variant,
        PARQUET_EXT
    );
    key.validate()
        .map_err(|reason| MalformedKeyError::new(&display, reason))?;
    Ok(display)
}

/// Inverse of [`make_key`].
pub fn parse_key(s: &str) -> Result<PartitionKey, MalformedKeyError> {
    let err = |reason| MalformedKeyError::new(s, reason);

    let stem = s
        .strip_suffix(PARQUET_EXT)
        .ok_or_else(|| err("missing .parquet suffix"))?;
    let parts: Vec<&str> = stem.split('/').collect();
    let [root, layer, dataset, date, variant] = parts[..] else {
        return Err(err("expected 5 path segments"));
    };

    if root != LAKE_ROOT {
        return Err(err("key outside the lake root"));
    }
    let layer: Layer = layer.parse().map_err(|_| err("unknown layer"))?;
    let date_str = date
        .strip_prefix(DATE_PREFIX)
        .ok_or_else(|| err("date segment must start with 'date='"))?;
    let date = NaiveDate::parse_from_str(date_str, DATE_FMT).map_err(|_| err("invalid date"))?;
    // Reject non-canonical spellings such as 2025-1-1
    if date.format(DATE_FMT).to_string() != date_str {
        return Err(err("date must be YYYY-MM-DD"));
    }

    let key = PartitionKey::with_variant(layer, dataset, date, variant);
    key.validate().map_err(err)?;
    Ok(key)
}

/// `grupo5/{layer}/`
pub fn layer_prefix(layer: Layer) -> String {
    format!("{LAKE_ROOT}/{layer}/")
}

/// `grupo5/{layer}/{dataset}/`
pub fn dataset_prefix(layer: Layer, dataset: &str) -> String {
    format!("{LAKE_ROOT}/{layer}/{dataset}/")
}

/// `grupo5/{layer}/{dataset}/date=YYYY-MM-DD/`
pub fn date_prefix(layer: Layer, dataset: &str, date: NaiveDate) -> String {
    format!(
        "{}{DATE_PREFIX}{}/",
        dataset_prefix(layer, dataset),
        date.format(DATE_FMT)
    )
}

/// Quality report next to a cleaned partition.
pub fn report_key(key: &PartitionKey) -> String {
    let prefix = date_prefix(Layer::Cleaned, &key.dataset, key.date);
    if key.is_default_variant() {
        format!("{prefix}quality_report_{}.json", key.date.format(DATE_FMT))
    } else {
        format!("{prefix}quality_report_{}.json", key.variant)
    }
}

/// Staging key for an object about to be renamed to `final_key`.
pub fn tmp_key(final_key: &str, nonce: &str) -> String {
    format!("{final_key}.{nonce}{TMP_EXT}")
}

pub fn is_tmp_key(key: &str) -> bool {
    key.ends_with(TMP_EXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn make_key_default_variant() {
        let key = PartitionKey::new(Layer::Raw, "gtfs_with_delays", d(2025, 1, 1));
        assert_eq!(
            make_key(&key).unwrap(),
            "grupo5/raw/gtfs_with_delays/date=2025-01-01/gtfs_with_delays_2025-01-01.parquet"
        );
    }

    #[test]
    fn make_key_processed_layout_matches_lake() {
        let key = PartitionKey::with_variant(
            Layer::Processed,
            "gtfs_with_delays",
            d(2025, 3, 10),
            "mta_delays_2025-03-10",
        );
        assert_eq!(
            make_key(&key).unwrap(),
            "grupo5/processed/gtfs_with_delays/date=2025-03-10/mta_delays_2025-03-10.parquet"
        );
    }

    #[test]
    fn make_key_rejects_bad_dataset() {
        let key = PartitionKey::new(Layer::Raw, "Clima", d(2025, 1, 1));
        assert!(make_key(&key).is_err());
        let key = PartitionKey::with_variant(Layer::Raw, "clima", d(2025, 1, 1), "a/b");
        assert!(make_key(&key).is_err());
    }

    #[test]
    fn parse_key_rejects_malformed() {
        for bad in [
            "grupo5/raw/clima/date=2025-03-10/clima.csv",
            "grupo5/raw/clima/clima.parquet",
            "other/raw/clima/date=2025-03-10/clima.parquet",
            "grupo5/bronze/clima/date=2025-03-10/clima.parquet",
            "grupo5/raw/clima/2025-03-10/clima.parquet",
            "grupo5/raw/clima/date=2025-3-10/clima.parquet",
            "grupo5/raw/clima/date=2025-02-30/clima.parquet",
            "grupo5/raw/clima/date=2025-03-10/.parquet",
            "grupo5/raw/clima/date=2025-03-10/x/clima.parquet",
            MANIFEST_KEY,
        ] {
            assert!(parse_key(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn tmp_keys_never_parse() {
        let key = make_key(&PartitionKey::new(Layer::Raw, "clima", d(2025, 3, 10))).unwrap();
        let tmp = tmp_key(&key, "deadbeef");
        assert!(is_tmp_key(&tmp));
        assert!(parse_key(&tmp).is_err());
    }

    #[test]
    fn report_key_layout() {
        assert_eq!(
            report_key(&PartitionKey::new(Layer::Cleaned, "clima", d(2025, 1, 2))),
            "grupo5/cleaned/clima/date=2025-01-02/quality_report_2025-01-02.json"
        );
        let split = PartitionKey::with_variant(
            Layer::Cleaned,
            "gtfs_with_delays",
            d(2025, 1, 2),
            "gtfs_scheduled_2025-01-02",
        );
        assert_eq!(
            report_key(&split),
            "grupo5/cleaned/gtfs_with_delays/date=2025-01-02/quality_report_gtfs_scheduled_2025-01-02.json"
        );
    }

    #[test]
    fn label_shows_variant_only_when_custom() {
        let key = PartitionKey::new(Layer::Raw, "clima", d(2025, 3, 10));
        assert_eq!(key.label(), "raw/clima/2025-03-10");
        let key = PartitionKey::with_variant(Layer::Raw, "eventos_nyc", d(2025, 3, 10), "eventos");
        assert_eq!(key.label(), "raw/eventos_nyc/2025-03-10/eventos");
    }

    #[test]
    fn layers_are_ordered() {
        assert!(Layer::Raw < Layer::Processed && Layer::Processed < Layer::Cleaned);
        assert_eq!(Layer::Cleaned.input(), Some(Layer::Processed));
        assert_eq!("processed".parse::<Layer>(), Ok(Layer::Processed));
    }

    fn arb_key() -> impl Strategy<Value = PartitionKey> {
        (
            prop::sample::select(Layer::ALL.to_vec()),
            "[a-z0-9_]{1,24}",
            (1970i32..2100, 1u32..=12, 1u32..=28),
            prop::option::of("[A-Za-z0-9_-][A-Za-z0-9_.-]{0,30}"),
        )
            .prop_filter("variant must not look like a tmp key", |(_, _, _, v)| {
                !v.as_deref().is_some_and(|v| v.ends_with(".tmp"))
            })
            .prop_map(|(layer, dataset, (y, m, day), variant)| {
                let date = NaiveDate::from_ymd_opt(y, m, day).unwrap();
                match variant {
                    Some(v) => PartitionKey::with_variant(layer, &dataset, date, &v),
                    None => PartitionKey::new(layer, &dataset, date),
                }
            })
    }

    proptest! {
        #[test]
        fn key_round_trip(key in arb_key()) {
            let s = make_key(&key).unwrap();
            prop_assert_eq!(parse_key(&s).unwrap(), key);
        }

        #[test]
        fn parse_never_panics(s in ".{0,80}") {
            let _ = parse_key(&s);
        }
    }
}
