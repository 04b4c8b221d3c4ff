//! Layer writer: atomic partition writes
//!
//! A partition is encoded in memory, uploaded under a staging key and then
//! renamed onto its final key, so a partition key only ever holds a complete
//! object. Raw partitions are write-once; processed and cleaned partitions
//! are overwritten on re-run.

use std::sync::Arc;

use metrolake_core::{
    DEFAULT_ZSTD_LEVEL, MalformedKeyError, Record, Retryable, StoreError, decode_partition,
    encode_partition,
};
use serde::Serialize;
use thiserror::Error;

use crate::client::ObjectStoreClient;
use crate::hash::{hash_bytes, short_hash};
use crate::key::{Layer, PartitionKey, make_key, report_key, tmp_key};
use crate::lock::KeyLocks;
use crate::manifest::{Claim, ManifestError, ManifestStore, PartitionStatus};

/// Failure while writing a partition.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("write failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] MalformedKeyError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl Retryable for WriteError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Manifest(e) => e.is_retryable(),
            Self::Key(_) => false,
        }
    }
}

/// What a successful write left in the lake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRef {
    pub key: PartitionKey,
    pub object_key: String,
    pub record_count: usize,
    /// `None` for empty partitions (no object written).
    pub content_hash: Option<String>,
    /// An existing raw object was kept instead of writing a new one.
    pub adopted: bool,
}

pub struct LayerWriter {
    client: Arc<dyn ObjectStoreClient>,
    manifest: Arc<ManifestStore>,
    locks: KeyLocks,
    zstd_level: i32,
}

impl LayerWriter {
    pub fn new(client: Arc<dyn ObjectStoreClient>, manifest: Arc<ManifestStore>) -> Self {
        Self {
            client,
            manifest,
            locks: KeyLocks::new(),
            zstd_level: DEFAULT_ZSTD_LEVEL,
        }
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    pub fn client(&self) -> &Arc<dyn ObjectStoreClient> {
        &self.client
    }

    pub fn manifest(&self) -> &Arc<ManifestStore> {
        &self.manifest
    }

    /// Write the claimed partition and mark it in the manifest.
    ///
    /// Zero records mark the entry `Empty` without writing an object.
    pub fn write(&self, claim: &Claim, records: &[Record]) -> Result<PartitionRef, WriteError> {
        let key = &claim.key;
        let object_key = make_key(key)?;
        let _guard = self.locks.acquire(&object_key);

        if key.layer == Layer::Raw && self.client.exists(&object_key)? {
            return self.adopt(claim, object_key);
        }

        if records.is_empty() {
            self.manifest
                .complete(claim, PartitionStatus::Empty, 0, None)?;
            log::info!("{}: no records, marked empty", key.label());
            return Ok(PartitionRef {
                key: key.clone(),
                object_key,
                record_count: 0,
                content_hash: None,
                adopted: false,
            });
        }

        let data = encode_partition(records, self.zstd_level)?;
        let hash = hash_bytes(&data);
        let staging = tmp_key(&object_key, &short_hash(&hash));

        self.client.put(&staging, data)?;
        if let Err(e) = self.client.rename(&staging, &object_key) {
            if let Err(cleanup) = self.client.delete(&staging) {
                log::warn!("{}: failed to remove staging object: {cleanup}", key.label());
            }
            return Err(e.into());
        }

        let hex = hash.to_hex().to_string();
        self.manifest.complete(
            claim,
            PartitionStatus::Materialized,
            records.len(),
            Some(hex.clone()),
        )?;
        log::debug!(
            "{}: wrote {} records ({})",
            key.label(),
            records.len(),
            &hex[..8]
        );

        Ok(PartitionRef {
            key: key.clone(),
            object_key,
            record_count: records.len(),
            content_hash: Some(hex),
            adopted: false,
        })
    }

    /// Raw partitions are never rewritten: take over an object written by an
    /// earlier run whose manifest update was lost.
    fn adopt(&self, claim: &Claim, object_key: String) -> Result<PartitionRef, WriteError> {
        let data = self.client.get(&object_key)?;
        let hex = hash_bytes(&data).to_hex().to_string();
        let record_count = decode_partition(data)?.len();
        self.manifest.complete(
            claim,
            PartitionStatus::Materialized,
            record_count,
            Some(hex.clone()),
        )?;
        log::info!(
            "{}: raw partition already stored, adopting ({record_count} records)",
            claim.key.label()
        );
        Ok(PartitionRef {
            key: claim.key.clone(),
            object_key,
            record_count,
            content_hash: Some(hex),
            adopted: true,
        })
    }

    /// Store a quality report next to the cleaned partition.
    pub fn write_report(
        &self,
        partition: &PartitionKey,
        report: &impl Serialize,
    ) -> Result<String, WriteError> {
        let key = report_key(partition);
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| StoreError::Codec(format!("failed to serialize report: {e}")))?;
        self.client.put(&key, json.into())?;
        Ok(key)
    }
}

/// Read a stored partition back into records.
pub fn read_partition(
    client: &dyn ObjectStoreClient,
    key: &PartitionKey,
) -> Result<Vec<Record>, StoreError> {
    let object_key = make_key(key).map_err(|e| StoreError::Rejected(e.to_string()))?;
    decode_partition(client.get(&object_key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LakeStore;
    use crate::key::is_tmp_key;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::time::Duration;

    fn setup() -> (Arc<dyn ObjectStoreClient>, LayerWriter) {
        let client: Arc<dyn ObjectStoreClient> =
            Arc::new(LakeStore::in_memory(Duration::from_secs(5)));
        let manifest = Arc::new(ManifestStore::load(Arc::clone(&client)).unwrap());
        let writer = LayerWriter::new(Arc::clone(&client), manifest);
        (client, writer)
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 10).unwrap()
    }

    fn records(n: i64) -> Vec<Record> {
        let ts = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| Record::new(ts, ts).with("hour", i).with("temperature_2m", 4.5))
            .collect()
    }

    #[test]
    fn write_materializes_and_leaves_no_tmp() {
        let (client, writer) = setup();
        let key = PartitionKey::new(Layer::Raw, "clima", date());
        let claim = writer.manifest().claim(&key, false).unwrap();

        let written = writer.write(&claim, &records(24)).unwrap();
        assert_eq!(written.record_count, 24);
        assert!(!written.adopted);

        let keys = client.list("grupo5/").unwrap();
        assert!(keys.iter().all(|k| !is_tmp_key(k)));
        assert!(keys.contains(&written.object_key));

        let entry = writer.manifest().get(&written.object_key).unwrap();
        assert_eq!(entry.status, PartitionStatus::Materialized);
        assert_eq!(entry.content_hash, written.content_hash);

        assert_eq!(read_partition(client.as_ref(), &key).unwrap(), records(24));
    }

    #[test]
    fn empty_partition_writes_nothing() {
        let (client, writer) = setup();
        let key = PartitionKey::new(Layer::Raw, "official_alerts", date());
        let claim = writer.manifest().claim(&key, false).unwrap();

        let written = writer.write(&claim, &[]).unwrap();
        assert_eq!(written.content_hash, None);
        assert!(!client.exists(&written.object_key).unwrap());
        assert_eq!(
            writer.manifest().get(&written.object_key).unwrap().status,
            PartitionStatus::Empty
        );
    }

    #[test]
    fn raw_is_write_once() {
        let (client, writer) = setup();
        let key = PartitionKey::new(Layer::Raw, "clima", date());

        let claim = writer.manifest().claim(&key, false).unwrap();
        let first = writer.write(&claim, &records(3)).unwrap();
        let original = client.get(&first.object_key).unwrap();

        // Simulate a lost manifest update, then a second run with new data
        let entry = writer.manifest().get(&first.object_key).unwrap();
        writer
            .manifest()
            .compare_and_set(&first.object_key, Some(&entry), None)
            .unwrap();
        let claim = writer.manifest().claim(&key, false).unwrap();
        let second = writer.write(&claim, &records(5)).unwrap();

        assert!(second.adopted);
        assert_eq!(second.record_count, 3);
        assert_eq!(client.get(&first.object_key).unwrap(), original);
    }

    #[test]
    fn processed_is_overwritten() {
        let (client, writer) = setup();
        let key = PartitionKey::new(Layer::Processed, "clima", date());

        let claim = writer.manifest().claim(&key, false).unwrap();
        writer.write(&claim, &records(3)).unwrap();
        let claim = writer.manifest().claim(&key, true).unwrap();
        let second = writer.write(&claim, &records(5)).unwrap();

        assert!(!second.adopted);
        assert_eq!(read_partition(client.as_ref(), &key).unwrap().len(), 5);
    }

    #[test]
    fn report_lands_next_to_cleaned_partition() {
        let (client, writer) = setup();
        let key = writer
            .write_report(
                &PartitionKey::new(Layer::Cleaned, "clima", date()),
                &serde_json::json!({"rows_in": 24}),
            )
            .unwrap();
        assert_eq!(
            key,
            "grupo5/cleaned/clima/date=2025-03-10/quality_report_2025-03-10.json"
        );
        let body: serde_json::Value = serde_json::from_slice(&client.get(&key).unwrap()).unwrap();
        assert_eq!(body["rows_in"], 24);
    }
}
