//! Readers never observe a partial partition object under a partition key.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use metrolake_core::{Record, StoreError, is_valid_parquet};
use metrolake_store::{
    LakeStore, Layer, LayerWriter, ManifestStore, ObjectStoreClient, PartitionKey, is_tmp_key,
    parse_key,
};

/// Wraps a store and checks every object that becomes visible under a
/// partition key.
struct ObservingStore {
    inner: LakeStore,
    violations: Mutex<Vec<String>>,
    visible: Mutex<Vec<String>>,
}

impl ObservingStore {
    fn new() -> Self {
        Self {
            inner: LakeStore::in_memory(Duration::from_secs(5)),
            violations: Mutex::new(Vec::new()),
            visible: Mutex::new(Vec::new()),
        }
    }

    fn observe(&self, key: &str) {
        if parse_key(key).is_err() {
            return;
        }
        self.visible.lock().unwrap().push(key.to_string());
        let ok = self.inner.get(key).is_ok_and(|b| is_valid_parquet(&b));
        if !ok {
            self.violations.lock().unwrap().push(key.to_string());
        }
    }
}

impl ObjectStoreClient for ObservingStore {
    fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        if parse_key(key).is_ok() {
            // Direct puts onto a partition key are not allowed at all
            self.violations.lock().unwrap().push(format!("direct put {key}"));
        }
        self.inner.put(key, data)?;
        self.observe(key);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        self.inner.rename(from, to)?;
        self.observe(to);
        Ok(())
    }
}

#[test]
fn partition_objects_appear_whole() {
    let observer = Arc::new(ObservingStore::new());
    let client: Arc<dyn ObjectStoreClient> = observer.clone();
    let manifest = Arc::new(ManifestStore::load(Arc::clone(&client)).unwrap());
    let writer = LayerWriter::new(Arc::clone(&client), manifest);

    let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let ts = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
    let records: Vec<Record> = (0..500)
        .map(|i| {
            Record::new(ts, ts)
                .with("match_key", format!("trip_{i}"))
                .with("delay_seconds", i as i64)
        })
        .collect();

    for layer in Layer::ALL {
        let key = PartitionKey::new(layer, "gtfs_with_delays", date);
        let claim = writer.manifest().claim(&key, false).unwrap();
        writer.write(&claim, &records).unwrap();
    }

    assert!(observer.violations.lock().unwrap().is_empty());
    assert_eq!(observer.visible.lock().unwrap().len(), 3);
    let leftovers: Vec<_> = client
        .list("grupo5/")
        .unwrap()
        .into_iter()
        .filter(|k| is_tmp_key(k))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}
