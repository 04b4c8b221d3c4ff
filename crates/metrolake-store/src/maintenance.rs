//! Integrity checks and housekeeping on the stored lake

use std::collections::BTreeMap;

use metrolake_core::StoreError;

use crate::client::ObjectStoreClient;
use crate::hash::hash_bytes;
use crate::key::{LAKE_ROOT, is_tmp_key};
use crate::manifest::{ManifestStore, PartitionStatus};

/// Verification result for a single partition object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub key: String,
    pub expected: String,
    pub actual: String,
    pub ok: bool,
}

/// Recompute the content hash of one materialized partition.
pub fn verify(
    client: &dyn ObjectStoreClient,
    manifest: &ManifestStore,
    object_key: &str,
) -> Result<VerifyResult, StoreError> {
    let entry = manifest
        .get(object_key)
        .ok_or_else(|| StoreError::NotFound(format!("no manifest entry for {object_key}")))?;
    let expected = entry.content_hash.unwrap_or_default();

    let actual = match client.get(object_key) {
        Ok(data) => hash_bytes(&data).to_hex().to_string(),
        Err(StoreError::NotFound(_)) => "MISSING".to_string(),
        Err(e) => return Err(e),
    };

    Ok(VerifyResult {
        key: object_key.to_string(),
        ok: actual == expected,
        expected,
        actual,
    })
}

/// Verify every `Materialized` partition in the manifest.
pub fn verify_all(
    client: &dyn ObjectStoreClient,
    manifest: &ManifestStore,
) -> Result<BTreeMap<String, VerifyResult>, StoreError> {
    let mut results = BTreeMap::new();
    for (key, _) in manifest.entries_with(&[PartitionStatus::Materialized]) {
        let result = verify(client, manifest, &key)?;
        if !result.ok {
            log::warn!("verify {key}: expected {} got {}", result.expected, result.actual);
        }
        results.insert(key, result);
    }
    Ok(results)
}

/// Stale staging objects under the lake root.
pub fn stale_tmp_objects(client: &dyn ObjectStoreClient) -> Result<Vec<String>, StoreError> {
    Ok(client
        .list(&format!("{LAKE_ROOT}/"))?
        .into_iter()
        .filter(|k| is_tmp_key(k))
        .collect())
}

/// Remove stale staging objects. Returns the removed keys.
pub fn cleanup_tmp(client: &dyn ObjectStoreClient) -> Result<Vec<String>, StoreError> {
    let stale = stale_tmp_objects(client)?;
    for key in &stale {
        log::info!("cleaning stale tmp: {key}");
        client.delete(key)?;
    }
    Ok(stale)
}
