//! Partition manifest: which partitions exist and in what state
//!
//! One JSON object at [`MANIFEST_KEY`] maps object keys to entries and keeps
//! per-dataset ingestion watermarks. Every transition is a compare-and-set
//! under a mutex; the whole manifest is persisted before the lock is
//! released, so the stored copy always reflects a consistent state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use metrolake_core::{MalformedKeyError, Retryable, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ObjectStoreClient;
use crate::hash::{hash_bytes, short_hash};
use crate::key::{Layer, MANIFEST_KEY, PartitionKey, make_key, tmp_key};

/// Bumped when the manifest layout changes incompatibly.
pub const CURRENT_FORMAT_VERSION: u32 = 1;

/// Lifecycle of a partition in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    InProgress,
    Materialized,
    /// Source had no data for the window. Retried on the next run.
    Empty,
    Failed,
}

impl PartitionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Materialized => "materialized",
            Self::Empty => "empty",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "materialized" => Ok(Self::Materialized),
            "empty" => Ok(Self::Empty),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// State of one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub status: PartitionStatus,
    pub layer: Layer,
    pub dataset: String,
    pub date: NaiveDate,
    pub variant: String,
    #[serde(default)]
    pub record_count: usize,
    /// Blake3 hex of the stored object.
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn new(key: &PartitionKey, status: PartitionStatus) -> Self {
        Self {
            status,
            layer: key.layer,
            dataset: key.dataset.clone(),
            date: key.date,
            variant: key.variant.clone(),
            record_count: 0,
            content_hash: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::with_variant(self.layer, &self.dataset, self.date, &self.variant)
    }
}

/// Serialized manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestState {
    #[serde(default)]
    pub format_version: u32,
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
    /// Latest upstream timestamp ingested per dataset.
    #[serde(default)]
    pub watermarks: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ManifestError {
    /// The entry changed between read and write.
    #[error("{key}: manifest entry changed concurrently (expected {expected}, found {found})")]
    Conflict {
        key: String,
        expected: String,
        found: String,
    },
    #[error("{key}: already {status}")]
    Busy { key: String, status: PartitionStatus },
    #[error("manifest is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Key(#[from] MalformedKeyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Retryable for ManifestError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// A partition held in `InProgress` by one job.
///
/// Remembers the entry it replaced so the job can roll back.
#[derive(Debug, Clone)]
pub struct Claim {
    pub key: PartitionKey,
    pub object_key: String,
    pub prior: Option<ManifestEntry>,
    pub current: ManifestEntry,
}

/// Same outcome and same content as an earlier completion.
fn unchanged(prior: &ManifestEntry, next: &ManifestEntry) -> bool {
    matches!(
        prior.status,
        PartitionStatus::Materialized | PartitionStatus::Empty
    ) && prior.status == next.status
        && prior.record_count == next.record_count
        && prior.content_hash == next.content_hash
}

fn describe(entry: Option<&ManifestEntry>) -> String {
    entry.map_or_else(|| "absent".to_string(), |e| e.status.to_string())
}

/// Manifest backed by an object in the lake.
pub struct ManifestStore {
    client: Arc<dyn ObjectStoreClient>,
    state: Mutex<ManifestState>,
}

impl ManifestStore {
    /// Load the manifest, starting empty if none exists yet.
    pub fn load(client: Arc<dyn ObjectStoreClient>) -> Result<Self, ManifestError> {
        let state = match client.get(MANIFEST_KEY) {
            Ok(bytes) => {
                let state: ManifestState = serde_json::from_slice(&bytes)
                    .map_err(|e| ManifestError::Corrupt(e.to_string()))?;
                if state.format_version > CURRENT_FORMAT_VERSION {
                    return Err(ManifestError::Corrupt(format!(
                        "format_version {} is newer than supported {CURRENT_FORMAT_VERSION}",
                        state.format_version
                    )));
                }
                log::debug!("manifest: loaded {} entries", state.entries.len());
                state
            }
            Err(StoreError::NotFound(_)) => {
                log::info!("manifest: none found, starting empty");
                ManifestState {
                    format_version: CURRENT_FORMAT_VERSION,
                    ..ManifestState::default()
                }
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            client,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManifestState> {
        self.state.lock().expect("manifest lock poisoned")
    }

    fn persist(&self, state: &ManifestState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Codec(format!("failed to serialize manifest: {e}")))?;
        let staging = tmp_key(MANIFEST_KEY, &short_hash(&hash_bytes(&json)));
        self.client.put(&staging, json.into())?;
        if let Err(e) = self.client.rename(&staging, MANIFEST_KEY) {
            if let Err(cleanup) = self.client.delete(&staging) {
                log::warn!("manifest: failed to remove staging object: {cleanup}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Current entry for an object key.
    pub fn get(&self, object_key: &str) -> Option<ManifestEntry> {
        self.lock().entries.get(object_key).cloned()
    }

    pub fn entry_for(&self, key: &PartitionKey) -> Result<Option<ManifestEntry>, ManifestError> {
        Ok(self.get(&make_key(key)?))
    }

    /// Copy of the whole manifest.
    pub fn snapshot(&self) -> ManifestState {
        self.lock().clone()
    }

    /// Replace `expected` with `new` (`None` removes the entry).
    ///
    /// Fails with [`ManifestError::Conflict`] when the current entry is not
    /// `expected`. The in-memory state is only changed if persisting works.
    pub fn compare_and_set(
        &self,
        object_key: &str,
        expected: Option<&ManifestEntry>,
        new: Option<ManifestEntry>,
    ) -> Result<(), ManifestError> {
        let mut state = self.lock();
        let current = state.entries.get(object_key);
        if current != expected {
            return Err(ManifestError::Conflict {
                key: object_key.to_string(),
                expected: describe(expected),
                found: describe(current),
            });
        }

        let mut next = state.clone();
        match new {
            Some(entry) => {
                next.entries.insert(object_key.to_string(), entry);
            }
            None => {
                next.entries.remove(object_key);
            }
        }
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// Move a partition to `InProgress`.
    ///
    /// Absent, `Empty` and `Failed` entries can always be claimed;
    /// `Materialized` only with `overwrite`. `InProgress` is never stolen.
    pub fn claim(&self, key: &PartitionKey, overwrite: bool) -> Result<Claim, ManifestError> {
        let object_key = make_key(key)?;
        let prior = self.get(&object_key);

        if let Some(entry) = &prior {
            let blocked = match entry.status {
                PartitionStatus::InProgress => true,
                PartitionStatus::Materialized => !overwrite,
                PartitionStatus::Empty | PartitionStatus::Failed => false,
            };
            if blocked {
                return Err(ManifestError::Busy {
                    key: object_key,
                    status: entry.status,
                });
            }
        }

        let mut current = ManifestEntry::new(key, PartitionStatus::InProgress);
        current.attempts = prior.as_ref().map_or(0, |e| e.attempts) + 1;
        self.compare_and_set(&object_key, prior.as_ref(), Some(current.clone()))?;

        Ok(Claim {
            key: key.clone(),
            object_key,
            prior,
            current,
        })
    }

    /// Finish a claim as `Materialized` or `Empty`.
    ///
    /// A partition that comes back exactly as it was before the claim keeps
    /// its previous `updated_at`, so downstream layers do not see it as new.
    pub fn complete(
        &self,
        claim: &Claim,
        status: PartitionStatus,
        record_count: usize,
        content_hash: Option<String>,
    ) -> Result<ManifestEntry, ManifestError> {
        let mut entry = claim.current.clone();
        entry.status = status;
        entry.record_count = record_count;
        entry.content_hash = content_hash;
        entry.last_error = None;
        entry.updated_at = match &claim.prior {
            Some(prior) if unchanged(prior, &entry) => prior.updated_at,
            _ => Utc::now(),
        };
        self.compare_and_set(&claim.object_key, Some(&claim.current), Some(entry.clone()))?;
        Ok(entry)
    }

    /// Finish a claim as `Failed` (fatal errors only).
    pub fn fail(&self, claim: &Claim, reason: &str) -> Result<ManifestEntry, ManifestError> {
        let mut entry = claim.current.clone();
        entry.status = PartitionStatus::Failed;
        entry.last_error = Some(reason.to_string());
        entry.updated_at = Utc::now();
        self.compare_and_set(&claim.object_key, Some(&claim.current), Some(entry.clone()))?;
        Ok(entry)
    }

    /// Undo a claim: the entry goes back to what it was before.
    pub fn rollback(&self, claim: &Claim) -> Result<(), ManifestError> {
        self.compare_and_set(&claim.object_key, Some(&claim.current), claim.prior.clone())
    }

    /// Forget a `Failed` entry so the next run starts it from scratch.
    ///
    /// Returns `false` if there was nothing to reset.
    pub fn reset(&self, object_key: &str) -> Result<bool, ManifestError> {
        let Some(entry) = self.get(object_key) else {
            return Ok(false);
        };
        if entry.status != PartitionStatus::Failed {
            return Err(ManifestError::Busy {
                key: object_key.to_string(),
                status: entry.status,
            });
        }
        self.compare_and_set(object_key, Some(&entry), None)?;
        Ok(true)
    }

    /// Drop `InProgress` entries left behind by a crashed run.
    pub fn clear_stale_claims(&self) -> Result<usize, ManifestError> {
        let stale: Vec<(String, ManifestEntry)> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.status == PartitionStatus::InProgress)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        for (key, entry) in &stale {
            log::warn!("manifest: clearing stale claim {key}");
            self.compare_and_set(key, Some(entry), None)?;
        }
        Ok(stale.len())
    }

    pub fn watermark(&self, dataset: &str) -> Option<DateTime<Utc>> {
        self.lock().watermarks.get(dataset).copied()
    }

    /// Raise a dataset's watermark; lower values are ignored.
    pub fn advance_watermark(&self, dataset: &str, ts: DateTime<Utc>) -> Result<(), ManifestError> {
        let mut state = self.lock();
        if state.watermarks.get(dataset).is_some_and(|w| *w >= ts) {
            return Ok(());
        }
        let mut next = state.clone();
        next.watermarks.insert(dataset.to_string(), ts);
        self.persist(&next)?;
        *state = next;
        Ok(())
    }

    /// Entries whose status is one of `statuses`, in key order.
    pub fn entries_with(&self, statuses: &[PartitionStatus]) -> Vec<(String, ManifestEntry)> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| statuses.contains(&e.status))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LakeStore;
    use std::time::Duration;

    fn store() -> Arc<dyn ObjectStoreClient> {
        Arc::new(LakeStore::in_memory(Duration::from_secs(5)))
    }

    fn key() -> PartitionKey {
        PartitionKey::new(
            Layer::Raw,
            "clima",
            NaiveDate::from_ymd_opt(2025, 3, 10).unwrap(),
        )
    }

    #[test]
    fn load_missing_starts_empty() {
        let m = ManifestStore::load(store()).unwrap();
        assert!(m.snapshot().entries.is_empty());
    }

    #[test]
    fn load_corrupt_json() {
        let client = store();
        client.put(MANIFEST_KEY, "not json".into()).unwrap();
        assert!(matches!(
            ManifestStore::load(client),
            Err(ManifestError::Corrupt(_))
        ));
    }

    #[test]
    fn claim_complete_persists() {
        let client = store();
        let m = ManifestStore::load(Arc::clone(&client)).unwrap();
        let claim = m.claim(&key(), false).unwrap();
        assert_eq!(claim.current.status, PartitionStatus::InProgress);
        m.complete(&claim, PartitionStatus::Materialized, 24, Some("abc".into()))
            .unwrap();

        let reloaded = ManifestStore::load(client).unwrap();
        let entry = reloaded.get(&claim.object_key).unwrap();
        assert_eq!(entry.status, PartitionStatus::Materialized);
        assert_eq!(entry.record_count, 24);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.partition_key(), key());
    }

    #[test]
    fn materialized_not_reclaimed_without_overwrite() {
        let m = ManifestStore::load(store()).unwrap();
        let claim = m.claim(&key(), false).unwrap();
        m.complete(&claim, PartitionStatus::Materialized, 1, None)
            .unwrap();
        assert!(matches!(
            m.claim(&key(), false),
            Err(ManifestError::Busy { .. })
        ));
        let again = m.claim(&key(), true).unwrap();
        assert_eq!(again.current.attempts, 2);
    }

    #[test]
    fn in_progress_never_stolen() {
        let m = ManifestStore::load(store()).unwrap();
        let _claim = m.claim(&key(), false).unwrap();
        assert!(m.claim(&key(), true).is_err());
    }

    #[test]
    fn rollback_restores_prior_state() {
        let client = store();
        let m = ManifestStore::load(Arc::clone(&client)).unwrap();
        let before = m.snapshot();
        let claim = m.claim(&key(), false).unwrap();
        m.rollback(&claim).unwrap();
        assert_eq!(m.snapshot().entries, before.entries);
        assert!(ManifestStore::load(client).unwrap().get(&claim.object_key).is_none());
    }

    #[test]
    fn stale_cas_conflicts() {
        let m = ManifestStore::load(store()).unwrap();
        let claim = m.claim(&key(), false).unwrap();
        m.complete(&claim, PartitionStatus::Materialized, 1, None)
            .unwrap();
        // A second completion of the same claim sees a changed entry
        assert!(matches!(
            m.complete(&claim, PartitionStatus::Materialized, 1, None),
            Err(ManifestError::Conflict { .. })
        ));
    }

    #[test]
    fn reset_only_failed() {
        let m = ManifestStore::load(store()).unwrap();
        let claim = m.claim(&key(), false).unwrap();
        m.fail(&claim, "schema drift").unwrap();
        assert_eq!(
            m.get(&claim.object_key).unwrap().last_error.as_deref(),
            Some("schema drift")
        );
        assert!(m.reset(&claim.object_key).unwrap());
        assert!(m.get(&claim.object_key).is_none());
        assert!(!m.reset(&claim.object_key).unwrap());
    }

    #[test]
    fn clear_stale_claims_removes_in_progress() {
        let m = ManifestStore::load(store()).unwrap();
        m.claim(&key(), false).unwrap();
        assert_eq!(m.clear_stale_claims().unwrap(), 1);
        assert!(m.snapshot().entries.is_empty());
    }

    #[test]
    fn watermark_is_monotonic() {
        let m = ManifestStore::load(store()).unwrap();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::hours(1);
        m.advance_watermark("clima", t1).unwrap();
        m.advance_watermark("clima", t0).unwrap();
        assert_eq!(m.watermark("clima"), Some(t1));
    }

    #[test]
    fn empty_refetch_keeps_timestamp() {
        let m = ManifestStore::load(store()).unwrap();
        let first = m.claim(&key(), false).unwrap();
        let before = m.complete(&first, PartitionStatus::Empty, 0, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let again = m.claim(&key(), false).unwrap();
        let after = m.complete(&again, PartitionStatus::Empty, 0, None).unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.attempts, 2);
    }

    #[test]
    fn changed_content_moves_timestamp() {
        let m = ManifestStore::load(store()).unwrap();
        let first = m.claim(&key(), false).unwrap();
        let before = m
            .complete(&first, PartitionStatus::Materialized, 3, Some("aaa".into()))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let same = m.claim(&key(), true).unwrap();
        let kept = m
            .complete(&same, PartitionStatus::Materialized, 3, Some("aaa".into()))
            .unwrap();
        assert_eq!(kept.updated_at, before.updated_at);

        let other = m.claim(&key(), true).unwrap();
        let moved = m
            .complete(&other, PartitionStatus::Materialized, 4, Some("bbb".into()))
            .unwrap();
        assert!(moved.updated_at > before.updated_at);
    }

    #[test]
    fn save_leaves_no_staging_objects() {
        let client = store();
        let m = ManifestStore::load(Arc::clone(&client)).unwrap();
        let claim = m.claim(&key(), false).unwrap();
        m.complete(&claim, PartitionStatus::Materialized, 1, None)
            .unwrap();
        m.advance_watermark("clima/clima", Utc::now()).unwrap();

        let keys = client.list("grupo5/_state/").unwrap();
        assert_eq!(keys, [MANIFEST_KEY]);
        assert!(ManifestStore::load(client).unwrap().watermark("clima/clima").is_some());
    }

    #[test]
    fn status_parses_from_cli_spelling() {
        assert_eq!("failed".parse::<PartitionStatus>(), Ok(PartitionStatus::Failed));
        assert!("done".parse::<PartitionStatus>().is_err());
    }
}
