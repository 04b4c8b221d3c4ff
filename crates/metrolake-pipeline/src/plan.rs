//! Which partitions a run covers and which of them need work

use std::fmt;

use chrono::NaiveDate;
use metrolake_core::date_range;
use metrolake_store::{Layer, ManifestEntry, ManifestStore, PartitionKey, PartitionStatus};
use thiserror::Error;

use crate::config::Dataset;
use crate::job::Job;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Inclusive.
    pub start: NaiveDate,
    /// Inclusive.
    pub end: NaiveDate,
    /// Empty means every configured dataset.
    pub datasets: Vec<String>,
    /// Run only this layer.
    pub layer: Option<Layer>,
    /// Re-run materialized processed/cleaned partitions. Raw stays write-once.
    pub force: bool,
}

impl RunRequest {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            datasets: Vec::new(),
            layer: None,
            force: false,
        }
    }

    pub fn for_datasets(mut self, names: &[&str]) -> Self {
        self.datasets = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn only_layer(mut self, layer: Layer) -> Self {
        self.layer = Some(layer);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn layers(&self) -> Vec<Layer> {
        match self.layer {
            Some(layer) => vec![layer],
            None => Layer::ALL.to_vec(),
        }
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        date_range(self.start, self.end).collect()
    }

    fn wants(&self, dataset: &str) -> bool {
        self.datasets.is_empty() || self.datasets.iter().any(|d| d == dataset)
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("start date {start} is after end date {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },
    #[error("unknown dataset {0:?}")]
    UnknownDataset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Cached,
    NeedsRun,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cached => write!(f, "CACHED"),
            Self::NeedsRun => write!(f, "NEEDS_RUN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedJob {
    pub job: Job,
    /// Manifest status at planning time.
    pub existing: Option<PartitionStatus>,
    pub status: PlanStatus,
}

/// Check the request against the configured datasets.
pub fn check_request(request: &RunRequest, datasets: &[Dataset]) -> Result<(), PlanError> {
    if request.start > request.end {
        return Err(PlanError::InvalidRange {
            start: request.start,
            end: request.end,
        });
    }
    for name in &request.datasets {
        if !datasets.iter().any(|d| &d.name == name) {
            return Err(PlanError::UnknownDataset(name.clone()));
        }
    }
    Ok(())
}

/// Keys a partition of `layer` is derived from, for the same date.
pub fn input_keys(dataset: &Dataset, key: &PartitionKey) -> Vec<PartitionKey> {
    match key.layer {
        Layer::Raw => Vec::new(),
        Layer::Processed => dataset.raw_keys(key.date),
        Layer::Cleaned => vec![PartitionKey::new(Layer::Processed, &dataset.name, key.date)],
    }
}

/// Whether an existing entry can be kept as is.
///
/// Raw partitions are kept once materialized; an empty raw partition is
/// fetched again. Processed and cleaned ones, empty or not, are kept unless
/// forced or an input changed after them.
fn is_cached(
    manifest: &ManifestStore,
    dataset: &Dataset,
    key: &PartitionKey,
    entry: Option<&ManifestEntry>,
    force: bool,
) -> bool {
    let Some(entry) = entry else {
        return false;
    };
    if key.layer == Layer::Raw {
        return entry.status == PartitionStatus::Materialized;
    }
    // An empty processed/cleaned result is as settled as a written one
    if !matches!(
        entry.status,
        PartitionStatus::Materialized | PartitionStatus::Empty
    ) {
        return false;
    }
    if force {
        return false;
    }
    input_keys(dataset, key).iter().all(|input| {
        match manifest.entry_for(input) {
            Ok(Some(e)) => e.updated_at <= entry.updated_at,
            _ => true,
        }
    })
}

/// Jobs of one layer, each marked cached or to run, against the manifest
/// as it is now.
pub fn plan_layer(
    manifest: &ManifestStore,
    datasets: &[Dataset],
    request: &RunRequest,
    layer: Layer,
) -> Vec<PlannedJob> {
    let dates = request.dates();
    let mut planned = Vec::new();

    for dataset in datasets.iter().filter(|d| request.wants(&d.name)) {
        for &date in &dates {
            let jobs: Vec<Job> = match layer {
                Layer::Raw => dataset
                    .sources
                    .iter()
                    .enumerate()
                    .map(|(idx, s)| Job::new(s.raw_key(&dataset.name, date), Some(idx)))
                    .collect(),
                Layer::Processed => {
                    vec![Job::new(PartitionKey::new(layer, &dataset.name, date), None)]
                }
                Layer::Cleaned => dataset
                    .cleaned_keys(date)
                    .into_iter()
                    .map(|key| Job::new(key, None))
                    .collect(),
            };
            for job in jobs {
                let entry = manifest.entry_for(&job.key).ok().flatten();
                let status = if is_cached(manifest, dataset, &job.key, entry.as_ref(), request.force)
                {
                    PlanStatus::Cached
                } else {
                    PlanStatus::NeedsRun
                };
                planned.push(PlannedJob {
                    job,
                    existing: entry.map(|e| e.status),
                    status,
                });
            }
        }
    }
    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use metrolake_sources::StaticSource;
    use metrolake_store::{LakeStore, ObjectStoreClient};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn datasets() -> Vec<Dataset> {
        let src = Arc::new(StaticSource::new("mta", &["match_key"], Vec::new()));
        vec![Dataset::builtin("gtfs_with_delays").unwrap().with_source(None, src)]
    }

    fn manifest() -> ManifestStore {
        let client: Arc<dyn ObjectStoreClient> =
            Arc::new(LakeStore::in_memory(Duration::from_secs(5)));
        ManifestStore::load(client).unwrap()
    }

    fn materialize(m: &ManifestStore, key: &PartitionKey, hash: &str) {
        let claim = m.claim(key, true).unwrap();
        m.complete(&claim, PartitionStatus::Materialized, 1, Some(hash.into()))
            .unwrap();
    }

    fn settle_empty(m: &ManifestStore, key: &PartitionKey) {
        let claim = m.claim(key, true).unwrap();
        m.complete(&claim, PartitionStatus::Empty, 0, None).unwrap();
    }

    #[test]
    fn request_validation() {
        let ds = datasets();
        assert!(check_request(&RunRequest::new(d(2), d(1)), &ds).is_err());
        let bad = RunRequest::new(d(1), d(2)).for_datasets(&["clima"]);
        assert!(matches!(check_request(&bad, &ds), Err(PlanError::UnknownDataset(_))));
        check_request(&RunRequest::new(d(1), d(1)), &ds).unwrap();
    }

    #[test]
    fn materialized_raw_is_cached_even_when_forced() {
        let m = manifest();
        let ds = datasets();
        materialize(&m, &ds[0].raw_keys(d(1))[0], "h");

        let req = RunRequest::new(d(1), d(2)).forced();
        let plan = plan_layer(&m, &ds, &req, Layer::Raw);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].status, PlanStatus::Cached);
        assert_eq!(plan[1].status, PlanStatus::NeedsRun);
        assert_eq!(plan[1].existing, None);
    }

    #[test]
    fn processed_reruns_when_input_is_newer() {
        let m = manifest();
        let ds = datasets();
        let raw = ds[0].raw_keys(d(1))[0].clone();
        let processed = PartitionKey::new(Layer::Processed, "gtfs_with_delays", d(1));
        materialize(&m, &raw, "h");
        materialize(&m, &processed, "p");

        let req = RunRequest::new(d(1), d(1));
        assert_eq!(plan_layer(&m, &ds, &req, Layer::Processed)[0].status, PlanStatus::Cached);
        assert_eq!(
            plan_layer(&m, &ds, &req.clone().forced(), Layer::Processed)[0].status,
            PlanStatus::NeedsRun
        );

        // Same content again is not a change
        std::thread::sleep(Duration::from_millis(5));
        materialize(&m, &raw, "h");
        assert_eq!(plan_layer(&m, &ds, &req, Layer::Processed)[0].status, PlanStatus::Cached);

        materialize(&m, &raw, "h2");
        assert_eq!(plan_layer(&m, &ds, &req, Layer::Processed)[0].status, PlanStatus::NeedsRun);
    }

    #[test]
    fn empty_results_settle_only_above_raw() {
        let m = manifest();
        let ds = datasets();
        let raw = ds[0].raw_keys(d(1))[0].clone();
        let processed = PartitionKey::new(Layer::Processed, "gtfs_with_delays", d(1));
        settle_empty(&m, &raw);
        settle_empty(&m, &processed);

        let req = RunRequest::new(d(1), d(1));
        assert_eq!(plan_layer(&m, &ds, &req, Layer::Raw)[0].status, PlanStatus::NeedsRun);
        assert_eq!(plan_layer(&m, &ds, &req, Layer::Processed)[0].status, PlanStatus::Cached);

        // A refetch that stays empty leaves processed alone
        std::thread::sleep(Duration::from_millis(5));
        settle_empty(&m, &raw);
        assert_eq!(plan_layer(&m, &ds, &req, Layer::Processed)[0].status, PlanStatus::Cached);
    }

    #[test]
    fn cleaned_layer_plans_each_split() {
        let m = manifest();
        let ds = datasets();
        materialize(&m, &PartitionKey::new(Layer::Processed, "gtfs_with_delays", d(1)), "p");
        materialize(&m, &ds[0].cleaned_keys(d(1))[0], "s");

        let plan = plan_layer(&m, &ds, &RunRequest::new(d(1), d(1)), Layer::Cleaned);
        let jobs: Vec<(&str, PlanStatus)> = plan
            .iter()
            .map(|p| (p.job.key.variant.as_str(), p.status))
            .collect();
        assert_eq!(
            jobs,
            [
                ("gtfs_scheduled_2025-01-01", PlanStatus::Cached),
                ("gtfs_unscheduled_2025-01-01", PlanStatus::NeedsRun),
            ]
        );
    }

    #[test]
    fn status_labels() {
        assert_eq!(PlanStatus::Cached.to_string(), "CACHED");
        assert_eq!(PlanStatus::NeedsRun.to_string(), "NEEDS_RUN");
    }
}
