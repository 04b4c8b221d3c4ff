//! Run partition jobs in three waves: raw, processed, cleaned
//!
//! Each wave is a set of independent jobs spread over a rayon pool. A job
//! claims its partition in the manifest, walks the state machine and either
//! completes the claim, marks it `Failed` (fatal errors) or rolls it back
//! (transient errors, cancellation) so the manifest looks untouched.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use indicatif::ProgressBar;
use metrolake_clean::{CleanContext, process, take_split};
use metrolake_core::{
    ProgressContext, Record, Retryable, StoreError, decode_partition, retry_with_backoff,
    shutdown_flag,
};
use metrolake_sources::{FetchWindow, drain};
use metrolake_store::{
    Claim, Layer, LayerWriter, ManifestError, ManifestStore, ObjectStoreClient, PartitionKey,
    PartitionRef, PartitionStatus, hash_bytes, read_partition,
};
use rustc_hash::FxHashSet;
use thiserror::Error;

use crate::config::{Dataset, PipelineConfig, RawSource};
use crate::job::{Job, JobError, JobOutcome, JobState};
use crate::plan::{
    PlanError, PlanStatus, PlannedJob, RunRequest, check_request, input_keys, plan_layer,
};
use crate::report::{RunReport, manifest_diff};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("failed to build worker pool: {0}")]
    Pool(String),
}

pub struct Orchestrator {
    writer: LayerWriter,
    datasets: Vec<Dataset>,
    config: PipelineConfig,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Load the manifest from `client` and get ready to run `datasets`.
    pub fn new(
        client: Arc<dyn ObjectStoreClient>,
        datasets: Vec<Dataset>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let manifest = Arc::new(ManifestStore::load(Arc::clone(&client))?);
        Ok(Self {
            writer: LayerWriter::new(client, manifest),
            datasets,
            config,
            cancel: shutdown_flag(),
        })
    }

    /// Replace the process-wide shutdown flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn manifest(&self) -> &Arc<ManifestStore> {
        self.writer.manifest()
    }

    pub fn client(&self) -> &Arc<dyn ObjectStoreClient> {
        self.writer.client()
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    /// Every job the request covers, marked against the current manifest.
    ///
    /// Higher layers are judged before lower ones run, so this is what a
    /// dry run shows; [`run`](Self::run) re-plans each wave.
    pub fn plan(&self, request: &RunRequest) -> Result<Vec<PlannedJob>, PipelineError> {
        check_request(request, &self.datasets)?;
        Ok(request
            .layers()
            .into_iter()
            .flat_map(|layer| plan_layer(self.manifest(), &self.datasets, request, layer))
            .collect())
    }

    pub fn run(
        &self,
        request: &RunRequest,
        progress: &ProgressContext,
    ) -> Result<RunReport, PipelineError> {
        let start = Instant::now();
        check_request(request, &self.datasets)?;

        let stale = self.manifest().clear_stale_claims()?;
        if stale > 0 {
            log::warn!("Cleared {stale} claims left by an interrupted run");
        }
        let before = self.manifest().snapshot();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build()
            .map_err(|e| PipelineError::Pool(e.to_string()))?;

        let halted: Mutex<FxHashSet<String>> = Mutex::new(FxHashSet::default());
        let mut report = RunReport::empty();

        for layer in request.layers() {
            let planned = plan_layer(self.manifest(), &self.datasets, request, layer);
            let mut jobs = Vec::new();
            for p in planned {
                match p.status {
                    PlanStatus::Cached => report.skipped.push(p.job.key),
                    PlanStatus::NeedsRun => jobs.push(p.job),
                }
            }
            if jobs.is_empty() {
                log::info!("{layer}: nothing to do");
                continue;
            }
            if self.cancelled() {
                report.cancelled.extend(jobs.into_iter().map(|j| j.key));
                continue;
            }

            log::info!(
                "{layer}: {} jobs with {} workers",
                jobs.len(),
                self.config.workers
            );
            let results = pool.install(|| self.run_wave(layer, &jobs, &halted, progress));
            for (job, outcome) in results {
                report.record(job.key, outcome);
            }
        }

        report.changes = manifest_diff(&before, &self.manifest().snapshot());
        report.elapsed = start.elapsed();
        report.log();
        Ok(report)
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn checkpoint(&self) -> Result<(), JobError> {
        if self.cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|d| d.name == name)
    }

    fn run_wave(
        &self,
        layer: Layer,
        jobs: &[Job],
        halted: &Mutex<FxHashSet<String>>,
        progress: &ProgressContext,
    ) -> Vec<(Job, JobOutcome)> {
        let overall_pb = progress.wave_bar(layer.as_str(), jobs.len() as u64);
        let status_pb = progress.wave_line(layer.as_str());

        // Atomic index for work distribution
        let next_idx = AtomicUsize::new(0);
        let results: Mutex<Vec<(Job, JobOutcome)>> = Mutex::new(Vec::with_capacity(jobs.len()));
        let workers = self.config.workers.clamp(1, jobs.len().max(1));

        rayon::scope(|s| {
            for _ in 0..workers {
                s.spawn(|_| loop {
                    let idx = next_idx.fetch_add(1, Ordering::SeqCst);
                    if idx >= jobs.len() {
                        break;
                    }
                    let mut job = jobs[idx].clone();
                    status_pb.set_message(job.label());

                    let outcome = self.run_job(&mut job, halted, &status_pb);
                    overall_pb.inc(1);
                    results
                        .lock()
                        .expect("results lock poisoned")
                        .push((job, outcome));
                });
            }
        });

        overall_pb.finish();
        status_pb.finish_and_clear();

        let mut results = results.into_inner().expect("results lock poisoned");
        results.sort_by(|a, b| a.0.key.cmp(&b.0.key));
        results
    }

    fn run_job(
        &self,
        job: &mut Job,
        halted: &Mutex<FxHashSet<String>>,
        pb: &ProgressBar,
    ) -> JobOutcome {
        let label = job.label();
        if self.cancelled() {
            return JobOutcome::Cancelled;
        }
        if halted
            .lock()
            .expect("halted lock poisoned")
            .contains(&job.key.dataset)
        {
            return JobOutcome::Blocked {
                reason: "dataset halted by a schema error earlier in this run".into(),
            };
        }
        let Some(dataset) = self.dataset(&job.key.dataset) else {
            return JobOutcome::Blocked {
                reason: "dataset not configured".into(),
            };
        };
        let source = job.source.and_then(|idx| dataset.sources.get(idx));
        if job.key.layer == Layer::Raw && source.is_none() {
            return JobOutcome::Blocked {
                reason: "no source configured for this variant".into(),
            };
        }
        if let Err(reason) = self.inputs_ready(dataset, &job.key) {
            log::info!("{label}: blocked, {reason}");
            return JobOutcome::Blocked { reason };
        }

        let claim = match self.manifest().claim(&job.key, job.key.layer != Layer::Raw) {
            Ok(claim) => claim,
            Err(e) => {
                log::error!("{label}: cannot claim partition: {e}");
                return JobOutcome::Failed {
                    reason: e.to_string(),
                    at: JobState::Pending,
                };
            }
        };

        let result = match job.key.layer {
            Layer::Raw => self.run_raw(job, dataset, source, &claim, pb),
            Layer::Processed => self.run_processed(job, dataset, &claim, pb),
            Layer::Cleaned => self.run_cleaned(job, dataset, &claim, pb),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => self.settle_failure(job, &claim, e, halted),
        }
    }

    /// Every input of a processed/cleaned partition must be settled, and at
    /// least one must hold data.
    fn inputs_ready(&self, dataset: &Dataset, key: &PartitionKey) -> Result<(), String> {
        let inputs = input_keys(dataset, key);
        if inputs.is_empty() {
            return Ok(());
        }
        let mut with_data = 0usize;
        for input in &inputs {
            let entry = self
                .manifest()
                .entry_for(input)
                .map_err(|e| e.to_string())?;
            match entry.map(|e| (e.status, e.record_count)) {
                Some((PartitionStatus::Materialized, n)) => with_data += usize::from(n > 0),
                Some((PartitionStatus::Empty, _)) => {}
                Some((status, _)) => return Err(format!("input {} is {status}", input.label())),
                None => return Err(format!("input {} is missing", input.label())),
            }
        }
        if with_data == 0 {
            return Err("no input holds data".into());
        }
        Ok(())
    }

    fn run_raw(
        &self,
        job: &mut Job,
        dataset: &Dataset,
        source: Option<&RawSource>,
        claim: &Claim,
        pb: &ProgressBar,
    ) -> Result<JobOutcome, JobError> {
        let label = job.label();
        let Some(source) = source else {
            return Err(JobError::Verify {
                label,
                reason: "raw job without a source".into(),
            });
        };
        let watermark_name = format!("{}/{}", dataset.name, source.tag(&dataset.name));

        job.advance(JobState::Fetching)?;
        let window = FetchWindow::for_date(job.key.date, self.config.tz);
        let resume = self.resume_after(&watermark_name, &window, claim);
        if let Some(w) = resume {
            log::info!("{label}: resuming after {}", w.to_rfc3339());
        }
        let window = window.resuming_after(resume);
        let drained = retry_with_backoff(&label, &self.config.retry, pb, || {
            drain(source.adapter.as_ref(), &window)
        })?;
        log::info!(
            "{label}: fetched {} records ({} duplicates, {} outside window)",
            drained.records.len(),
            drained.duplicates,
            drained.out_of_window
        );

        self.checkpoint()?;
        job.advance(JobState::Writing)?;
        let written = self.write(&label, claim, &drained.records, pb)?;

        job.advance(JobState::Validating)?;
        self.read_back(&label, &written, pb)?;
        if let Some(ts) = drained.max_source_ts() {
            self.manifest().advance_watermark(&watermark_name, ts)?;
        }

        job.advance(JobState::Done)?;
        Ok(outcome_of(&written))
    }

    /// Watermark a raw fetch resumes after.
    ///
    /// Inside the day it narrows the request. Past the day it only applies
    /// when the source already reported the day empty; a date never fetched
    /// before is fetched in full.
    fn resume_after(
        &self,
        watermark_name: &str,
        window: &FetchWindow,
        claim: &Claim,
    ) -> Option<DateTime<Utc>> {
        let w = self.manifest().watermark(watermark_name)?;
        let was_empty = claim
            .prior
            .as_ref()
            .is_some_and(|e| e.status == PartitionStatus::Empty);
        (w > window.since && (w < window.until || was_empty)).then_some(w)
    }

    fn run_processed(
        &self,
        job: &mut Job,
        dataset: &Dataset,
        claim: &Claim,
        pb: &ProgressBar,
    ) -> Result<JobOutcome, JobError> {
        let label = job.label();
        job.advance(JobState::Fetching)?;

        let mut inputs = Vec::with_capacity(dataset.sources.len());
        for source in &dataset.sources {
            let key = source.raw_key(&dataset.name, job.key.date);
            let records = self.read_settled(&label, &key, pb)?;
            inputs.push((source.tag(&dataset.name).to_string(), records));
        }
        let processed = process(&dataset.schema, &label, inputs)?;
        log::info!(
            "{label}: {} rows from {} raw ({} duplicates, {} without key)",
            processed.records.len(),
            processed.rows_in,
            processed.duplicates,
            processed.missing_key
        );

        self.checkpoint()?;
        job.advance(JobState::Writing)?;
        let written = self.write(&label, claim, &processed.records, pb)?;

        job.advance(JobState::Validating)?;
        self.read_back(&label, &written, pb)?;

        job.advance(JobState::Done)?;
        Ok(outcome_of(&written))
    }

    fn run_cleaned(
        &self,
        job: &mut Job,
        dataset: &Dataset,
        claim: &Claim,
        pb: &ProgressBar,
    ) -> Result<JobOutcome, JobError> {
        let label = job.label();
        let date = job.key.date;
        job.advance(JobState::Fetching)?;

        let input = PartitionKey::new(Layer::Processed, &dataset.name, date);
        let records = self.read_settled(&label, &input, pb)?;
        let prior = self.read_prior(&label, dataset, date, pb)?;

        let ctx = CleanContext::new(date)
            .with_tz(self.config.tz)
            .with_max_ratio(self.config.max_coercion_failure_ratio);
        let mut cleaned = metrolake_clean::clean(records, &prior, &dataset.schema, &ctx)?;
        if !dataset.schema.splits.is_empty() {
            let Some(split) = dataset.split_for(&job.key) else {
                return Err(JobError::Verify {
                    label,
                    reason: "cleaned variant matches no split".into(),
                });
            };
            cleaned = take_split(&cleaned, split, &dataset.schema);
        }
        log::info!(
            "{label}: {} rows kept of {} ({} coercion failures, {} outliers flagged)",
            cleaned.report.rows_out,
            cleaned.report.rows_in,
            cleaned.report.coercion_failures,
            cleaned.report.total_outliers()
        );

        self.checkpoint()?;
        job.advance(JobState::Writing)?;
        let written = self.write(&label, claim, &cleaned.records, pb)?;

        job.advance(JobState::Validating)?;
        self.read_back(&label, &written, pb)?;
        let report_key = retry_with_backoff(&label, &self.config.retry, pb, || {
            self.writer.write_report(&job.key, &cleaned.report)
        })?;
        log::debug!("{label}: quality report at {report_key}");

        job.advance(JobState::Done)?;
        Ok(outcome_of(&written))
    }

    fn write(
        &self,
        label: &str,
        claim: &Claim,
        records: &[Record],
        pb: &ProgressBar,
    ) -> Result<PartitionRef, JobError> {
        Ok(retry_with_backoff(label, &self.config.retry, pb, || {
            self.writer.write(claim, records)
        })?)
    }

    /// Records of an input partition; `Empty` inputs have none.
    fn read_settled(
        &self,
        label: &str,
        key: &PartitionKey,
        pb: &ProgressBar,
    ) -> Result<Vec<Record>, JobError> {
        match self.manifest().entry_for(key)? {
            Some(entry) if entry.status == PartitionStatus::Materialized => {
                Ok(retry_with_backoff(label, &self.config.retry, pb, || {
                    read_partition(self.client().as_ref(), key)
                })?)
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Previous day's processed partition, seeding lag features. Missing or
    /// unfinished partitions seed nothing.
    fn read_prior(
        &self,
        label: &str,
        dataset: &Dataset,
        date: NaiveDate,
        pb: &ProgressBar,
    ) -> Result<Vec<Record>, JobError> {
        let Some(prev) = date.pred_opt() else {
            return Ok(Vec::new());
        };
        let key = PartitionKey::new(Layer::Processed, &dataset.name, prev);
        match self.read_settled(label, &key, pb) {
            Err(JobError::Store(StoreError::NotFound(_))) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Re-read a written object and check it against what the manifest
    /// recorded.
    fn read_back(
        &self,
        label: &str,
        written: &PartitionRef,
        pb: &ProgressBar,
    ) -> Result<(), JobError> {
        let Some(expected) = &written.content_hash else {
            return Ok(());
        };
        let data = retry_with_backoff(label, &self.config.retry, pb, || {
            self.client().get(&written.object_key)
        })?;
        let actual = hash_bytes(&data).to_hex().to_string();
        if &actual != expected {
            return Err(JobError::Verify {
                label: label.to_string(),
                reason: format!("content hash {} != {}", &actual[..8], &expected[..8]),
            });
        }
        let count = decode_partition(data)?.len();
        if count != written.record_count {
            return Err(JobError::Verify {
                label: label.to_string(),
                reason: format!("{count} records stored, {} expected", written.record_count),
            });
        }
        Ok(())
    }

    /// Leave the manifest consistent after a failed job.
    ///
    /// Before the partition was written, transient errors and cancellation
    /// restore the prior entry and fatal errors mark it `Failed`. Once
    /// written, any failure marks it `Failed`.
    fn settle_failure(
        &self,
        job: &mut Job,
        claim: &Claim,
        err: JobError,
        halted: &Mutex<FxHashSet<String>>,
    ) -> JobOutcome {
        let label = job.label();
        let at = job.state();
        if at.can_advance_to(JobState::Failed) {
            // Cannot fail: the transition was just checked
            let _ = job.advance(JobState::Failed);
        }

        let manifest = self.manifest();
        let current = manifest.get(&claim.object_key);
        let settled = if current.as_ref() == Some(&claim.current) {
            if err.is_retryable() || matches!(err, JobError::Cancelled) {
                manifest.rollback(claim)
            } else {
                manifest.fail(claim, &err.to_string()).map(|_| ())
            }
        } else if let Some(entry) = current {
            let mut failed = entry.clone();
            failed.status = PartitionStatus::Failed;
            failed.last_error = Some(err.to_string());
            failed.updated_at = Utc::now();
            manifest.compare_and_set(&claim.object_key, Some(&entry), Some(failed))
        } else {
            Ok(())
        };
        if let Err(e) = settled {
            log::error!("{label}: failed to update manifest after error: {e}");
        }

        if err.halts_dataset() {
            log::error!(
                "{}: schema error, skipping the rest of this dataset",
                job.key.dataset
            );
            halted
                .lock()
                .expect("halted lock poisoned")
                .insert(job.key.dataset.clone());
        }

        if matches!(err, JobError::Cancelled) {
            log::warn!("{label}: cancelled");
            return JobOutcome::Cancelled;
        }
        log::error!("{label}: failed while {at}: {err}");
        JobOutcome::Failed {
            reason: err.to_string(),
            at,
        }
    }
}

fn outcome_of(written: &PartitionRef) -> JobOutcome {
    match &written.content_hash {
        Some(hash) => JobOutcome::Completed {
            record_count: written.record_count,
            content_hash: hash.clone(),
        },
        None => JobOutcome::Empty,
    }
}
