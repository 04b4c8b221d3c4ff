//! What a run changed

use std::time::Duration;

use metrolake_core::fmt_num;
use metrolake_store::{ManifestState, PartitionKey, PartitionStatus};

use crate::job::JobOutcome;

/// One manifest entry whose status differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestChange {
    pub object_key: String,
    pub before: Option<PartitionStatus>,
    pub after: Option<PartitionStatus>,
}

/// Entries added, removed or rewritten between `before` and `after`.
///
/// A rewrite with the same status (a forced re-run) still counts.
pub fn manifest_diff(before: &ManifestState, after: &ManifestState) -> Vec<ManifestChange> {
    let mut changes = Vec::new();
    for (key, entry) in &after.entries {
        let prior = before.entries.get(key);
        if prior != Some(entry) {
            changes.push(ManifestChange {
                object_key: key.clone(),
                before: prior.map(|e| e.status),
                after: Some(entry.status),
            });
        }
    }
    for (key, entry) in &before.entries {
        if !after.entries.contains_key(key) {
            changes.push(ManifestChange {
                object_key: key.clone(),
                before: Some(entry.status),
                after: None,
            });
        }
    }
    changes.sort_by(|a, b| a.object_key.cmp(&b.object_key));
    changes
}

/// Result of one run, grouped by what happened to each partition.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub completed: Vec<(PartitionKey, usize)>,
    pub empty: Vec<PartitionKey>,
    pub failed: Vec<(PartitionKey, String)>,
    /// Already materialized, not re-run.
    pub skipped: Vec<PartitionKey>,
    pub blocked: Vec<(PartitionKey, String)>,
    pub cancelled: Vec<PartitionKey>,
    pub changes: Vec<ManifestChange>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: PartitionKey, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed { record_count, .. } => self.completed.push((key, record_count)),
            JobOutcome::Empty => self.empty.push(key),
            JobOutcome::Failed { reason, .. } => self.failed.push((key, reason)),
            JobOutcome::Blocked { reason } => self.blocked.push((key, reason)),
            JobOutcome::Cancelled => self.cancelled.push(key),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn total_records(&self) -> usize {
        self.completed.iter().map(|(_, n)| n).sum()
    }

    pub fn jobs_run(&self) -> usize {
        self.completed.len() + self.empty.len() + self.failed.len()
    }

    pub fn log(&self) {
        log::info!("=== Pipeline Summary ===");
        log::info!(
            "Partitions: {} completed, {} empty, {} failed, {} skipped, {} blocked, {} cancelled",
            self.completed.len(),
            self.empty.len(),
            self.failed.len(),
            self.skipped.len(),
            self.blocked.len(),
            self.cancelled.len()
        );
        log::info!(
            "Records: {} written, {} manifest entries changed",
            fmt_num(self.total_records()),
            self.changes.len()
        );
        log::info!("Time: {:.1}s", self.elapsed.as_secs_f64());
        for (key, reason) in &self.failed {
            log::error!("FAILED {}: {reason}", key.label());
        }
        for (key, reason) in &self.blocked {
            log::warn!("blocked {}: {reason}", key.label());
        }
    }
}
