//! metrolake-pipeline: raw → processed → cleaned orchestration
//!
//! Plans partition jobs per dataset and date, skips what the manifest
//! already holds, runs the rest in layer order and reports what changed.

pub mod config;
pub mod job;
pub mod orchestrator;
pub mod plan;
pub mod report;

pub use config::{
    ConfigError, DEFAULT_MAX_WORKERS, Dataset, DatasetConfig, PipelineConfig, RawSource,
    build_datasets, default_workers,
};
pub use job::{Job, JobError, JobOutcome, JobState, TransitionError};
pub use orchestrator::{Orchestrator, PipelineError};
pub use plan::{PlanError, PlanStatus, PlannedJob, RunRequest, input_keys, plan_layer};
pub use report::{ManifestChange, RunReport, manifest_diff};
