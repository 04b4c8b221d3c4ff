//! Partition job state machine
//!
//! ```text
//! Pending → Fetching → Writing → Validating → Done
//!              └──────────┴──────────┴──→ Failed → Pending (next run)
//! ```

use std::fmt;

use metrolake_core::{Retryable, SourceError, StoreError, ValidationFailure};
use metrolake_store::{ManifestError, PartitionKey, WriteError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    /// Reading inputs (source or lower layer) and deriving the records.
    Fetching,
    Writing,
    /// Reading back what was written.
    Validating,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Writing => "writing",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Writing)
                | (Writing, Validating)
                | (Validating, Done)
                | (Fetching | Writing | Validating, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{label}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub label: String,
    pub from: JobState,
    pub to: JobState,
}

/// One partition to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub key: PartitionKey,
    /// Index into the dataset's sources (raw jobs only).
    pub source: Option<usize>,
    state: JobState,
}

impl Job {
    pub fn new(key: PartitionKey, source: Option<usize>) -> Self {
        Self {
            key,
            source,
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn label(&self) -> String {
        self.key.label()
    }

    pub fn advance(&mut self, next: JobState) -> Result<(), TransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(TransitionError {
                label: self.label(),
                from: self.state,
                to: next,
            });
        }
        log::trace!("{}: {} -> {}", self.label(), self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Why a job stopped.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("{label}: read-back check failed: {reason}")]
    Verify { label: String, reason: String },
    #[error("cancelled")]
    Cancelled,
}

impl Retryable for JobError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Source(e) => e.is_retryable(),
            Self::Store(e) => e.is_retryable(),
            Self::Write(e) => e.is_retryable(),
            Self::Manifest(e) => e.is_retryable(),
            Self::Validation(_) | Self::Transition(_) | Self::Verify { .. } | Self::Cancelled => {
                false
            }
        }
    }
}

impl JobError {
    /// A source whose payload no longer parses stops its whole dataset.
    pub fn halts_dataset(&self) -> bool {
        matches!(self, Self::Source(SourceError::Schema { .. }))
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        record_count: usize,
        content_hash: String,
    },
    /// No records: marked `Empty`, nothing stored.
    Empty,
    Failed {
        reason: String,
        /// State the job was in when it failed.
        at: JobState,
    },
    /// Inputs not ready; nothing was claimed.
    Blocked { reason: String },
    Cancelled,
}
