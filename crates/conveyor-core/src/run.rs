//! Run and job status types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::RunId;
use crate::trigger::TriggerEvent;

/// One evaluation of the pipeline for a triggering event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier.
    pub id: RunId,
    /// Pipeline name.
    pub pipeline: String,
    /// The event that started this run.
    pub event: TriggerEvent,
    /// Current status.
    pub status: RunStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(pipeline: impl Into<String>, event: TriggerEvent) -> Self {
        Self {
            id: RunId::new(),
            pipeline: pipeline.into(),
            event,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Waiting to start.
    Pending,
    /// Currently running.
    Running,
    /// Every job succeeded.
    Succeeded,
    /// At least one job failed.
    Failed,
    /// The run was cancelled mid-flight.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of a job within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting for dependencies or a free execution slot.
    Pending,
    /// Currently executing.
    Running,
    /// All steps succeeded.
    Succeeded,
    /// A step failed.
    Failed { message: String },
    /// Not executed because a dependency did not succeed.
    Skipped { reason: String },
    /// Stopped by run cancellation.
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded)
    }
}
