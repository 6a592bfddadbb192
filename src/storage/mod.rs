pub mod jobs;
pub mod logs;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ExecutionError, JobError};
use crate::models::{JobOutput, JobSnapshot, JobState};

pub use jobs::{JobRecord, MemoryJobStore};
pub use logs::{LogBuffer, LogSnapshot};

/// A requested state change for a job record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Complete(JobOutput),
    Fail(ExecutionError),
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Complete(_) => JobState::Completed,
            Transition::Fail(_) => JobState::Failed,
            Transition::Cancel => JobState::Cancelled,
        }
    }
}

/// Result of a cancellation request against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAck {
    pub previous: JobState,
    pub current: JobState,
}

/// Storage for job records. Every method is atomic with respect to a single
/// record; callers never hold references into live state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `Conflict` if the id already exists.
    async fn insert(&self, record: JobRecord) -> Result<(), JobError>;
    async fn get(&self, id: Uuid) -> Result<JobSnapshot, JobError>;
    async fn log(&self, id: Uuid) -> Result<Arc<LogBuffer>, JobError>;
    /// All records, optionally filtered by state, ordered by creation time.
    async fn list(&self, state: Option<JobState>) -> Vec<JobSnapshot>;
    /// Apply a lifecycle transition, rejecting illegal edges.
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<JobSnapshot, JobError>;
    /// Pending jobs become cancelled immediately; running jobs are flagged.
    /// Terminal jobs are left untouched.
    async fn request_cancel(&self, id: Uuid) -> Result<CancelAck, JobError>;
    /// Remove terminal records that finished before the cutoff.
    async fn prune(&self, finished_before: DateTime<Utc>) -> usize;
}
