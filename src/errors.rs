use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::JobState;

/// Errors reported to the immediate caller of a manager or store operation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },
}

impl From<uuid::Error> for JobError {
    fn from(err: uuid::Error) -> Self {
        JobError::Validation(err.to_string())
    }
}

/// Why a unit of work did not complete. Recorded on the job or batch item,
/// never raised to whoever submitted it.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    #[error("failed to launch '{program}': {message}")]
    LaunchFailure { program: String, message: String },

    #[error("process exited with {}", exit_label(.code, .signal))]
    NonZeroExit {
        code: Option<i32>,
        signal: Option<i32>,
        /// Last lines of combined output, for context.
        output_tail: Vec<String>,
    },

    #[error("execution timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    #[error("execution was cancelled")]
    Cancelled,

    #[error("invalid result file '{path}': {message}")]
    InvalidResult { path: String, message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

fn exit_label(code: &Option<i32>, signal: &Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("code {}", code),
        (None, Some(signal)) => format!("signal {}", signal),
        (None, None) => "unknown status".to_string(),
    }
}
