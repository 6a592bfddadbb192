use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{ExecutionError, JobError};

/// An external program invocation. The program is executed directly with the
/// given argument vector; nothing here is ever handed to a shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// JSON document the program writes on success. Relative paths resolve
    /// against `working_dir`.
    #[serde(default)]
    pub result_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn result_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.result_file = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.program.trim().is_empty() {
            return Err(JobError::Validation(
                "Command program cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Location of the declared result document, resolved against the
    /// working directory.
    pub fn resolved_result_file(&self) -> Option<PathBuf> {
        let path = self.result_file.as_ref()?;
        match &self.working_dir {
            Some(dir) if path.is_relative() => Some(dir.join(path)),
            _ => Some(path.clone()),
        }
    }

    /// File stem of the program, e.g. `predict` for `/opt/bin/predict.py`.
    pub fn program_stem(&self) -> String {
        Path::new(&self.program)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("job")
            .to_string()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// A job submission request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    #[serde(default)]
    pub name: Option<String>,
    pub command: CommandSpec,
    /// Per-job wall-clock budget; 0 falls back to the configured default.
    #[serde(default)]
    pub timeout_secs: u64,
}

impl NewJob {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            name: None,
            command,
            timeout_secs: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Build the display name used when the caller did not supply one.
pub fn default_job_name(command: &CommandSpec, id: Uuid) -> String {
    let simple = id.simple().to_string();
    let short = &simple[simple.len() - 8..];
    format!("{}_{}", command.program_stem(), short)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Legal edges of the job lifecycle.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" | "canceled" => Ok(JobState::Cancelled),
            other => Err(JobError::Validation(format!(
                "Unknown job status '{}' (expected pending, running, completed, failed or cancelled)",
                other
            ))),
        }
    }
}

/// Payload of a successfully completed unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutput {
    pub exit_code: i32,
    /// Number of output lines captured while the process ran.
    pub log_lines: usize,
    /// Parsed result document, when the command declared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}

/// Terminal outcome of a job as returned by `get_result`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", content = "payload")]
pub enum JobResult {
    Completed(JobOutput),
    Failed(ExecutionError),
    Cancelled,
}

impl JobResult {
    pub fn state(&self) -> JobState {
        match self {
            JobResult::Completed(_) => JobState::Completed,
            JobResult::Failed(_) => JobState::Failed,
            JobResult::Cancelled => JobState::Cancelled,
        }
    }
}

/// Lightweight status view returned by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub id: Uuid,
    pub name: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
}

/// Copy of a job record's metadata. Never aliases live store state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub name: String,
    pub command: CommandSpec,
    pub state: JobState,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl JobSnapshot {
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            cancel_requested: self.cancel_requested,
        }
    }

    /// The terminal outcome, or `None` while the job is still pending or running.
    pub fn outcome(&self) -> Option<JobResult> {
        match self.state {
            JobState::Completed => self.result.clone().map(JobResult::Completed),
            JobState::Failed => self.error.clone().map(JobResult::Failed),
            JobState::Cancelled => Some(JobResult::Cancelled),
            JobState::Pending | JobState::Running => None,
        }
    }
}

/// Parse a job id received as text.
pub fn parse_job_id(s: &str) -> Result<Uuid, JobError> {
    Ok(Uuid::parse_str(s.trim())?)
}
