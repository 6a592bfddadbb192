pub mod batch;
pub mod config;
pub mod job;

pub use batch::{BatchItem, BatchItemResult, BatchReport, ItemOutput, ItemStatus};
pub use config::{load_config, RunnerConfig};
pub use job::{
    default_job_name, parse_job_id, CommandSpec, JobOutput, JobResult, JobSnapshot, JobState,
    JobStatus, NewJob,
};
