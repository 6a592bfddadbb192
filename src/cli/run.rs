// CLI run command: submit one job and follow it to completion

use std::time::Duration;

use anyhow::Context;
use uuid::Uuid;

use super::{parse_env_vars, RunArgs};
use crate::jobs::JobManager;
use crate::models::{CommandSpec, JobResult, JobSnapshot, JobState, NewJob, RunnerConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Build the command descriptor from the trailing `PROGRAM [ARGS...]`.
pub(crate) fn command_from_args(
    command: &[String],
    cwd: Option<&std::path::Path>,
    env: &[String],
) -> anyhow::Result<CommandSpec> {
    let (program, args) = command
        .split_first()
        .context("A program to run must be given after `--`")?;
    let mut spec = CommandSpec::new(program.as_str()).args(args.iter().cloned());
    if let Some(dir) = cwd {
        spec = spec.current_dir(dir);
    }
    spec.env = parse_env_vars(env).map_err(|e| anyhow::anyhow!(e))?;
    Ok(spec)
}

/// pjobs run
pub async fn cmd_run(config: RunnerConfig, args: &RunArgs) -> anyhow::Result<i32> {
    let mut command = command_from_args(&args.command, args.cwd.as_deref(), &args.env)?;
    command.result_file = args.result_file.clone();

    let mut new_job = NewJob::new(command);
    new_job.name = args.name.clone();
    if let Some(secs) = args.timeout {
        new_job.timeout_secs = secs;
    }

    let manager = JobManager::in_memory(config);
    let id = manager.submit(new_job).await?;
    let streaming = args.tail.is_none() && !args.json;

    let snapshot = follow(&manager, id, streaming).await?;
    let result = manager.get_result(id).await?;

    if args.json {
        let tail = args.tail.unwrap_or(manager.config().default_log_tail);
        let log = manager.get_log(id, tail).await?;
        let output = serde_json::json!({
            "job": snapshot,
            "result": result,
            "log": log,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        if let Some(tail) = args.tail {
            for line in manager.get_log(id, tail).await?.lines {
                println!("{}", line);
            }
        }
        print_summary(&snapshot, &result);
    }

    Ok(if result.state() == JobState::Completed {
        0
    } else {
        1
    })
}

/// Wait for the job to finish, streaming new output when asked.
/// Ctrl+C cancels the job; the wait continues until it is terminal.
async fn follow(manager: &JobManager, id: Uuid, streaming: bool) -> anyhow::Result<JobSnapshot> {
    let wait = manager.wait(id);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut printed = 0usize;
    let mut cancelling = false;

    let snapshot = loop {
        tokio::select! {
            done = &mut wait => break done?,
            _ = ticker.tick(), if streaming => {
                printed = print_new_lines(manager, id, printed).await?;
            }
            result = tokio::signal::ctrl_c(), if !cancelling => {
                result.context("Failed to listen for Ctrl+C")?;
                eprintln!("Cancelling job {}...", id);
                manager.cancel(id).await?;
                cancelling = true;
            }
        }
    };

    if streaming {
        print_new_lines(manager, id, printed).await?;
    }
    Ok(snapshot)
}

/// Print lines appended since the last call; returns the new total.
async fn print_new_lines(manager: &JobManager, id: Uuid, printed: usize) -> anyhow::Result<usize> {
    let log = manager.get_log(id, 0).await?;
    let fresh = log.total_lines.saturating_sub(printed);
    let skip = log.lines.len().saturating_sub(fresh);
    for line in log.lines.iter().skip(skip) {
        println!("{}", line);
    }
    Ok(log.total_lines)
}

fn print_summary(snapshot: &JobSnapshot, result: &JobResult) {
    let elapsed = match (snapshot.started_at, snapshot.finished_at) {
        (Some(start), Some(end)) => {
            format!(" in {:.2}s", (end - start).num_milliseconds() as f64 / 1000.0)
        }
        _ => String::new(),
    };
    match result {
        JobResult::Completed(output) => {
            eprintln!(
                "Job '{}' ({}) completed{} ({} output lines)",
                snapshot.name, snapshot.id, elapsed, output.log_lines
            );
            if let Some(ref document) = output.document {
                eprintln!("Result: {}", document);
            }
        }
        JobResult::Failed(err) => {
            eprintln!(
                "Job '{}' ({}) failed{}: {}",
                snapshot.name, snapshot.id, elapsed, err
            );
        }
        JobResult::Cancelled => {
            eprintln!("Job '{}' ({}) was cancelled", snapshot.name, snapshot.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_from_args() {
        let spec = command_from_args(
            &["predict".to_string(), "--fast".to_string()],
            Some(std::path::Path::new("/data")),
            &["K=V".to_string()],
        )
        .expect("command");
        assert_eq!(spec.program, "predict");
        assert_eq!(spec.args, vec!["--fast"]);
        assert_eq!(spec.working_dir, Some(std::path::PathBuf::from("/data")));
        assert_eq!(spec.env.get("K").map(String::as_str), Some("V"));
    }

    #[test]
    fn test_command_from_args_rejects_empty() {
        assert!(command_from_args(&[], None, &[]).is_err());
        assert!(command_from_args(&["x".to_string()], None, &["BAD".to_string()]).is_err());
    }
}
