pub mod cancel;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::errors::ExecutionError;
use crate::models::{CommandSpec, JobOutput, JobResult, RunnerConfig};
use crate::storage::LogBuffer;

pub use cancel::{cancel_pair, CancelHandle, CancelSignal};

/// Lines of output attached to a non-zero exit error.
const OUTPUT_TAIL_LINES: usize = 20;

/// Minimum time allowed for output pipes to drain after the process exits.
const MIN_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How a single execution ended, before any result file is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Success { exit_code: i32 },
    Failure(ExecutionError),
    Cancelled,
    TimedOut { after: Duration },
}

impl ExecutionOutcome {
    /// Turn the outcome into the terminal job result. On success the
    /// command's declared result file, if any, is read and parsed here.
    pub async fn into_result(self, command: &CommandSpec, log: &LogBuffer) -> JobResult {
        match self {
            ExecutionOutcome::Success { exit_code } => {
                let document = match command.resolved_result_file() {
                    Some(path) => match read_result_document(&path).await {
                        Ok(value) => Some(value),
                        Err(message) => {
                            return JobResult::Failed(ExecutionError::InvalidResult {
                                path: path.display().to_string(),
                                message,
                            })
                        }
                    },
                    None => None,
                };
                JobResult::Completed(JobOutput {
                    exit_code,
                    log_lines: log.total_lines(),
                    document,
                })
            }
            ExecutionOutcome::Failure(err) => JobResult::Failed(err),
            ExecutionOutcome::Cancelled => JobResult::Cancelled,
            ExecutionOutcome::TimedOut { after } => JobResult::Failed(ExecutionError::Timeout {
                after_ms: after.as_millis() as u64,
            }),
        }
    }
}

async fn read_result_document(path: &std::path::Path) -> Result<serde_json::Value, String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

/// Launches external programs and supervises them until they exit, time out,
/// or are cancelled. Output from stdout and stderr is captured line by line.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace_period: Duration,
}

impl ProcessRunner {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.kill_grace())
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Run `command` to completion. Never returns before the child has been
    /// reaped; on cancel or timeout the whole process group is terminated.
    pub async fn run(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
        mut cancel: CancelSignal,
        log: Arc<LogBuffer>,
    ) -> ExecutionOutcome {
        if cancel.is_cancelled() {
            return ExecutionOutcome::Cancelled;
        }

        let mut child = match build_command(command).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!("Failed to launch '{}': {}", command.program, e);
                return ExecutionOutcome::Failure(ExecutionError::LaunchFailure {
                    program: command.program.clone(),
                    message: e.to_string(),
                });
            }
        };
        let pid = child.id();
        tracing::debug!(?pid, "Launched {}", command);

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(stdout, Arc::clone(&log))));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, Arc::clone(&log))));
        }

        let deadline = async move {
            match timeout {
                Some(after) => {
                    tokio::time::sleep(after).await;
                    after
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        // An exit that is already available wins over a concurrent cancel.
        let exit = tokio::select! {
            biased;
            status = child.wait() => Exit::Status(status),
            _ = cancel.cancelled() => Exit::Cancelled,
            after = &mut deadline => Exit::TimedOut(after),
        };

        let status = match exit {
            Exit::Status(status) => status,
            Exit::Cancelled => {
                tracing::debug!(?pid, "Cancelling {}", command);
                self.terminate(&mut child).await;
                self.drain(pumps, pid).await;
                return ExecutionOutcome::Cancelled;
            }
            Exit::TimedOut(after) => {
                tracing::warn!(?pid, "{} timed out after {:?}", command, after);
                self.terminate(&mut child).await;
                self.drain(pumps, pid).await;
                return ExecutionOutcome::TimedOut { after };
            }
        };

        self.drain(pumps, pid).await;

        match status {
            Ok(status) if status.success() => ExecutionOutcome::Success { exit_code: 0 },
            Ok(status) => ExecutionOutcome::Failure(ExecutionError::NonZeroExit {
                code: status.code(),
                signal: exit_signal(&status),
                output_tail: log.tail_lines(OUTPUT_TAIL_LINES),
            }),
            Err(e) => ExecutionOutcome::Failure(ExecutionError::Internal {
                message: format!("failed to wait for process: {}", e),
            }),
        }
    }

    /// SIGTERM the process group, then SIGKILL whatever is left of it once
    /// the leader exits or the grace period lapses.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                signal_group(pid, libc::SIGTERM);
                if tokio::time::timeout(self.grace_period, child.wait())
                    .await
                    .is_err()
                {
                    tracing::debug!(pid, "Process ignored SIGTERM, sending SIGKILL");
                }
                // Descendants can outlive the leader and ignore SIGTERM.
                signal_group(pid, libc::SIGKILL);
            }
        }

        if let Err(e) = child.start_kill() {
            tracing::debug!("start_kill failed (process likely exited): {}", e);
        }
        if let Err(e) = child.wait().await {
            tracing::error!("Failed to reap child process: {}", e);
        }
    }

    /// Wait for the output pumps to hit EOF. Descendants that inherited the
    /// pipes can hold them open, in which case the group is killed.
    async fn drain(&self, pumps: Vec<JoinHandle<()>>, pid: Option<u32>) {
        let aborts: Vec<_> = pumps.iter().map(JoinHandle::abort_handle).collect();
        let limit = self.grace_period.max(MIN_DRAIN_TIMEOUT);
        if tokio::time::timeout(limit, join_all(pumps)).await.is_ok() {
            return;
        }

        tracing::debug!(?pid, "Output pipes still open after exit, killing process group");
        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;
        for abort in aborts {
            abort.abort();
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

fn build_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if let Some(ref dir) = spec.working_dir {
        cmd.current_dir(dir);
    }
    cmd.envs(&spec.env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // New process group so termination reaches every descendant.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

async fn pump_lines<R>(reader: R, log: Arc<LogBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                log.push_line(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) => {
                tracing::debug!("Output read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let result = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pid, signal, "Failed to signal process group: {}", err);
        }
    }
}
