use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::errors::JobError;
use crate::jobs::events::JobEvent;
use crate::models::{
    default_job_name, JobResult, JobSnapshot, JobState, JobStatus, NewJob, RunnerConfig,
};
use crate::process::{cancel_pair, CancelHandle, CancelSignal, ProcessRunner};
use crate::storage::{CancelAck, JobRecord, JobStore, LogSnapshot, MemoryJobStore, Transition};

/// Extra time allowed on top of the kill grace period when awaiting job
/// tasks during shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

type Admission = oneshot::Sender<OwnedSemaphorePermit>;

/// Handle to a job's background task, allowing cancellation.
struct RunHandle {
    cancel: CancelHandle,
    join_handle: JoinHandle<()>,
}

struct ManagerInner {
    store: Arc<dyn JobStore>,
    runner: ProcessRunner,
    config: Arc<RunnerConfig>,
    admission_tx: mpsc::UnboundedSender<Admission>,
    handles: Mutex<HashMap<Uuid, RunHandle>>,
    event_tx: broadcast::Sender<JobEvent>,
}

/// Owns the job registry and the background execution of submitted jobs.
///
/// Submitted jobs queue in FIFO order for one of `max_running_jobs` slots.
/// A slot is handed back only after the job's terminal state is in the
/// store, so the store never shows more running jobs than the limit.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    /// Create a manager over the given store. Must be called within a Tokio
    /// runtime, since the admission dispatcher is spawned here.
    pub fn new(config: RunnerConfig, store: Arc<dyn JobStore>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_running_jobs.max(1)));
        let (admission_tx, admission_rx) = mpsc::unbounded_channel();
        tokio::spawn(admit(slots, admission_rx));

        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                store,
                runner: ProcessRunner::from_config(&config),
                config: Arc::new(config),
                admission_tx,
                handles: Mutex::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    pub fn in_memory(config: RunnerConfig) -> Self {
        Self::new(config, Arc::new(MemoryJobStore::new()))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    /// Register a job and schedule it. Returns as soon as the record exists;
    /// never waits on the process.
    pub async fn submit(&self, new_job: NewJob) -> Result<Uuid, JobError> {
        new_job.command.validate()?;

        let id = Uuid::now_v7();
        let name = new_job
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_job_name(&new_job.command, id));
        let record = JobRecord::new(
            id,
            name.clone(),
            new_job.command,
            new_job.timeout_secs,
            self.inner.config.log_max_lines,
        );
        self.inner.store.insert(record).await?;
        tracing::info!("Submitted job '{}' ({})", name, id);
        self.emit(JobEvent::Submitted {
            job_id: id,
            name,
            timestamp: Utc::now(),
        });

        let (admitted_tx, admitted_rx) = oneshot::channel();
        if self.inner.admission_tx.send(admitted_tx).is_err() {
            tracing::error!("Admission dispatcher is gone; job {} will stay pending", id);
        }

        // Hold the lock across the spawn so the task cannot unregister itself
        // before it has been registered.
        let (cancel, signal) = cancel_pair();
        let mut handles = self.inner.handles.lock().await;
        let join_handle = tokio::spawn(execute(
            Arc::clone(&self.inner),
            id,
            signal,
            admitted_rx,
        ));
        handles.insert(
            id,
            RunHandle {
                cancel,
                join_handle,
            },
        );

        Ok(id)
    }

    pub async fn get_status(&self, id: Uuid) -> Result<JobStatus, JobError> {
        Ok(self.inner.store.get(id).await?.status())
    }

    pub async fn get_snapshot(&self, id: Uuid) -> Result<JobSnapshot, JobError> {
        self.inner.store.get(id).await
    }

    /// The job's terminal outcome; `NotReady` while pending or running.
    pub async fn get_result(&self, id: Uuid) -> Result<JobResult, JobError> {
        let snapshot = self.inner.store.get(id).await?;
        snapshot
            .outcome()
            .ok_or_else(|| JobError::NotReady(format!("Job '{}' is {}", id, snapshot.state)))
    }

    /// Last `tail` captured lines (all when `tail == 0`) plus the total count.
    pub async fn get_log(&self, id: Uuid, tail: usize) -> Result<LogSnapshot, JobError> {
        Ok(self.inner.store.log(id).await?.snapshot(tail))
    }

    /// Request cancellation and return the state observed right after.
    /// Pending jobs are cancelled on the spot; running jobs become
    /// `Cancelled` once their process has stopped. Terminal jobs are left
    /// alone.
    pub async fn cancel(&self, id: Uuid) -> Result<JobState, JobError> {
        let ack = self.record_cancel(id).await?;
        if !ack.previous.is_terminal() {
            if let Some(handle) = self.inner.handles.lock().await.get(&id) {
                handle.cancel.cancel();
            }
        }
        Ok(ack.current)
    }

    pub async fn list(&self, filter: Option<JobState>) -> Vec<JobSnapshot> {
        self.inner.store.list(filter).await
    }

    /// Like `list`, with the filter given as a case-insensitive state name.
    pub async fn list_by_status_str(
        &self,
        filter: Option<&str>,
    ) -> Result<Vec<JobSnapshot>, JobError> {
        let filter = filter.map(str::parse::<JobState>).transpose()?;
        Ok(self.list(filter).await)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Lifecycle events as a stream. Events missed by a slow consumer are
    /// skipped.
    pub fn event_stream(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(|event| event.ok())
    }

    /// Resolve once the job is terminal, returning its final snapshot.
    pub async fn wait(&self, id: Uuid) -> Result<JobSnapshot, JobError> {
        // Subscribe before the first read so the finish event cannot slip by.
        let mut events = self.subscribe();
        let snapshot = self.inner.store.get(id).await?;
        if snapshot.state.is_terminal() {
            return Ok(snapshot);
        }

        loop {
            match events.recv().await {
                Ok(JobEvent::Finished { job_id, .. }) if job_id == id => {
                    return self.inner.store.get(id).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Waiter for job {} lagged by {} events", id, skipped);
                    let snapshot = self.inner.store.get(id).await?;
                    if snapshot.state.is_terminal() {
                        return Ok(snapshot);
                    }
                }
                Err(RecvError::Closed) => return self.inner.store.get(id).await,
            }
        }
    }

    /// Remove terminal jobs that finished more than `older_than` ago.
    pub async fn prune(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let removed = self.inner.store.prune(cutoff).await;
        if removed > 0 {
            tracing::info!("Pruned {} finished job(s)", removed);
        }
        removed
    }

    /// Apply the configured retention period, if any.
    pub async fn prune_expired(&self) -> usize {
        match self.inner.config.job_ttl() {
            Some(ttl) => self.prune(ttl).await,
            None => 0,
        }
    }

    /// Cancel every live job and wait for its task to wind down.
    pub async fn shutdown(&self) {
        let live: Vec<(Uuid, RunHandle)> = {
            let mut handles = self.inner.handles.lock().await;
            handles.drain().collect()
        };
        tracing::info!("Shutting down job manager ({} live job(s))", live.len());

        for (id, handle) in &live {
            if let Err(e) = self.record_cancel(*id).await {
                tracing::warn!("Failed to cancel job {} during shutdown: {}", id, e);
            }
            handle.cancel.cancel();
        }

        let bound = self.inner.runner.grace_period() + SHUTDOWN_SLACK;
        for (id, handle) in live {
            match tokio::time::timeout(bound, handle.join_handle).await {
                Ok(Ok(())) => tracing::debug!("Job {} shut down gracefully", id),
                Ok(Err(e)) => tracing::warn!("Job {} task failed during shutdown: {}", id, e),
                Err(_) => tracing::warn!("Job {} did not finish within {:?}", id, bound),
            }
        }
    }

    async fn record_cancel(&self, id: Uuid) -> Result<CancelAck, JobError> {
        let ack = self.inner.store.request_cancel(id).await?;
        match (ack.previous, ack.current) {
            (JobState::Pending, JobState::Cancelled) => {
                tracing::info!("Cancelled pending job {}", id);
                self.emit(JobEvent::Finished {
                    job_id: id,
                    state: JobState::Cancelled,
                    timestamp: Utc::now(),
                });
            }
            (JobState::Running, _) => tracing::info!("Cancellation requested for job {}", id),
            _ => tracing::debug!("Cancel on job {} ignored, already {}", id, ack.current),
        }
        Ok(ack)
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.inner.event_tx.send(event);
    }
}

/// Hands out running slots strictly in submission order.
async fn admit(slots: Arc<Semaphore>, mut queue: mpsc::UnboundedReceiver<Admission>) {
    while let Some(waiter) = queue.recv().await {
        if waiter.is_closed() {
            continue;
        }
        let permit = match Arc::clone(&slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        // If the job went away meanwhile the permit is dropped and returned.
        let _ = waiter.send(permit);
    }
}

async fn execute(
    inner: Arc<ManagerInner>,
    id: Uuid,
    mut signal: CancelSignal,
    admitted: oneshot::Receiver<OwnedSemaphorePermit>,
) {
    let permit = tokio::select! {
        biased;
        _ = signal.cancelled() => None,
        permit = admitted => permit.ok(),
    };

    if let Some(permit) = permit {
        run_admitted(&inner, id, signal).await;
        // Released only once the terminal state has been recorded.
        drop(permit);
    }

    inner.handles.lock().await.remove(&id);
}

async fn run_admitted(inner: &ManagerInner, id: Uuid, signal: CancelSignal) {
    let snapshot = match inner.store.transition(id, Transition::Start).await {
        Ok(snapshot) => snapshot,
        Err(JobError::IllegalTransition { from, .. }) => {
            tracing::debug!("Job {} not started, already {}", id, from);
            return;
        }
        Err(e) => {
            tracing::error!("Failed to start job {}: {}", id, e);
            return;
        }
    };
    let log = match inner.store.log(id).await {
        Ok(log) => log,
        Err(e) => {
            tracing::error!("Log buffer for job {} is missing: {}", id, e);
            return;
        }
    };

    tracing::info!("Started job '{}' ({}): {}", snapshot.name, id, snapshot.command);
    let _ = inner.event_tx.send(JobEvent::Started {
        job_id: id,
        timestamp: Utc::now(),
    });

    let timeout = inner.config.job_timeout(snapshot.timeout_secs);
    let outcome = inner
        .runner
        .run(&snapshot.command, timeout, signal, Arc::clone(&log))
        .await;
    let transition = match outcome.into_result(&snapshot.command, &log).await {
        JobResult::Completed(output) => Transition::Complete(output),
        JobResult::Failed(err) => Transition::Fail(err),
        JobResult::Cancelled => Transition::Cancel,
    };

    match inner.store.transition(id, transition).await {
        Ok(done) => {
            match &done.error {
                Some(err) => tracing::warn!("Job '{}' ({}) failed: {}", done.name, id, err),
                None => tracing::info!("Job '{}' ({}) finished: {}", done.name, id, done.state),
            }
            let _ = inner.event_tx.send(JobEvent::Finished {
                job_id: id,
                state: done.state,
                timestamp: Utc::now(),
            });
        }
        Err(e) => tracing::error!("Failed to record outcome of job {}: {}", id, e),
    }
}
