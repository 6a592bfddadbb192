use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::{ExecutionError, JobError};
use crate::models::{CommandSpec, JobOutput, JobSnapshot, JobState};
use crate::storage::{CancelAck, JobStore, LogBuffer, Transition};

/// The authoritative state of one job. Only the store mutates it.
#[derive(Debug)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: String,
    pub command: CommandSpec,
    pub timeout_secs: u64,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub result: Option<JobOutput>,
    pub error: Option<ExecutionError>,
    pub log: Arc<LogBuffer>,
}

impl JobRecord {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        command: CommandSpec,
        timeout_secs: u64,
        log_max_lines: usize,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            command,
            timeout_secs,
            state: JobState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            result: None,
            error: None,
            log: Arc::new(LogBuffer::new(log_max_lines)),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            name: self.name.clone(),
            command: self.command.clone(),
            state: self.state,
            timeout_secs: self.timeout_secs,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            cancel_requested: self.cancel_requested,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    fn apply(&mut self, transition: Transition) -> Result<(), JobError> {
        let next = transition.target();
        if !self.state.can_transition_to(next) {
            return Err(JobError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }

        // Timestamps never run backwards, even if the wall clock does.
        let now = Utc::now();
        match transition {
            Transition::Start => {
                self.started_at = Some(later_of(now, self.created_at));
            }
            Transition::Complete(output) => self.result = Some(output),
            Transition::Fail(error) => self.error = Some(error),
            Transition::Cancel => self.cancel_requested = true,
        }
        self.state = next;

        if next.is_terminal() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.finished_at = Some(later_of(now, floor));
            self.log.freeze();
        }
        Ok(())
    }
}

fn later_of(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    if a < b {
        b
    } else {
        a
    }
}

fn not_found(id: Uuid) -> JobError {
    JobError::NotFound(format!("Job with id '{}' not found", id))
}

/// In-memory job store guarded by a single async RwLock.
#[derive(Default)]
pub struct MemoryJobStore {
    records: RwLock<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), JobError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(JobError::Conflict(format!(
                "A job with id '{}' already exists",
                record.id
            )));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<JobSnapshot, JobError> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(JobRecord::snapshot)
            .ok_or_else(|| not_found(id))
    }

    async fn log(&self, id: Uuid) -> Result<Arc<LogBuffer>, JobError> {
        let records = self.records.read().await;
        records
            .get(&id)
            .map(|r| Arc::clone(&r.log))
            .ok_or_else(|| not_found(id))
    }

    async fn list(&self, state: Option<JobState>) -> Vec<JobSnapshot> {
        let records = self.records.read().await;
        let mut jobs: Vec<JobSnapshot> = records
            .values()
            .filter(|r| match state {
                Some(s) => r.state == s,
                None => true,
            })
            .map(JobRecord::snapshot)
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<JobSnapshot, JobError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        record.apply(transition)?;
        Ok(record.snapshot())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<CancelAck, JobError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(&id).ok_or_else(|| not_found(id))?;
        let previous = record.state;
        match previous {
            JobState::Pending => record.apply(Transition::Cancel)?,
            JobState::Running => record.cancel_requested = true,
            JobState::Completed | JobState::Failed | JobState::Cancelled => {}
        }
        Ok(CancelAck {
            previous,
            current: record.state,
        })
    }

    async fn prune(&self, finished_before: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| {
            !(r.state.is_terminal() && r.finished_at.is_some_and(|t| t < finished_before))
        });
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_record() -> JobRecord {
        JobRecord::new(
            Uuid::now_v7(),
            "test-job",
            CommandSpec::new("echo").arg("hello"),
            0,
            1000,
        )
    }

    fn output() -> JobOutput {
        JobOutput {
            exit_code: 0,
            log_lines: 0,
            document: None,
        }
    }

    async fn setup_store() -> (MemoryJobStore, Uuid) {
        let store = MemoryJobStore::new();
        let record = make_record();
        let id = record.id;
        store.insert(record).await.expect("insert");
        (store, id)
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (store, id) = setup_store().await;
        let snap = store.get(id).await.expect("get");
        assert_eq!(snap.id, id);
        assert_eq!(snap.name, "test-job");
        assert_eq!(snap.state, JobState::Pending);
        assert!(snap.started_at.is_none());
        assert!(snap.finished_at.is_none());
        assert!(!snap.cancel_requested);
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let store = MemoryJobStore::new();
        let result = store.get(Uuid::now_v7()).await;
        assert!(matches!(result, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_id_is_conflict() {
        let store = MemoryJobStore::new();
        let first = make_record();
        let id = first.id;
        store.insert(first).await.expect("insert first");

        let mut second = make_record();
        second.id = id;
        let result = store.insert(second).await;
        assert!(matches!(result, Err(JobError::Conflict(_))));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_full_lifecycle_timestamps() {
        let (store, id) = setup_store().await;

        let running = store.transition(id, Transition::Start).await.expect("start");
        assert_eq!(running.state, JobState::Running);
        let started = running.started_at.expect("started_at");
        assert!(started >= running.created_at);

        let done = store
            .transition(id, Transition::Complete(output()))
            .await
            .expect("complete");
        assert_eq!(done.state, JobState::Completed);
        let finished = done.finished_at.expect("finished_at");
        assert!(finished >= started);
        assert_eq!(done.result, Some(output()));
        assert!(done.error.is_none());
    }

    #[tokio::test]
    async fn test_terminal_state_is_absorbing() {
        let (store, id) = setup_store().await;
        store.transition(id, Transition::Start).await.expect("start");
        store
            .transition(id, Transition::Fail(ExecutionError::Cancelled))
            .await
            .expect("fail");

        for t in [
            Transition::Start,
            Transition::Complete(output()),
            Transition::Cancel,
        ] {
            let result = store.transition(id, t).await;
            assert!(
                matches!(
                    result,
                    Err(JobError::IllegalTransition {
                        from: JobState::Failed,
                        ..
                    })
                ),
                "got {:?}",
                result
            );
        }
        assert_eq!(store.get(id).await.expect("get").state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_pending_cannot_complete() {
        let (store, id) = setup_store().await;
        let result = store.transition(id, Transition::Complete(output())).await;
        assert!(matches!(result, Err(JobError::IllegalTransition { .. })));
    }

    #[tokio::test]
    async fn test_request_cancel_pending() {
        let (store, id) = setup_store().await;
        let ack = store.request_cancel(id).await.expect("cancel");
        assert_eq!(ack.previous, JobState::Pending);
        assert_eq!(ack.current, JobState::Cancelled);

        let snap = store.get(id).await.expect("get");
        assert!(snap.cancel_requested);
        assert!(snap.started_at.is_none());
        assert!(snap.finished_at.is_some());

        // Idempotent on terminal jobs
        let again = store.request_cancel(id).await.expect("cancel again");
        assert_eq!(again.previous, JobState::Cancelled);
        assert_eq!(again.current, JobState::Cancelled);
    }

    #[tokio::test]
    async fn test_request_cancel_running_only_flags() {
        let (store, id) = setup_store().await;
        store.transition(id, Transition::Start).await.expect("start");
        let ack = store.request_cancel(id).await.expect("cancel");
        assert_eq!(ack.current, JobState::Running);
        let snap = store.get(id).await.expect("get");
        assert!(snap.cancel_requested);
        assert_eq!(snap.state, JobState::Running);
    }

    #[tokio::test]
    async fn test_request_cancel_completed_is_noop() {
        let (store, id) = setup_store().await;
        store.transition(id, Transition::Start).await.expect("start");
        store
            .transition(id, Transition::Complete(output()))
            .await
            .expect("complete");
        let ack = store.request_cancel(id).await.expect("cancel");
        assert_eq!(ack.current, JobState::Completed);
        assert!(!store.get(id).await.expect("get").cancel_requested);
    }

    #[tokio::test]
    async fn test_terminal_transition_freezes_log() {
        let (store, id) = setup_store().await;
        let log = store.log(id).await.expect("log");
        store.transition(id, Transition::Start).await.expect("start");
        assert!(log.push_line("running"));
        store
            .transition(id, Transition::Complete(output()))
            .await
            .expect("complete");
        assert!(log.is_frozen());
        assert!(!log.push_line("late"));
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let store = MemoryJobStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let record = make_record();
            ids.push(record.id);
            store.insert(record).await.expect("insert");
        }
        store.transition(ids[1], Transition::Start).await.expect("start");

        let all = store.list(None).await;
        assert_eq!(all.len(), 3);
        let listed: Vec<Uuid> = all.iter().map(|j| j.id).collect();
        assert_eq!(listed, ids);

        let running = store.list(Some(JobState::Running)).await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, ids[1]);

        assert!(store.list(Some(JobState::Failed)).await.is_empty());
    }

    #[tokio::test]
    async fn test_prune_removes_only_finished() {
        let store = MemoryJobStore::new();
        let pending = make_record();
        let pending_id = pending.id;
        store.insert(pending).await.expect("insert");

        let done = make_record();
        let done_id = done.id;
        store.insert(done).await.expect("insert");
        store.request_cancel(done_id).await.expect("cancel");

        let removed = store.prune(Utc::now() + chrono::Duration::seconds(1)).await;
        assert_eq!(removed, 1);
        assert!(store.get(pending_id).await.is_ok());
        assert!(matches!(
            store.get(done_id).await,
            Err(JobError::NotFound(_))
        ));
    }
}
