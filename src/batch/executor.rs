use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{mpsc, Semaphore};

use crate::batch::pool::WorkerPool;
use crate::errors::ExecutionError;
use crate::models::{
    BatchItem, BatchItemResult, BatchReport, CommandSpec, ItemOutput, JobResult, RunnerConfig,
};
use crate::process::{cancel_pair, CancelHandle, CancelSignal, ProcessRunner};
use crate::storage::LogBuffer;

/// Runs batches of independent commands on a shared, fixed-size worker pool.
///
/// Each `run` call bounds its own fan-out with a semaphore on top of the
/// pool, so several batches can share one executor. An item that fails,
/// times out or panics is recorded as an error and never affects its
/// siblings.
pub struct BatchExecutor {
    pool: WorkerPool,
    runner: ProcessRunner,
    log_max_lines: usize,
}

/// Cancels every in-flight item if the `run` future is dropped early.
struct CancelOnDrop(CancelHandle);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl BatchExecutor {
    /// Must be called within a Tokio runtime.
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            pool: WorkerPool::new(config.batch_pool_size),
            runner: ProcessRunner::from_config(config),
            log_max_lines: config.log_max_lines,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }

    /// Run every item and return once each has a terminal outcome.
    /// Results are reported in completion order.
    pub async fn run(
        &self,
        items: Vec<BatchItem>,
        concurrency_limit: usize,
        per_item_timeout: Option<Duration>,
    ) -> BatchReport {
        self.run_until_cancelled(
            items,
            concurrency_limit,
            per_item_timeout,
            CancelSignal::never(),
        )
        .await
    }

    /// Like [`run`](Self::run), but `cancel` terminates every in-flight item
    /// and marks the rest cancelled. The report is returned only after each
    /// item's process has been reaped.
    pub async fn run_until_cancelled(
        &self,
        items: Vec<BatchItem>,
        concurrency_limit: usize,
        per_item_timeout: Option<Duration>,
        mut cancel: CancelSignal,
    ) -> BatchReport {
        let started = Instant::now();
        let total = items.len();
        let limit = concurrency_limit.max(1);
        if limit > self.pool.size() {
            tracing::warn!(
                "Concurrency limit {} exceeds pool size {}; at most {} items will run at once",
                limit,
                self.pool.size(),
                self.pool.size()
            );
        }
        tracing::info!(
            "Starting batch of {} item(s), concurrency {}, timeout {:?}",
            total,
            limit,
            per_item_timeout
        );

        let gate = Arc::new(Semaphore::new(limit));
        let (handle, signal) = cancel_pair();
        let guard = CancelOnDrop(handle);
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<BatchItemResult>();

        let dispatch = async move {
            for item in items {
                let permit = match Arc::clone(&gate).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let dispatched = Instant::now();
                let item_ref = item.item_ref.clone();
                let runner = self.runner.clone();
                let signal = signal.clone();
                let tx = result_tx.clone();
                let log_max_lines = self.log_max_lines;

                let task = async move {
                    let output = AssertUnwindSafe(run_item(
                        &runner,
                        &item.command,
                        per_item_timeout,
                        signal,
                        log_max_lines,
                    ))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        ItemOutput::Error(ExecutionError::Internal {
                            message: format!("item task panicked: {}", panic_message(&*panic)),
                        })
                    });
                    let _ = tx.send(BatchItemResult::new(
                        item.item_ref,
                        dispatched.elapsed(),
                        output,
                    ));
                    drop(permit);
                };

                if let Err(e) = self.pool.execute(task) {
                    tracing::error!("Could not dispatch batch item '{}': {}", item_ref, e);
                    let _ = result_tx.send(BatchItemResult::new(
                        item_ref,
                        dispatched.elapsed(),
                        ItemOutput::Error(ExecutionError::Internal {
                            message: e.to_string(),
                        }),
                    ));
                }
            }
        };

        let collect = async {
            let mut results = Vec::with_capacity(total);
            while let Some(result) = result_rx.recv().await {
                match result.error() {
                    None => tracing::info!(
                        "[{}/{}] {} succeeded in {:.2}s",
                        results.len() + 1,
                        total,
                        result.item_ref,
                        result.duration.as_secs_f64()
                    ),
                    Some(err) => tracing::warn!(
                        "[{}/{}] {} failed in {:.2}s: {}",
                        results.len() + 1,
                        total,
                        result.item_ref,
                        result.duration.as_secs_f64(),
                        err
                    ),
                }
                results.push(result);
            }
            results
        };

        let work = async { tokio::join!(dispatch, collect) };
        tokio::pin!(work);
        let ((), results) = tokio::select! {
            done = &mut work => done,
            _ = cancel.cancelled() => {
                tracing::warn!("Batch cancelled, terminating in-flight items");
                guard.0.cancel();
                work.await
            }
        };
        let report = BatchReport::from_results(results, started.elapsed());
        tracing::info!(
            "Batch finished: {}/{} succeeded in {:.2}s",
            report.succeeded,
            report.total,
            report.total_duration.as_secs_f64()
        );
        report
    }
}

async fn run_item(
    runner: &ProcessRunner,
    command: &CommandSpec,
    timeout: Option<Duration>,
    signal: CancelSignal,
    log_max_lines: usize,
) -> ItemOutput {
    let log = Arc::new(LogBuffer::new(log_max_lines));
    let outcome = runner.run(command, timeout, signal, Arc::clone(&log)).await;
    log.freeze();
    match outcome.into_result(command, &log).await {
        JobResult::Completed(output) => ItemOutput::Success(output),
        JobResult::Failed(err) => ItemOutput::Error(err),
        JobResult::Cancelled => ItemOutput::Error(ExecutionError::Cancelled),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
