use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("worker pool is closed")]
pub struct PoolClosed;

/// Fixed set of long-lived workers consuming a shared task queue.
///
/// Tasks run one at a time per worker, so at most `size` tasks execute
/// concurrently. Dropping the pool closes the queue; workers finish the
/// task in hand and then exit.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<Task>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Must be called within a Tokio
    /// runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (queue, rx) = mpsc::unbounded_channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // Only one idle worker waits on the queue at a time.
                        let task = rx.lock().await.recv().await;
                        match task {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                    tracing::trace!(worker, "Worker exiting");
                })
            })
            .collect();

        Self { queue, workers }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task for the next free worker.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.queue.send(Box::pin(task)).map_err(|_| PoolClosed)
    }
}
