//! Bounded worker pool fed by an in-memory channel.
//!
//! The channel is only a wake-up path: the task tables are the durable queue,
//! and anything dropped here is found again by the periodic rescan.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::tasks::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub kind: TaskKind,
    pub id: Uuid,
}

/// Executes one job. Implementations persist their own terminal state.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job);
}

/// Cloneable submit side of the pool.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

/// Receive side, consumed by [`start`].
#[derive(Debug)]
pub struct JobQueue {
    rx: mpsc::Receiver<Job>,
}

impl Dispatcher {
    pub fn channel(capacity: usize) -> (Dispatcher, JobQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Dispatcher { tx }, JobQueue { rx })
    }

    /// Never blocks the caller. Returns `false` if the job was not queued.
    pub fn enqueue(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                warn!(
                    task.kind = job.kind.as_str(),
                    task.id = %job.id,
                    "Task queue full, leaving job for the next rescan"
                );
                false
            }
            Err(TrySendError::Closed(job)) => {
                warn!(
                    task.kind = job.kind.as_str(),
                    task.id = %job.id,
                    "Task queue closed, job not dispatched"
                );
                false
            }
        }
    }
}

/// Spawns `workers` workers sharing one queue. Workers exit once every
/// [`Dispatcher`] clone is dropped and the queue drains.
pub fn start<H>(handler: H, queue: JobQueue, workers: usize) -> RunHandle
where
    H: JobHandler + Clone,
{
    let rx = Arc::new(Mutex::new(queue.rx));
    let mut handles = Vec::new();

    for i in 1..=workers.max(1) {
        let name = format!("task-worker-{i}");
        info!(worker.name = %name, "Starting worker…");

        let rx = Arc::clone(&rx);
        let handler = handler.clone();
        let span = info_span!("worker", worker.name = %name);
        handles.push(tokio::spawn(
            async move { run_worker(handler, rx).await }.instrument(span),
        ));
    }

    RunHandle { handles }
}

async fn run_worker<H>(handler: H, rx: Arc<Mutex<mpsc::Receiver<Job>>>)
where
    H: JobHandler + Clone,
{
    loop {
        let next = { rx.lock().await.recv().await };
        let Some(job) = next else {
            debug!("Task queue closed, worker exiting");
            break;
        };

        let span = info_span!("task", task.kind = job.kind.as_str(), task.id = %job.id);
        let handler = handler.clone();

        // A panicking job must not take the worker down with it.
        let outcome = tokio::spawn(async move { handler.handle(job).await }.instrument(span)).await;
        if let Err(error) = outcome {
            warn!(%error, task.id = %job.id, "Task handler panicked");
        }
    }
}

/// Handle to the running worker pool.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        for handle in self.handles {
            if let Err(error) = handle.await {
                warn!(%error, "Task worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Counting {
        seen: Arc<AtomicUsize>,
        panic_on: Option<Uuid>,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn handle(&self, job: Job) {
            if Some(job.id) == self.panic_on {
                panic!("boom");
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn job() -> Job {
        Job {
            kind: TaskKind::Asr,
            id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_all_jobs_run_then_workers_exit() {
        let handler = Counting::default();
        let (dispatcher, queue) = Dispatcher::channel(16);
        let run = start(handler.clone(), queue, 3);

        for _ in 0..10 {
            assert!(dispatcher.enqueue(job()));
        }
        drop(dispatcher);
        run.wait_for_shutdown().await;

        assert_eq!(handler.seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let bad = job();
        let handler = Counting {
            panic_on: Some(bad.id),
            ..Default::default()
        };
        let (dispatcher, queue) = Dispatcher::channel(8);
        let run = start(handler.clone(), queue, 1);

        dispatcher.enqueue(bad);
        dispatcher.enqueue(job());
        dispatcher.enqueue(job());
        drop(dispatcher);
        run.wait_for_shutdown().await;

        assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_enqueue_on_full_queue_is_non_blocking() {
        let (dispatcher, _queue) = Dispatcher::channel(1);
        assert!(dispatcher.enqueue(job()));
        assert!(!dispatcher.enqueue(job()));
    }

    #[test]
    fn test_enqueue_on_closed_queue() {
        let (dispatcher, queue) = Dispatcher::channel(4);
        drop(queue);
        assert!(!dispatcher.enqueue(job()));
    }
}
