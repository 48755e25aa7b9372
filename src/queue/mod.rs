//! Bounded FIFO task queue with a worker pool.
//!
//! The queue is process-local: admitted tasks flow through a bounded
//! channel to at-most-`worker_count` concurrent handler invocations, in
//! admission order. Durability lives in the `tasks` table, not here; on
//! restart the engine re-enqueues the persisted task rows.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::model::Task;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue is at capacity.
    #[error("queue is full")]
    QueueFull,

    /// The queue no longer accepts work.
    #[error("queue is shut down")]
    ShutDown,

    /// The workers were already started.
    #[error("queue already started")]
    AlreadyStarted,
}

/// Handles one dequeued task to completion.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Snapshot of queue state.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Number of configured workers.
    pub workers: usize,
    /// Tasks admitted but not yet picked up.
    pub pending: usize,
    /// Tasks currently inside a handler.
    pub in_flight: usize,
    /// Whether the worker pool is running.
    pub running: bool,
}

struct Shared {
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    workers: AtomicUsize,
    running: AtomicBool,
    closed: AtomicBool,
}

/// Bounded FIFO queue of runnable tasks.
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    rx: Mutex<Option<mpsc::Receiver<Task>>>,
    shared: Arc<Shared>,
    stop: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Creates a queue admitting at most `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            shared: Arc::new(Shared {
                pending: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                workers: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            stop: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Launches `worker_count` workers dispatching to `handler`.
    pub async fn start(
        &self,
        worker_count: usize,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), QueueError> {
        let receiver = self
            .rx
            .lock()
            .await
            .take()
            .ok_or(QueueError::AlreadyStarted)?;
        let receiver = Arc::new(Mutex::new(receiver));

        let worker_count = worker_count.max(1);
        let mut handles = self.handles.lock().await;
        for id in 0..worker_count {
            let receiver = Arc::clone(&receiver);
            let handler = Arc::clone(&handler);
            let shared = Arc::clone(&self.shared);
            let stop = self.stop.clone();

            handles.push(tokio::spawn(async move {
                worker_loop(id, receiver, handler, shared, stop).await;
            }));
        }

        self.shared.workers.store(worker_count, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        info!(workers = worker_count, "task queue started");
        Ok(())
    }

    /// Admits a task without blocking. Fails with `QueueFull` at capacity.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }

        match self.tx.try_send(task) {
            Ok(()) => {
                self.shared.pending.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::ShutDown),
        }
    }

    /// Stops accepting work and waits for in-flight handlers to return.
    /// Running tasks are not interrupted here; a run is canceled through its
    /// own cancellation handle.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.stop.cancel();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked during shutdown");
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        info!("task queue shut down");
    }

    /// Snapshot of the queue state.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            workers: self.shared.workers.load(Ordering::SeqCst),
            pending: self.shared.pending.load(Ordering::SeqCst),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            running: self.shared.running.load(Ordering::SeqCst),
        }
    }
}

async fn worker_loop(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Task>>>,
    handler: Arc<dyn TaskHandler>,
    shared: Arc<Shared>,
    stop: CancellationToken,
) {
    debug!(worker = id, "worker started");

    loop {
        if stop.is_cancelled() {
            break;
        }

        // The receiver lock is held only while waiting for the next task,
        // never across handler execution.
        let task = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                _ = stop.cancelled() => break,
                task = receiver.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };

        shared.pending.fetch_sub(1, Ordering::SeqCst);
        shared.in_flight.fetch_add(1, Ordering::SeqCst);

        let task_id = task.id.clone();
        let pipeline_id = task.pipeline_id;
        debug!(worker = id, task = %task_id, pipeline_id, "task picked up");

        if let Err(e) = handler.handle(task).await {
            // Failed tasks are not re-enqueued automatically; recovery is an
            // explicit action elsewhere.
            error!(worker = id, task = %task_id, pipeline_id, error = %e, "task handler failed");
        }

        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    debug!(worker = id, "worker stopped");
}
