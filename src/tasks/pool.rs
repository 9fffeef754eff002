use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeleteOutcome, FileOps, TaskError, UploadOutcome};
use crate::coordination::VersionCounter;

#[derive(Debug, Clone)]
pub enum TaskAction {
    Upload { file_name: String, data: Bytes },
    Delete { file_id: String },
}

impl TaskAction {
    fn kind(&self) -> &'static str {
        match self {
            TaskAction::Upload { .. } => "upload",
            TaskAction::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Uploaded(UploadOutcome),
    Deleted(DeleteOutcome),
}

type TaskReply = oneshot::Sender<Result<TaskOutcome, TaskError>>;

/// A queued unit of work, correlated to its caller by its reply channel.
struct Task {
    id: u64,
    action: TaskAction,
    reply: TaskReply,
}

#[derive(Debug, Default)]
struct PoolCounters {
    queued: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    /// Tasks whose caller gave up before a worker picked them up
    pub dropped: u64,
    pub failed_version_increments: u64,
}

/// Fixed set of workers fed from one FIFO queue.
///
/// Idle workers take turns receiving from the shared queue, so each task
/// goes to the first worker that is free and a worker never holds more than
/// one task. Tasks on the same file are serialized by leases, not by the
/// queue: under contention a later task may win the lease first.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    next_task_id: AtomicU64,
    counters: Arc<PoolCounters>,
    versions: VersionCounter,
}

impl WorkerPool {
    /// Spawn `worker_count` workers on the current tokio runtime.
    pub fn new(ops: Arc<FileOps>, versions: VersionCounter, worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(PoolCounters::default());

        let workers = (0..worker_count)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&queue),
                    Arc::clone(&ops),
                    Arc::clone(&counters),
                ))
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            worker_count,
            next_task_id: AtomicU64::new(1),
            counters,
            versions,
        }
    }

    /// Queue a task and wait for its result.
    ///
    /// Dropping the returned future before a worker picks the task up
    /// cancels it. Once dispatched, the task runs to completion regardless.
    pub async fn submit(&self, action: TaskAction) -> Result<TaskOutcome, TaskError> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or(TaskError::PoolClosed)?;

        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (reply, result) = oneshot::channel();
        debug!(task_id = id, action = action.kind(), "Task queued");

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        if sender.send(Task { id, action, reply }).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskError::PoolClosed);
        }

        result.await.map_err(|_| TaskError::PoolClosed)?
    }

    pub async fn submit_upload(
        &self,
        data: Bytes,
        file_name: impl Into<String>,
    ) -> Result<UploadOutcome, TaskError> {
        let action = TaskAction::Upload {
            file_name: file_name.into(),
            data,
        };
        match self.submit(action).await? {
            TaskOutcome::Uploaded(outcome) => Ok(outcome),
            other => Err(TaskError::Internal(format!(
                "upload produced unexpected outcome {other:?}"
            ))),
        }
    }

    pub async fn submit_delete(&self, file_id: impl Into<String>) -> Result<DeleteOutcome, TaskError> {
        let action = TaskAction::Delete {
            file_id: file_id.into(),
        };
        match self.submit(action).await? {
            TaskOutcome::Deleted(outcome) => Ok(outcome),
            other => Err(TaskError::Internal(format!(
                "delete produced unexpected outcome {other:?}"
            ))),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.worker_count,
            queued: self.counters.queued.load(Ordering::Relaxed),
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            failed_version_increments: self.versions.failed_increments(),
        }
    }

    /// Stop accepting tasks, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();

        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker exited abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    ops: Arc<FileOps>,
    counters: Arc<PoolCounters>,
) {
    debug!(worker, "Worker started");

    loop {
        // Holding the queue lock while waiting keeps hand-off FIFO across workers
        let next = {
            let mut receiver = queue.lock().await;
            receiver.recv().await
        };
        let Some(Task { id, action, reply }) = next else {
            break;
        };
        counters.queued.fetch_sub(1, Ordering::Relaxed);

        if reply.is_closed() {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(worker, task_id = id, "Caller gone before dispatch, dropping task");
            continue;
        }

        let kind = action.kind();
        counters.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        // Separate task: a panic fails this task only, and the work finishes
        // (releasing its leases) even if this worker is torn down.
        let task_ops = Arc::clone(&ops);
        let result = match tokio::spawn(async move { task_ops.execute(action).await }).await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Internal(format!("worker task aborted: {e}"))),
        };

        counters.active.fetch_sub(1, Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(worker, task_id = id, action = kind, elapsed_ms, "Task completed");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(worker, task_id = id, action = kind, elapsed_ms, error = %e, "Task failed");
            }
        }

        if reply.send(result).is_err() {
            debug!(worker, task_id = id, "Caller gone before result was delivered");
        }
    }

    debug!(worker, "Worker stopped");
}
