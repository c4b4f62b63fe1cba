use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::sync::mpsc;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CoachError, Result};
use crate::types::MatchInput;

use super::{ThreatMatch, match_threats};

/// Default per-task deadline.
pub const TASK_DEADLINE_MS: u64 = 5_000;

enum PoolTask {
    MatchThreats(MatchInput),
    BatchMatch(Vec<MatchInput>),
}

enum PoolReply {
    Matches(Vec<ThreatMatch>),
    Batch(Vec<Vec<ThreatMatch>>),
}

struct Job {
    id: u64,
    task: PoolTask,
    reply: oneshot::Sender<(u64, PoolReply)>,
}

struct Worker {
    sender: mpsc::Sender<Job>,
    handle: Option<std::thread::JoinHandle<()>>,
}

/// Pool of OS threads for offloading pattern matching.
///
/// Dispatch is round-robin; each task carries an id and a oneshot reply
/// channel, and the caller enforces the per-task deadline. A reply arriving
/// after its deadline hits a dropped receiver and is discarded. Callers
/// that receive an error MUST re-run the work on the main thread before
/// surfacing failure (the engine enforces this).
pub struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    next_worker: AtomicUsize,
    next_task_id: AtomicU64,
    shut_down: AtomicBool,
    deadline: Duration,
}

impl WorkerPool {
    /// Spawn `size` workers; 0 means `max(1, cpu_count - 1)`.
    pub fn new(size: usize) -> Self {
        let size = if size == 0 { default_size() } else { size };
        let workers = (0..size).map(spawn_worker).collect();
        debug!(workers = size, "worker pool started");
        Self {
            workers: Mutex::new(workers),
            next_worker: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            deadline: Duration::from_millis(TASK_DEADLINE_MS),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    fn submit(&self, task: PoolTask) -> Result<(u64, oneshot::Receiver<(u64, PoolReply)>)> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(CoachError::WorkerPool("pool is shut down".into()));
        }
        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let job = Job { id, task, reply: tx };

        let workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if workers.is_empty() {
            return Err(CoachError::WorkerPool("no workers available".into()));
        }
        let index = self.next_worker.fetch_add(1, Ordering::SeqCst) % workers.len();
        workers[index]
            .sender
            .send(job)
            .map_err(|_| CoachError::WorkerPool(format!("worker {index} is gone")))?;
        Ok((id, rx))
    }

    async fn await_reply(
        &self,
        id: u64,
        rx: oneshot::Receiver<(u64, PoolReply)>,
    ) -> Result<PoolReply> {
        match tokio::time::timeout(self.deadline, rx).await {
            Err(_) => {
                // Deadline missed; the receiver is dropped here, so a late
                // worker reply for this id has nowhere to land.
                warn!(task = id, deadline_ms = TASK_DEADLINE_MS, "worker task deadline missed");
                Err(CoachError::WorkerTimeout(self.deadline.as_millis() as u64))
            }
            Ok(Err(_)) => Err(CoachError::WorkerPool(format!(
                "task {id} rejected (worker exited)"
            ))),
            Ok(Ok((reply_id, reply))) => {
                debug_assert_eq!(reply_id, id);
                Ok(reply)
            }
        }
    }

    /// Run one evaluation on a worker.
    pub async fn match_threats(&self, input: &MatchInput) -> Result<Vec<ThreatMatch>> {
        let (id, rx) = self.submit(PoolTask::MatchThreats(input.clone()))?;
        match self.await_reply(id, rx).await? {
            PoolReply::Matches(matches) => Ok(matches),
            PoolReply::Batch(_) => Err(CoachError::WorkerPool("mismatched reply kind".into())),
        }
    }

    /// Run a batch of evaluations as one task on one worker.
    pub async fn batch_match(&self, inputs: &[MatchInput]) -> Result<Vec<Vec<ThreatMatch>>> {
        let (id, rx) = self.submit(PoolTask::BatchMatch(inputs.to_vec()))?;
        match self.await_reply(id, rx).await? {
            PoolReply::Batch(results) => Ok(results),
            PoolReply::Matches(_) => Err(CoachError::WorkerPool("mismatched reply kind".into())),
        }
    }

    /// Reject all pending tasks and stop every worker.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        // Dropping a sender ends that worker's recv loop; jobs still queued
        // on the channel are dropped with it, which rejects their waiters.
        for worker in workers.drain(..) {
            drop(worker.sender);
            if let Some(handle) = worker.handle {
                handle.join().ok();
            }
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

fn default_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn spawn_worker(_index: usize) -> Worker {
    let (tx, rx) = mpsc::channel::<Job>();
    let handle = std::thread::spawn(move || {
        while let Ok(job) = rx.recv() {
            let reply = match job.task {
                PoolTask::MatchThreats(input) => PoolReply::Matches(match_threats(&input)),
                PoolTask::BatchMatch(inputs) => {
                    PoolReply::Batch(inputs.iter().map(match_threats).collect())
                }
            };
            // The caller may have timed out; a dropped receiver is fine.
            job.reply.send((job.id, reply)).ok();
        }
    });
    Worker {
        sender: tx,
        handle: Some(handle),
    }
}
