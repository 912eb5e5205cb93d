//! Submission queue and worker pool
//!
//! The queue is a bounded priority queue (higher priority first, FIFO among
//! equal priority) guarded by a single lock, which also tracks which
//! submissions are running so that admission, cancellation and completion
//! see one consistent view. A fixed pool of workers drains it.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::{Priority, Submission, SubmissionId};
use crate::error::EngineError;
use crate::reporter::Completion;

/// A submission waiting for a worker
pub struct QueuedJob {
    pub submission: Submission,
    pub cancel: CancellationToken,
    pub completion: Completion,
}

struct Entry {
    priority: Priority,
    seq: u64,
    job: QueuedJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then lower sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    queued: HashSet<SubmissionId>,
    running: HashMap<SubmissionId, CancellationToken>,
    next_seq: u64,
    closed: bool,
}

/// What `cancel` did
pub enum CancelOutcome {
    /// The job was still queued and has been removed; it still needs its
    /// report
    Dequeued(QueuedJob),
    /// The job is running and its token has been cancelled
    Signalled,
}

/// Bounded priority queue of submissions
pub struct JudgeQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
}

impl JudgeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of submissions waiting for a worker
    pub fn depth(&self) -> usize {
        self.lock().heap.len()
    }

    /// Number of submissions claimed by workers
    pub fn in_flight(&self) -> usize {
        self.lock().running.len()
    }

    /// Admit a submission without blocking.
    ///
    /// `completion` is only called once the submission is admitted, so a
    /// rejected submission never owes a report.
    pub fn push<F>(&self, submission: Submission, completion: F) -> Result<(), EngineError>
    where
        F: FnOnce() -> Completion,
    {
        let id = submission.id;
        {
            let mut state = self.lock();
            if state.closed {
                return Err(EngineError::ShuttingDown);
            }
            if state.queued.contains(&id) || state.running.contains_key(&id) {
                return Err(EngineError::MalformedRequest(format!(
                    "submission {} is already being judged",
                    id
                )));
            }
            if state.heap.len() >= self.capacity {
                return Err(EngineError::QueueFull {
                    capacity: self.capacity,
                });
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.queued.insert(id);
            state.heap.push(Entry {
                priority: submission.priority,
                seq,
                job: QueuedJob {
                    submission,
                    cancel: CancellationToken::new(),
                    completion: completion(),
                },
            });
        }
        self.available.notify_one();
        debug!("Queued submission {}", id);
        Ok(())
    }

    /// Wait for the next job. `None` once the queue is closed and empty.
    pub async fn pop(self: &Arc<Self>) -> Option<ClaimedJob> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(entry) = state.heap.pop() {
                    let QueuedJob {
                        submission,
                        cancel,
                        completion,
                    } = entry.job;
                    state.queued.remove(&submission.id);
                    state.running.insert(submission.id, cancel.clone());
                    return Some(ClaimedJob {
                        running: RunningGuard {
                            id: submission.id,
                            queue: Arc::clone(self),
                        },
                        submission,
                        cancel,
                        completion,
                    });
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Cancel a queued or running submission
    pub fn cancel(&self, id: SubmissionId) -> Result<CancelOutcome, EngineError> {
        let mut state = self.lock();

        if state.queued.remove(&id) {
            let mut removed = None;
            let entries = std::mem::take(&mut state.heap).into_vec();
            state.heap = entries
                .into_iter()
                .filter_map(|entry| {
                    if entry.job.submission.id == id {
                        removed = Some(entry.job);
                        None
                    } else {
                        Some(entry)
                    }
                })
                .collect();
            if let Some(job) = removed {
                job.cancel.cancel();
                return Ok(CancelOutcome::Dequeued(job));
            }
        }

        match state.running.get(&id) {
            Some(token) => {
                token.cancel();
                Ok(CancelOutcome::Signalled)
            }
            None => Err(EngineError::UnknownSubmission(id)),
        }
    }

    /// Stop admission, cancel running jobs and hand back everything queued
    pub fn close(&self) -> Vec<QueuedJob> {
        let drained: Vec<QueuedJob> = {
            let mut state = self.lock();
            state.closed = true;
            for token in state.running.values() {
                token.cancel();
            }
            state.queued.clear();
            std::mem::take(&mut state.heap)
                .into_sorted_vec()
                .into_iter()
                .rev()
                .map(|entry| entry.job)
                .collect()
        };
        self.available.notify_waiters();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn release(&self, id: SubmissionId) {
        self.lock().running.remove(&id);
    }
}

/// Removes a job from the running set when dropped
pub struct RunningGuard {
    id: SubmissionId,
    queue: Arc<JudgeQueue>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.queue.release(self.id);
    }
}

/// A job owned by exactly one worker
pub struct ClaimedJob {
    pub submission: Submission,
    pub cancel: CancellationToken,
    pub completion: Completion,
    pub running: RunningGuard,
}

/// Concurrency token for one in-flight job
pub struct WorkSlot {
    _permit: OwnedSemaphorePermit,
}

/// Work done by a pool worker for each claimed job
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: ClaimedJob, slot: WorkSlot);
}

/// Fixed set of workers pulling from a queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    slots: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn start(size: usize, queue: Arc<JudgeQueue>, handler: Arc<dyn JobHandler>) -> Self {
        let size = size.max(1);
        let slots = Arc::new(Semaphore::new(size));
        let handles = (0..size)
            .map(|worker| {
                tokio::spawn(worker_loop(
                    worker,
                    Arc::clone(&queue),
                    Arc::clone(&slots),
                    Arc::clone(&handler),
                ))
            })
            .collect();
        Self {
            handles,
            slots,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently held by jobs
    pub fn busy_slots(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Wait for every worker to exit (after the queue is closed)
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<JudgeQueue>,
    slots: Arc<Semaphore>,
    handler: Arc<dyn JobHandler>,
) {
    while let Some(job) = queue.pop().await {
        let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
            break;
        };
        let id = job.submission.id;
        debug!("Worker {} claimed submission {}", worker, id);

        // A panicking job must not take the worker down with it
        let handler = Arc::clone(&handler);
        let task = tokio::spawn(async move {
            handler.handle(job, WorkSlot { _permit: permit }).await;
        });
        if let Err(e) = task.await {
            error!("Worker {} crashed judging submission {}: {}", worker, id, e);
        }
    }
    debug!("Worker {} stopped", worker);
}
