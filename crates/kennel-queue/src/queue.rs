//! The in-process job queue and its worker loop.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, Priority};

/// Identifier assigned to a saved job.
pub type JobId = u64;

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub job: Job,
    pub priority: Priority,
    remove_on_complete: bool,
}

/// A job waiting for its delay to elapse. Orders by earliest due, then FIFO.
#[derive(Debug)]
struct Delayed {
    due: Instant,
    queued: QueuedJob,
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the "greatest" entry is promoted first.
        other
            .due
            .cmp(&self.due)
            .then(other.queued.id.cmp(&self.queued.id))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.queued.id == other.queued.id
    }
}

impl Eq for Delayed {}

/// A due job. Orders by highest priority, then FIFO.
#[derive(Debug)]
struct Ready(QueuedJob);

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then(other.0.id.cmp(&self.0.id))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Ready {}

#[derive(Debug, Default)]
struct Inner {
    delayed: BinaryHeap<Delayed>,
    ready: BinaryHeap<Ready>,
    next_id: JobId,
    /// Finished jobs saved with `remove_on_complete(false)`.
    completed: Vec<QueuedJob>,
    closed: bool,
}

impl Inner {
    /// Move every delayed job whose time has come onto the ready heap.
    fn promote(&mut self, now: Instant) {
        while self.delayed.peek().is_some_and(|d| d.due <= now) {
            if let Some(d) = self.delayed.pop() {
                self.ready.push(Ready(d.queued));
            }
        }
    }
}

/// Shared handle to a job queue.
#[derive(Clone, Default)]
pub struct JobQueue {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a job. Nothing is queued until [`JobBuilder::save`].
    pub fn create(&self, job: Job) -> JobBuilder<'_> {
        JobBuilder {
            queue: self,
            job,
            delay: Duration::ZERO,
            priority: Priority::default(),
            remove_on_complete: true,
        }
    }

    /// Number of jobs waiting (due or not).
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.delayed.len() + inner.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Pop the highest-priority due job, if any.
    pub async fn try_next(&self) -> Option<QueuedJob> {
        let mut inner = self.inner.lock().await;
        inner.promote(Instant::now());
        inner.ready.pop().map(|r| r.0)
    }

    /// Wait for the next due job.
    pub async fn next(&self) -> QueueResult<QueuedJob> {
        loop {
            if self.inner.lock().await.closed {
                return Err(QueueError::Closed);
            }
            if let Some(job) = self.try_next().await {
                return Ok(job);
            }
            let wake_at = self.inner.lock().await.delayed.peek().map(|d| d.due);

            match wake_at {
                Some(due) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(due) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// Mark a job finished.
    pub async fn complete(&self, job: QueuedJob) {
        if !job.remove_on_complete {
            self.inner.lock().await.completed.push(job);
        }
    }

    /// Finished jobs that were saved with `remove_on_complete(false)`.
    pub async fn completed(&self) -> Vec<QueuedJob> {
        self.inner.lock().await.completed.clone()
    }

    /// Stop accepting jobs and wake any waiting worker.
    pub async fn close(&self) {
        self.inner.lock().await.closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Worker loop: hand each due job to `handler` until shutdown or close.
    ///
    /// Handler errors are logged and the job is completed anyway.
    pub async fn process<F, Fut>(&self, handler: F, mut shutdown: watch::Receiver<bool>)
    where
        F: Fn(Job) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        info!("job worker started");
        loop {
            tokio::select! {
                next = self.next() => match next {
                    Ok(queued) => {
                        debug!(
                            job_id = queued.id,
                            kind = queued.job.kind(),
                            priority = ?queued.priority,
                            "processing job"
                        );
                        if let Err(e) = handler(queued.job.clone()).await {
                            warn!(
                                job_id = queued.id,
                                kind = queued.job.kind(),
                                error = %e,
                                "job failed"
                            );
                        }
                        self.complete(queued).await;
                    }
                    Err(e) => {
                        info!(reason = %e, "job worker stopping");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("job worker shutting down");
                    break;
                }
            }
        }
    }

    async fn push(&self, job: Job, delay: Duration, priority: Priority, remove_on_complete: bool) -> QueueResult<JobId> {
        let id = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(QueueError::Closed);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            debug!(job_id = id, %job, delay_ms = delay.as_millis() as u64, ?priority, "job saved");
            inner.delayed.push(Delayed {
                due: Instant::now() + delay,
                queued: QueuedJob {
                    id,
                    job,
                    priority,
                    remove_on_complete,
                },
            });
            id
        };
        self.notify.notify_one();
        Ok(id)
    }
}

/// Chainable job options.
#[must_use = "a job is only queued once `save` is awaited"]
pub struct JobBuilder<'a> {
    queue: &'a JobQueue,
    job: Job,
    delay: Duration,
    priority: Priority,
    remove_on_complete: bool,
}

impl JobBuilder<'_> {
    /// Hold the job back for `delay`.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Forget the job once processed (default `true`).
    pub fn remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    pub async fn save(self) -> QueueResult<JobId> {
        self.queue
            .push(self.job, self.delay, self.priority, self.remove_on_complete)
            .await
    }
}
