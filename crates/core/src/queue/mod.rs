//! Persisted job queue with one lane per job type.
//!
//! Producers call [`JobQueue::enqueue`]; each lane is drained by exactly one
//! [`WorkerPool`]. The job store holds the authoritative job record, the
//! queue only keeps ids in dispatch order.

pub mod handler;
pub mod rate_limit;
pub mod runtime;
pub mod worker;

pub use handler::{
    AgentJobHandler, AgentRunner, JobContext, JobHandler, WebhookJobHandler, WorkflowJobHandler,
};
pub use rate_limit::RateLimiter;
pub use runtime::JobRuntime;
pub use worker::WorkerPool;

use crate::error::QueueError;
use crate::storage::JobStore;
use crate::types::{Job, JobId, JobOptions, JobStatus, JobType};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Job lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Enqueued { job_id: JobId, job_type: JobType },
    Started { job_id: JobId, attempt: u32 },
    Retrying { job_id: JobId, attempt: u32, delay_ms: u64, error: String },
    Completed { job_id: JobId },
    Failed { job_id: JobId, error: String },
    Cancelled { job_id: JobId },
}

impl JobEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id } => job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Job counts for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// What a lane can offer its worker right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Ready,
    /// Nothing eligible until this instant
    WaitUntil(Instant),
    Empty,
}

/// Eligible job: higher priority first, then FIFO
#[derive(Debug, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    job_id: JobId,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Job waiting for its ready time
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedEntry {
    ready_at: Instant,
    seq: u64,
    priority: i32,
    job_id: JobId,
}

struct Lane {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    notify: Arc<Notify>,
}

impl Lane {
    fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            delayed: BinaryHeap::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Move every delayed job whose time has come into the ready heap
    fn promote(&mut self, now: Instant) {
        while let Some(Reverse(next)) = self.delayed.peek() {
            if next.ready_at > now {
                break;
            }
            if let Some(Reverse(entry)) = self.delayed.pop() {
                self.ready.push(ReadyEntry {
                    priority: entry.priority,
                    seq: entry.seq,
                    job_id: entry.job_id,
                });
            }
        }
    }

    fn contains(&self, job_id: &JobId) -> bool {
        self.ready.iter().any(|e| &e.job_id == job_id)
            || self.delayed.iter().any(|Reverse(e)| &e.job_id == job_id)
    }
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<String, Lane>,
    /// Tokens of jobs a worker is currently processing
    processing: HashMap<JobId, CancellationToken>,
    seq: u64,
}

impl QueueState {
    fn lane(&mut self, name: &str) -> &mut Lane {
        self.lanes.entry(name.to_string()).or_insert_with(Lane::new)
    }
}

/// The queue shared by producers and worker pools
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<JobEvent>,
    closed: AtomicBool,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            state: Mutex::new(QueueState::default()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, event: JobEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Persist a pending job and hand it to its lane; never runs the handler
    pub fn enqueue(
        &self,
        job_type: JobType,
        data: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        self.enqueue_job(Job::new(job_type, data, options))
    }

    /// Enqueue a job built by the caller, e.g. to record its id elsewhere first
    pub fn enqueue_job(&self, job: Job) -> Result<JobId, QueueError> {
        if self.closed.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }

        let job_type = job.job_type.clone();
        self.store.save_job(&job)?;

        let delay = Duration::from_millis(job.options.delay_ms);
        self.schedule(&job, delay);

        tracing::info!(
            "Enqueued job {} on {} (priority={}, delay_ms={})",
            job.id,
            job_type,
            job.options.priority,
            job.options.delay_ms
        );
        self.publish(JobEvent::Enqueued {
            job_id: job.id.clone(),
            job_type,
        });

        Ok(job.id)
    }

    /// Put a job id into its lane, eligible after `delay`
    fn schedule(&self, job: &Job, delay: Duration) {
        let notify = Self::push(&mut self.state(), job, delay);
        notify.notify_one();
    }

    /// Add a lane entry under a held lock; returns the lane's wake-up handle
    fn push(state: &mut QueueState, job: &Job, delay: Duration) -> Arc<Notify> {
        state.seq += 1;
        let seq = state.seq;
        let lane = state.lane(job.job_type.queue_name());

        if delay.is_zero() {
            lane.ready.push(ReadyEntry {
                priority: job.options.priority,
                seq,
                job_id: job.id.clone(),
            });
        } else {
            lane.delayed.push(Reverse(DelayedEntry {
                ready_at: Instant::now() + delay,
                seq,
                priority: job.options.priority,
                job_id: job.id.clone(),
            }));
        }
        lane.notify.clone()
    }

    /// Wake-up handle for a lane's worker
    pub fn notifier(&self, queue: &str) -> Arc<Notify> {
        self.state().lane(queue).notify.clone()
    }

    pub fn lane_state(&self, queue: &str) -> LaneState {
        let mut state = self.state();
        let lane = state.lane(queue);
        lane.promote(Instant::now());

        if !lane.ready.is_empty() {
            LaneState::Ready
        } else if let Some(Reverse(next)) = lane.delayed.peek() {
            LaneState::WaitUntil(next.ready_at)
        } else {
            LaneState::Empty
        }
    }

    /// Take the next eligible job off a lane and mark it processing.
    ///
    /// Ids whose stored job is no longer pending (e.g. cancelled while
    /// queued) are dropped. Returns `None` when nothing is eligible.
    ///
    /// Status checks and transitions in the queue all happen under the state
    /// lock, so a concurrent [`cancel_job`](Self::cancel_job) sees either a
    /// pending job or a processing one whose token is registered.
    pub fn claim(&self, queue: &str) -> Result<Option<(Job, CancellationToken)>, QueueError> {
        let mut state = self.state();
        loop {
            let lane = state.lane(queue);
            lane.promote(Instant::now());
            let Some(job_id) = lane.ready.peek().map(|entry| entry.job_id.clone()) else {
                return Ok(None);
            };

            // The entry stays queued until its record has moved to processing
            let mut job = match self.store.get_job(&job_id)? {
                Some(job) if job.status == JobStatus::Pending => job,
                Some(job) => {
                    tracing::debug!("Skipping job {} in status {:?}", job.id, job.status);
                    state.lane(queue).ready.pop();
                    continue;
                }
                None => {
                    tracing::warn!("Dropping queued job {}: no stored record", job_id);
                    state.lane(queue).ready.pop();
                    continue;
                }
            };

            let now = Utc::now();
            job.status = JobStatus::Processing;
            job.started_at.get_or_insert(now);
            job.updated_at = now;
            self.store.save_job(&job)?;

            state.lane(queue).ready.pop();
            let token = CancellationToken::new();
            state.processing.insert(job.id.clone(), token.clone());
            drop(state);

            tracing::info!("Claimed job {} from {}", job.id, queue);
            return Ok(Some((job, token)));
        }
    }

    /// Persist an in-progress update (e.g. a new attempt record)
    pub(crate) fn save(&self, job: &Job) -> Result<(), QueueError> {
        self.store.save_job(job)?;
        Ok(())
    }

    /// Send a failed attempt back to the lane, eligible after `delay`.
    ///
    /// Returns `false` when a cancel arrived while the attempt was running;
    /// the job is then finished as cancelled instead.
    pub(crate) fn requeue(&self, job: &mut Job, delay: Duration) -> Result<bool, QueueError> {
        let mut state = self.state();
        let cancelled = state
            .processing
            .get(&job.id)
            .is_some_and(CancellationToken::is_cancelled);

        if cancelled {
            job.error = None;
            mark_terminal(job, JobStatus::Cancelled);
            self.store.save_job(job)?;
            state.processing.remove(&job.id);
            drop(state);

            tracing::info!("Job {} cancelled before its retry", job.id);
            self.publish_terminal(job);
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.updated_at = Utc::now();
        self.store.save_job(job)?;
        state.processing.remove(&job.id);
        let notify = Self::push(&mut state, job, delay);
        drop(state);

        notify.notify_one();
        Ok(true)
    }

    /// Record a terminal state and notify waiters
    pub(crate) fn finish(&self, job: &mut Job, status: JobStatus) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            mark_terminal(job, status);
            self.store.save_job(job)?;
            state.processing.remove(&job.id);
        }
        self.publish_terminal(job);
        Ok(())
    }

    fn publish_terminal(&self, job: &Job) {
        let job_id = job.id.clone();
        self.publish(match job.status {
            JobStatus::Completed => JobEvent::Completed { job_id },
            JobStatus::Cancelled => JobEvent::Cancelled { job_id },
            _ => JobEvent::Failed {
                job_id,
                error: job.error.clone().unwrap_or_default(),
            },
        });
    }

    /// Return an abandoned processing job to pending, e.g. after a forced stop.
    ///
    /// A job whose cancel was already requested ends as cancelled instead.
    pub(crate) fn release(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let mut state = self.state();
        let cancelled = state
            .processing
            .remove(job_id)
            .is_some_and(|token| token.is_cancelled());

        let Some(mut job) = self.store.get_job(job_id)? else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing {
            return Ok(false);
        }

        let now = Utc::now();
        if let Some(attempt) = job.attempts.last_mut() {
            if attempt.finished_at.is_none() {
                attempt.finished_at = Some(now);
                attempt.error = Some("abandoned during shutdown".to_string());
            }
        }

        if cancelled {
            mark_terminal(&mut job, JobStatus::Cancelled);
            self.store.save_job(&job)?;
            drop(state);
            self.publish_terminal(&job);
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.updated_at = now;
        self.store.save_job(&job)?;
        let notify = Self::push(&mut state, &job, Duration::ZERO);
        drop(state);

        notify.notify_one();
        tracing::warn!("Returned job {} to pending", job_id);
        Ok(true)
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Job, QueueError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))
    }

    /// Cancel a job. Pending jobs end immediately; processing jobs have
    /// their token cancelled and end once the handler returns.
    ///
    /// Returns `false` when the job was already terminal.
    pub fn cancel_job(&self, job_id: &JobId) -> Result<bool, QueueError> {
        let mut state = self.state();
        let mut job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| QueueError::UnknownJob(job_id.clone()))?;

        match job.status {
            JobStatus::Pending => {
                mark_terminal(&mut job, JobStatus::Cancelled);
                self.store.save_job(&job)?;
                state.processing.remove(job_id);
                drop(state);

                self.publish_terminal(&job);
                tracing::info!("Cancelled pending job {}", job_id);
                Ok(true)
            }
            JobStatus::Processing => {
                if let Some(token) = state.processing.get(job_id) {
                    token.cancel();
                }
                tracing::info!("Cancellation signal sent for job {}", job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait_for(&self, job_id: &JobId, timeout: Duration) -> Result<Job, QueueError> {
        // Subscribe before reading so a transition in between is not missed
        let events = self.subscribe();

        tokio::time::timeout(timeout, self.wait_terminal(job_id, events))
            .await
            .map_err(|_| QueueError::WaitTimeout)?
    }

    async fn wait_terminal(
        &self,
        job_id: &JobId,
        mut events: broadcast::Receiver<JobEvent>,
    ) -> Result<Job, QueueError> {
        loop {
            let job = self.get_job(job_id)?;
            if job.status.is_terminal() {
                return Ok(job);
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.is_terminal() && event.job_id() == job_id => break,
                    Ok(_) => continue,
                    // Missed events; re-read the stored job
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(QueueError::ShuttingDown)
                    }
                }
            }
        }
    }

    /// Job counts for a named queue
    pub fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let job_type: JobType = queue
            .parse()
            .map_err(|_| QueueError::QueueNotFound(queue.to_string()))?;

        let mut stats = QueueStats::default();
        for job in self.store.list_jobs(None)? {
            if job.job_type != job_type {
                continue;
            }
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    /// Re-enqueue persisted pending and processing jobs, e.g. after a restart.
    ///
    /// Jobs left `processing` by a crashed process run again, so handlers
    /// see at-least-once delivery.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let mut jobs = self.store.list_jobs(Some(JobStatus::Pending))?;
        jobs.extend(self.store.list_jobs(Some(JobStatus::Processing))?);

        let mut recovered = 0;
        for listed in jobs {
            let mut state = self.state();
            if state.processing.contains_key(&listed.id)
                || state.lane(listed.job_type.queue_name()).contains(&listed.id)
            {
                continue;
            }

            // Re-read under the lock; the listing may be stale
            let Some(mut job) = self.store.get_job(&listed.id)? else {
                continue;
            };
            match job.status {
                JobStatus::Pending => {}
                JobStatus::Processing => {
                    job.status = JobStatus::Pending;
                    job.updated_at = Utc::now();
                    self.store.save_job(&job)?;
                }
                _ => continue,
            }
            let notify = Self::push(&mut state, &job, Duration::ZERO);
            drop(state);

            notify.notify_one();
            recovered += 1;
        }

        if recovered > 0 {
            tracing::info!("Recovered {} persisted jobs", recovered);
        }
        Ok(recovered)
    }

    /// Refuse further enqueues
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }
}

fn mark_terminal(job: &mut Job, status: JobStatus) {
    let now = Utc::now();
    job.status = status;
    job.updated_at = now;
    job.completed_at = Some(now);
}
