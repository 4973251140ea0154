use super::handler::{JobContext, JobHandler};
use super::rate_limit::RateLimiter;
use super::{JobEvent, JobQueue, LaneState};
use crate::config::RuntimeConfig;
use crate::error::{HandlerError, QueueError};
use crate::types::{Job, JobAttempt, JobId, JobStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type InFlight = Arc<Mutex<HashMap<JobId, JoinHandle<()>>>>;

fn lock_in_flight(in_flight: &InFlight) -> MutexGuard<'_, HashMap<JobId, JoinHandle<()>>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pause after a storage error before polling the lane again
const STORAGE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Workers draining one lane of the [`JobQueue`].
///
/// A single dispatcher task claims jobs while a concurrency permit and a
/// rate-limit slot are available; each claimed job runs in its own task.
pub struct WorkerPool {
    name: String,
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    in_flight: InFlight,
}

struct Dispatcher {
    name: String,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: Arc<RuntimeConfig>,
    semaphore: Arc<Semaphore>,
    rate_limiter: Option<RateLimiter>,
    shutdown: CancellationToken,
    in_flight: InFlight,
}

impl WorkerPool {
    /// Start draining `name` with the queue's configured concurrency and rate limit
    pub fn spawn(
        name: impl Into<String>,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        let name = name.into();
        let queue_config = config.queue(&name);
        let shutdown = CancellationToken::new();
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));

        tracing::info!(
            "Starting worker pool {} (concurrency={}, rate_limit={:?})",
            name,
            queue_config.concurrency,
            queue_config.rate_limit
        );

        let dispatcher = Arc::new(Dispatcher {
            name: name.clone(),
            queue: queue.clone(),
            handler,
            config,
            semaphore: Arc::new(Semaphore::new(queue_config.concurrency.max(1))),
            rate_limiter: queue_config.rate_limit.as_ref().map(RateLimiter::from_config),
            shutdown: shutdown.clone(),
            in_flight: in_flight.clone(),
        });
        let handle = tokio::spawn(dispatcher.run());

        Self {
            name,
            queue,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
            in_flight,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs currently being processed
    pub fn in_flight(&self) -> usize {
        lock_in_flight(&self.in_flight).len()
    }

    /// Stop claiming, wait up to `grace` for in-flight jobs, then abort the
    /// rest and return them to pending. Returns how many were returned.
    pub async fn stop(&self, grace: Duration) -> usize {
        self.shutdown.cancel();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = dispatcher {
            let _ = handle.await;
        }

        let handles: Vec<(JobId, JoinHandle<()>)> = lock_in_flight(&self.in_flight).drain().collect();
        let deadline = Instant::now() + grace;
        let mut released = 0;

        for (job_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_ok() {
                continue;
            }

            handle.abort();
            let _ = handle.await;
            match self.queue.release(&job_id) {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(e) => tracing::error!("Failed to release job {}: {}", job_id, e),
            }
        }

        tracing::info!("Worker pool {} stopped ({} jobs returned to pending)", self.name, released);
        released
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Dispatcher {
    async fn run(self: Arc<Self>) {
        let notify = self.queue.notifier(&self.name);

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // Wait for an eligible job
            loop {
                let wait = match self.queue.lane_state(&self.name) {
                    LaneState::Ready => break,
                    LaneState::WaitUntil(deadline) => Some(deadline),
                    LaneState::Empty => None,
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = notify.notified() => {}
                    _ = sleep_until_opt(wait) => {}
                }
            }

            if let Some(limiter) = &self.rate_limiter {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = limiter.acquire() => {}
                }
            }

            let claimed = self.queue.claim(&self.name);
            if !matches!(claimed, Ok(Some(_))) {
                // Nothing started, so the slot goes back to the window
                if let Some(limiter) = &self.rate_limiter {
                    limiter.release();
                }
            }

            match claimed {
                Ok(Some((job, token))) => self.start(job, token, permit),
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Worker pool {} failed to claim a job: {}", self.name, e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(STORAGE_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    fn start(self: &Arc<Self>, job: Job, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let job_id = job.id.clone();
        let worker = self.clone();

        // Insert under the lock so the task cannot remove itself first
        let mut in_flight = lock_in_flight(&self.in_flight);
        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            worker.process(job, token).await;
            lock_in_flight(&worker.in_flight).remove(&task_job_id);
        });
        in_flight.insert(job_id, handle);
    }

    async fn process(&self, mut job: Job, token: CancellationToken) {
        if let Err(e) = self.attempt(&mut job, token).await {
            tracing::error!("Failed to record outcome of job {}: {}", job.id, e);
        }
    }

    /// Run one attempt and record its outcome
    async fn attempt(&self, job: &mut Job, token: CancellationToken) -> Result<(), QueueError> {
        let defaults = &self.config.jobs;
        let attempt = job.attempts.len() as u32 + 1;
        let max_attempts = job.options.retries.unwrap_or(defaults.default_retries) + 1;
        let timeout_ms = job.options.timeout_ms.unwrap_or(defaults.default_timeout_ms);

        let now = Utc::now();
        job.attempts.push(JobAttempt {
            attempt,
            started_at: now,
            finished_at: None,
            error: None,
            run_id: None,
        });
        job.updated_at = now;
        self.queue.save(job)?;
        self.queue.publish(JobEvent::Started {
            job_id: job.id.clone(),
            attempt,
        });
        tracing::info!(
            "Processing job {} on {} (attempt {}/{})",
            job.id,
            self.name,
            attempt,
            max_attempts
        );

        // A timeout cancels only this attempt; `token` stays reserved for job cancellation
        let attempt_token = token.child_token();
        let ctx = JobContext::new(job, attempt, attempt_token.clone());
        let result = {
            let mut handling = self.handler.handle(job, &ctx);
            match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut handling).await {
                Ok(result) => result,
                Err(_) => {
                    // Let the handler record its own outcome (e.g. the run as cancelled)
                    attempt_token.cancel();
                    if tokio::time::timeout(self.config.timeout_settle(), &mut handling)
                        .await
                        .is_err()
                    {
                        tracing::warn!("Job {} did not settle after its timeout, dropping it", job.id);
                    }
                    Err(HandlerError::retryable(format!(
                        "job timed out after {} ms",
                        timeout_ms
                    )))
                }
            }
        };

        if let Some(record) = job.attempts.last_mut() {
            record.finished_at = Some(Utc::now());
            record.error = result.as_ref().err().map(|e| e.to_string());
            record.run_id = ctx.recorded_run();
        }

        match result {
            Ok(output) => {
                job.result = Some(output);
                job.error = None;
                tracing::info!("Job {} completed after {} attempt(s)", job.id, attempt);
                self.queue.finish(job, JobStatus::Completed)
            }
            Err(HandlerError::Cancelled) => self.cancelled(job),
            Err(_) if token.is_cancelled() => self.cancelled(job),
            Err(HandlerError::Fatal(message)) => {
                tracing::error!("Job {} failed permanently: {}", job.id, message);
                job.error = Some(message);
                self.queue.finish(job, JobStatus::Failed)
            }
            Err(HandlerError::Retryable(message)) if attempt >= max_attempts => {
                let exhausted = QueueError::JobRetryExhausted {
                    job_id: job.id.clone(),
                    attempts: attempt,
                    last_error: message,
                };
                tracing::error!("{}", exhausted);
                job.error = Some(exhausted.to_string());
                self.queue.finish(job, JobStatus::Failed)
            }
            Err(HandlerError::Retryable(message)) => {
                let delay = self.config.backoff(attempt);
                tracing::warn!(
                    "Job {} attempt {} failed, retrying in {:?}: {}",
                    job.id,
                    attempt,
                    delay,
                    message
                );
                job.error = Some(message.clone());
                if self.queue.requeue(job, delay)? {
                    self.queue.publish(JobEvent::Retrying {
                        job_id: job.id.clone(),
                        attempt,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error: message,
                    });
                }
                Ok(())
            }
        }
    }

    fn cancelled(&self, job: &mut Job) -> Result<(), QueueError> {
        tracing::warn!("Job {} cancelled", job.id);
        job.error = None;
        self.queue.finish(job, JobStatus::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, RateLimitConfig};
    use crate::events::MemoryEventLog;
    use crate::execution::ExecutionManager;
    use crate::node::{builtin, NodeRegistry};
    use crate::queue::WorkflowJobHandler;
    use crate::storage::{MemoryStore, RunStore, WorkflowStore};
    use crate::types::{
        JobOptions, JobType, RunStatus, WorkflowDefinition, WorkflowId, WorkflowNode,
    };
    use crate::workflow::WorkflowEngine;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    const QUEUE: &str = "workflow-execution";

    /// Fails the first `failures` calls, then succeeds
    struct Flaky {
        failures: u32,
        fatal: bool,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                fatal: false,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job, _ctx: &JobContext) -> Result<Value, HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                let message = format!("failure {}", call);
                return Err(if self.fatal {
                    HandlerError::Fatal(message)
                } else {
                    HandlerError::Retryable(message)
                });
            }
            Ok(json!({ "calls": call }))
        }
    }

    /// Sleeps, tracking how many calls overlap and when each started
    #[derive(Default)]
    struct Sleeper {
        ms: u64,
        honour_cancel: bool,
        current: AtomicUsize,
        peak: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl Sleeper {
        fn new(ms: u64, honour_cancel: bool) -> Arc<Self> {
            Arc::new(Self {
                ms,
                honour_cancel,
                ..Default::default()
            })
        }
    }

    #[async_trait::async_trait]
    impl JobHandler for Sleeper {
        async fn handle(&self, _job: &Job, ctx: &JobContext) -> Result<Value, HandlerError> {
            self.starts.lock().unwrap().push(Instant::now());
            let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);

            let sleep = tokio::time::sleep(Duration::from_millis(self.ms));
            let result = if self.honour_cancel {
                tokio::select! {
                    _ = sleep => Ok(json!("slept")),
                    _ = ctx.cancellation.cancelled() => Err(HandlerError::Cancelled),
                }
            } else {
                sleep.await;
                Ok(json!("slept"))
            };

            self.current.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn config(queue: QueueConfig) -> Arc<RuntimeConfig> {
        let mut config = RuntimeConfig::default();
        config.queues.insert(QUEUE.to_string(), queue);
        Arc::new(config)
    }

    fn setup(
        handler: Arc<dyn JobHandler>,
        queue_config: QueueConfig,
    ) -> (Arc<JobQueue>, WorkerPool) {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new())));
        let pool = WorkerPool::spawn(QUEUE, queue.clone(), handler, config(queue_config));
        (queue, pool)
    }

    fn single() -> QueueConfig {
        QueueConfig {
            concurrency: 1,
            rate_limit: None,
        }
    }

    fn enqueue(queue: &JobQueue, options: JobOptions) -> JobId {
        queue
            .enqueue(JobType::WorkflowExecution, json!({}), options)
            .unwrap()
    }

    const WAIT: Duration = Duration::from_secs(600);

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_completes() {
        let handler = Flaky::new(2);
        let (queue, pool) = setup(handler.clone(), single());

        let id = enqueue(&queue, JobOptions::default().with_retries(2));
        let job = queue.wait_for(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts.len(), 3);
        assert_eq!(job.failed_attempts(), 2);
        assert_eq!(job.retry_count(), 2);
        assert!(job.error.is_none());
        assert_eq!(job.result, Some(json!({"calls": 3})));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_back_off_exponentially() {
        let handler = Flaky::new(2);
        let (queue, pool) = setup(handler, single());
        let mut events = queue.subscribe();

        let id = enqueue(&queue, JobOptions::default().with_retries(2));
        queue.wait_for(&id, WAIT).await.unwrap();

        let mut delays = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Retrying { delay_ms, error, .. } = event {
                delays.push((delay_ms, error));
            }
        }
        assert_eq!(
            delays,
            vec![
                (1_000, "failure 1".to_string()),
                (2_000, "failure 2".to_string())
            ]
        );

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_job() {
        let handler = Flaky::new(u32::MAX);
        let (queue, pool) = setup(handler.clone(), single());

        let id = enqueue(&queue, JobOptions::default().with_retries(1));
        let job = queue.wait_for(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts.len(), 2);
        let error = job.error.unwrap();
        assert!(error.contains("after 2 attempts"), "{}", error);
        assert!(error.contains("failure 2"), "{}", error);

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_skips_retries() {
        let handler = Arc::new(Flaky {
            failures: 1,
            fatal: true,
            calls: AtomicU32::new(0),
        });
        let (queue, pool) = setup(handler.clone(), single());

        let id = enqueue(&queue, JobOptions::default().with_retries(5));
        let job = queue.wait_for(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("failure 1"));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_attempt() {
        let handler = Sleeper::new(10_000, false);
        let (queue, pool) = setup(handler, single());

        let id = enqueue(
            &queue,
            JobOptions::default().with_retries(0).with_timeout_ms(100),
        );
        let job = queue.wait_for(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timed out after 100 ms"));

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_workflow_job_settles_its_run() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(NodeRegistry::new());
        registry.load_catalog(&builtin::catalog());
        let engine = Arc::new(WorkflowEngine::new(
            registry,
            Arc::new(ExecutionManager::new()),
            store.clone(),
            Arc::new(MemoryEventLog::new()),
        ));
        store
            .save_workflow(&WorkflowDefinition {
                id: WorkflowId::new("slow"),
                name: "slow".to_string(),
                nodes: vec![WorkflowNode::new("wait", "delay").with_config(json!({"ms": 60_000}))],
                edges: vec![],
            })
            .unwrap();

        let queue = Arc::new(JobQueue::new(store.clone()));
        let handler = Arc::new(WorkflowJobHandler::new(engine, store.clone()));
        let pool = WorkerPool::spawn(QUEUE, queue.clone(), handler, config(single()));

        let id = queue
            .enqueue(
                JobType::WorkflowExecution,
                json!({"workflow_id": "slow"}),
                JobOptions::default().with_retries(0).with_timeout_ms(100),
            )
            .unwrap();
        let job = queue.wait_for(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("timed out after 100 ms"));

        // The run was told to stop and recorded that itself
        let run_id = job.attempts[0].run_id.clone().unwrap();
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.completed_at.is_some());

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_entry_does_not_spend_rate_limit() {
        let handler = Sleeper::new(0, false);
        let (queue, pool) = setup(
            handler.clone(),
            QueueConfig {
                concurrency: 1,
                rate_limit: Some(RateLimitConfig {
                    max: 1,
                    per_ms: 1_000,
                }),
            },
        );

        // Cancelled while queued: the dispatcher finds nothing to claim
        let skipped = enqueue(&queue, JobOptions::default());
        queue.cancel_job(&skipped).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = Instant::now();
        let id = enqueue(&queue, JobOptions::default());
        assert_eq!(
            queue.wait_for(&id, WAIT).await.unwrap().status,
            JobStatus::Completed
        );

        let starts = handler.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 1);
        assert!(starts[0] - start < Duration::from_millis(100));

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_ceiling() {
        let handler = Sleeper::new(100, false);
        let (queue, pool) = setup(
            handler.clone(),
            QueueConfig {
                concurrency: 2,
                rate_limit: None,
            },
        );

        let ids: Vec<JobId> = (0..5).map(|_| enqueue(&queue, JobOptions::default())).collect();
        for id in &ids {
            let job = queue.wait_for(id, WAIT).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }

        assert_eq!(handler.peak.load(Ordering::SeqCst), 2);
        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spreads_starts() {
        let handler = Sleeper::new(0, false);
        let (queue, pool) = setup(
            handler.clone(),
            QueueConfig {
                concurrency: 10,
                rate_limit: Some(RateLimitConfig {
                    max: 2,
                    per_ms: 1_000,
                }),
            },
        );

        let ids: Vec<JobId> = (0..5).map(|_| enqueue(&queue, JobOptions::default())).collect();
        for id in &ids {
            queue.wait_for(id, WAIT).await.unwrap();
        }

        let starts = handler.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 5);
        // Two per window: jobs 3 and 5 open new windows
        assert!(starts[2] - starts[0] >= Duration::from_millis(1_000));
        assert!(starts[4] - starts[0] >= Duration::from_millis(2_000));

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_processing_job() {
        let handler = Sleeper::new(60_000, true);
        let (queue, pool) = setup(handler.clone(), single());

        let id = enqueue(&queue, JobOptions::default());
        while handler.starts.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(queue.cancel_job(&id).unwrap());
        let job = queue.wait_for(&id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.error.is_none());

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_waits_for_short_jobs() {
        let handler = Sleeper::new(100, false);
        let (queue, pool) = setup(handler.clone(), single());

        let id = enqueue(&queue, JobOptions::default());
        while handler.starts.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(pool.stop(Duration::from_secs(5)).await, 0);
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_returns_stragglers_to_pending() {
        let handler = Sleeper::new(60_000, false);
        let (queue, pool) = setup(handler.clone(), single());

        let id = enqueue(&queue, JobOptions::default());
        while handler.starts.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let waiting = enqueue(&queue, JobOptions::default());

        assert_eq!(pool.stop(Duration::from_secs(1)).await, 1);
        assert_eq!(pool.in_flight(), 0);

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            job.attempts[0].error.as_deref(),
            Some("abandoned during shutdown")
        );
        assert_eq!(queue.get_job(&waiting).unwrap().status, JobStatus::Pending);
    }
}
