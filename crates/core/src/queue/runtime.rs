use super::handler::JobHandler;
use super::worker::WorkerPool;
use super::JobQueue;
use crate::config::RuntimeConfig;
use crate::error::QueueError;
use crate::types::JobType;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Owns the worker pools: one per job type with a registered handler
pub struct JobRuntime {
    queue: Arc<JobQueue>,
    config: Arc<RuntimeConfig>,
    handlers: BTreeMap<JobType, Arc<dyn JobHandler>>,
    pools: Mutex<Vec<WorkerPool>>,
}

impl JobRuntime {
    pub fn new(queue: Arc<JobQueue>, config: Arc<RuntimeConfig>) -> Self {
        Self {
            queue,
            config,
            handlers: BTreeMap::new(),
            pools: Mutex::new(Vec::new()),
        }
    }

    /// Route a job type to a handler. Takes effect on the next `start_workers`.
    pub fn register_handler(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!("Replacing handler for {}", job_type);
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.pools.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Names of the queues currently being drained
    pub fn running_queues(&self) -> Vec<String> {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|pool| pool.name().to_string())
            .collect()
    }

    /// Recover persisted jobs, then start a pool for every handled job type.
    /// Returns the number of pools started.
    pub fn start_workers(&self) -> Result<usize, QueueError> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        if !pools.is_empty() {
            tracing::warn!("Workers already running");
            return Ok(0);
        }

        self.queue.recover()?;

        for (job_type, handler) in &self.handlers {
            pools.push(WorkerPool::spawn(
                job_type.queue_name(),
                self.queue.clone(),
                handler.clone(),
                self.config.clone(),
            ));
        }

        for job_type in JobType::ALL {
            if !self.handlers.contains_key(&job_type) {
                tracing::warn!("No handler registered for {}; its jobs stay pending", job_type);
            }
        }

        tracing::info!("Started {} worker pools", pools.len());
        Ok(pools.len())
    }

    /// Close the queue and stop every pool, waiting up to the configured
    /// grace period. Returns how many in-flight jobs went back to pending.
    pub async fn stop_workers(&self) -> usize {
        self.queue.close();

        let pools: Vec<WorkerPool> = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let grace = self.config.grace_period();
        tracing::info!("Stopping {} worker pools (grace period {:?})", pools.len(), grace);

        let released: usize = futures::future::join_all(pools.iter().map(|pool| pool.stop(grace)))
            .await
            .into_iter()
            .sum();

        tracing::info!("All workers stopped");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::queue::JobContext;
    use crate::storage::MemoryStore;
    use crate::types::{Job, JobOptions, JobStatus};
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Echo;

    #[async_trait::async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job, _ctx: &JobContext) -> Result<Value, HandlerError> {
            Ok(job.data.clone())
        }
    }

    fn runtime() -> JobRuntime {
        let queue = Arc::new(JobQueue::new(Arc::new(MemoryStore::new())));
        let mut runtime = JobRuntime::new(queue, Arc::new(RuntimeConfig::default()));
        runtime.register_handler(JobType::WorkflowExecution, Arc::new(Echo));
        runtime
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_only_handled_queues_are_drained() {
        let runtime = runtime();
        assert_eq!(runtime.start_workers().unwrap(), 1);
        assert_eq!(runtime.running_queues(), vec!["workflow-execution"]);

        let queue = runtime.queue().clone();
        let handled = queue
            .enqueue(JobType::WorkflowExecution, json!({"n": 1}), JobOptions::default())
            .unwrap();
        let unhandled = queue
            .enqueue(JobType::AgentExecution, json!({}), JobOptions::default())
            .unwrap();

        let job = queue.wait_for(&handled, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"n": 1})));
        assert_eq!(queue.get_job(&unhandled).unwrap().status, JobStatus::Pending);

        runtime.stop_workers().await;
    }

    #[tokio::test]
    async fn test_start_drains_jobs_enqueued_earlier() {
        let runtime = runtime();
        let queue = runtime.queue().clone();
        let id = queue
            .enqueue(JobType::WorkflowExecution, json!({}), JobOptions::default())
            .unwrap();

        runtime.start_workers().unwrap();
        let job = queue.wait_for(&id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts.len(), 1);

        runtime.stop_workers().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let runtime = runtime();
        assert_eq!(runtime.start_workers().unwrap(), 1);
        assert_eq!(runtime.start_workers().unwrap(), 0);
        assert_eq!(runtime.running_queues().len(), 1);

        runtime.stop_workers().await;
    }

    #[tokio::test]
    async fn test_stop_closes_queue() {
        let runtime = runtime();
        runtime.start_workers().unwrap();
        assert!(runtime.is_running());

        assert_eq!(runtime.stop_workers().await, 0);
        assert!(!runtime.is_running());

        let err = runtime
            .queue()
            .enqueue(JobType::WorkflowExecution, json!({}), JobOptions::default())
            .unwrap_err();
        assert!(matches!(err, QueueError::ShuttingDown));
    }
}
