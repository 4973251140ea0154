//! Persistence collaborator: atomic create/update-by-id and read-by-id for
//! runs, jobs, workflows and webhook records.

pub mod event_log;
pub mod index;
pub mod memory;

pub use event_log::JsonlEventLog;
pub use index::RedbStore;
pub use memory::MemoryStore;

use crate::types::{
    Job, JobId, JobStatus, RunId, Webhook, WebhookEvent, WebhookId, WorkflowDefinition,
    WorkflowId, WorkflowRun,
};
use anyhow::Result;

/// Storage for workflow run records
pub trait RunStore: Send + Sync {
    /// Insert or replace a run by id
    fn save_run(&self, run: &WorkflowRun) -> Result<()>;

    fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>>;

    /// Runs, most recent first, optionally for one workflow
    fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<WorkflowRun>>;
}

/// Storage for queued jobs
pub trait JobStore: Send + Sync {
    /// Insert or replace a job by id
    fn save_job(&self, job: &Job) -> Result<()>;

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>>;

    /// Jobs, oldest first, optionally filtered by status
    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
}

/// Storage for workflow definitions
pub trait WorkflowStore: Send + Sync {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>>;

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;
}

/// Storage for webhooks and their deliveries
pub trait WebhookStore: Send + Sync {
    fn save_webhook(&self, webhook: &Webhook) -> Result<()>;

    fn get_webhook(&self, webhook_id: &WebhookId) -> Result<Option<Webhook>>;

    fn list_webhooks(&self) -> Result<Vec<Webhook>>;

    fn save_webhook_event(&self, event: &WebhookEvent) -> Result<()>;

    fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEvent>>;
}

fn sort_runs(runs: &mut [WorkflowRun]) {
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
}

fn sort_jobs(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}
