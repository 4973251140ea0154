use super::{sort_jobs, sort_runs, JobStore, RunStore, WebhookStore, WorkflowStore};
use crate::types::{
    Job, JobId, JobStatus, RunId, Webhook, WebhookEvent, WebhookId, WorkflowDefinition,
    WorkflowId, WorkflowRun,
};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Map keyed by record id, guarded for concurrent access
#[derive(Debug)]
struct Table<K, V> {
    rows: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: std::hash::Hash + Eq, V: Clone> Table<K, V> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn put(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: std::hash::Hash + Eq + ?Sized,
    {
        self.read().get(key).cloned()
    }

    fn values(&self) -> Vec<V> {
        self.read().values().cloned().collect()
    }
}

/// In-process store used by tests and ephemeral runtimes
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Table<RunId, WorkflowRun>,
    jobs: Table<JobId, Job>,
    workflows: Table<WorkflowId, WorkflowDefinition>,
    webhooks: Table<WebhookId, Webhook>,
    webhook_events: Table<String, WebhookEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunStore for MemoryStore {
    fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.runs.put(run.id.clone(), run.clone());
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.get(run_id))
    }

    fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<WorkflowRun>> {
        let mut runs = self.runs.values();
        if let Some(workflow_id) = workflow_id {
            runs.retain(|r| &r.workflow_id == workflow_id);
        }
        sort_runs(&mut runs);
        Ok(runs)
    }
}

impl JobStore for MemoryStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        self.jobs.put(job.id.clone(), job.clone());
        Ok(())
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(job_id))
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.values();
        if let Some(status) = status {
            jobs.retain(|j| j.status == status);
        }
        sort_jobs(&mut jobs);
        Ok(jobs)
    }
}

impl WorkflowStore for MemoryStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.workflows.put(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>> {
        Ok(self.workflows.get(workflow_id))
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut workflows = self.workflows.values();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }
}

impl WebhookStore for MemoryStore {
    fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.webhooks.put(webhook.id.clone(), webhook.clone());
        Ok(())
    }

    fn get_webhook(&self, webhook_id: &WebhookId) -> Result<Option<Webhook>> {
        Ok(self.webhooks.get(webhook_id))
    }

    fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut webhooks = self.webhooks.values();
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(webhooks)
    }

    fn save_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        self.webhook_events.put(event.id.clone(), event.clone());
        Ok(())
    }

    fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEvent>> {
        Ok(self.webhook_events.get(event_id))
    }
}
