use super::{sort_jobs, sort_runs, JobStore, RunStore, WebhookStore, WorkflowStore};
use crate::types::{
    Job, JobId, JobStatus, RunId, Webhook, WebhookEvent, WebhookId, WorkflowDefinition,
    WorkflowId, WorkflowRun,
};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const RUNS_TABLE: JsonTable = TableDefinition::new("runs");
const JOBS_TABLE: JsonTable = TableDefinition::new("jobs");
const WORKFLOWS_TABLE: JsonTable = TableDefinition::new("workflows");
const WEBHOOKS_TABLE: JsonTable = TableDefinition::new("webhooks");
const WEBHOOK_EVENTS_TABLE: JsonTable = TableDefinition::new("webhook_events");

const ALL_TABLES: [JsonTable; 5] = [
    RUNS_TABLE,
    JOBS_TABLE,
    WORKFLOWS_TABLE,
    WEBHOOKS_TABLE,
    WEBHOOK_EVENTS_TABLE,
];

/// Persistent store backed by an embedded redb database.
///
/// Records are stored as JSON under their id; every write is its own
/// transaction, which gives atomic create/update-by-id.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables so read transactions never see a missing table
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        for table in ALL_TABLES {
            write_txn
                .open_table(table)
                .with_context(|| format!("Failed to open {} table", table.name()))?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_vec(value)
            .with_context(|| format!("Failed to serialize {} record", table.name()))?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert record")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn fetch<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get record")? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut records = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            let record = serde_json::from_slice(value.value())
                .context("Failed to deserialize record")?;
            records.push(record);
        }

        Ok(records)
    }
}

impl RunStore for RedbStore {
    fn save_run(&self, run: &WorkflowRun) -> Result<()> {
        self.put(RUNS_TABLE, run.id.as_str(), run)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<WorkflowRun>> {
        self.fetch(RUNS_TABLE, run_id.as_str())
    }

    fn list_runs(&self, workflow_id: Option<&WorkflowId>) -> Result<Vec<WorkflowRun>> {
        let mut runs: Vec<WorkflowRun> = self.scan(RUNS_TABLE)?;
        if let Some(workflow_id) = workflow_id {
            runs.retain(|r| &r.workflow_id == workflow_id);
        }
        sort_runs(&mut runs);
        Ok(runs)
    }
}

impl JobStore for RedbStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        self.put(JOBS_TABLE, job.id.as_str(), job)
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>> {
        self.fetch(JOBS_TABLE, job_id.as_str())
    }

    fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.scan(JOBS_TABLE)?;
        if let Some(status) = status {
            jobs.retain(|j| j.status == status);
        }
        sort_jobs(&mut jobs);
        Ok(jobs)
    }
}

impl WorkflowStore for RedbStore {
    fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.put(WORKFLOWS_TABLE, workflow.id.as_str(), workflow)
    }

    fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<WorkflowDefinition>> {
        self.fetch(WORKFLOWS_TABLE, workflow_id.as_str())
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        self.scan(WORKFLOWS_TABLE)
    }
}

impl WebhookStore for RedbStore {
    fn save_webhook(&self, webhook: &Webhook) -> Result<()> {
        self.put(WEBHOOKS_TABLE, webhook.id.as_str(), webhook)
    }

    fn get_webhook(&self, webhook_id: &WebhookId) -> Result<Option<Webhook>> {
        self.fetch(WEBHOOKS_TABLE, webhook_id.as_str())
    }

    fn list_webhooks(&self) -> Result<Vec<Webhook>> {
        let mut webhooks: Vec<Webhook> = self.scan(WEBHOOKS_TABLE)?;
        webhooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(webhooks)
    }

    fn save_webhook_event(&self, event: &WebhookEvent) -> Result<()> {
        self.put(WEBHOOK_EVENTS_TABLE, &event.id, event)
    }

    fn get_webhook_event(&self, event_id: &str) -> Result<Option<WebhookEvent>> {
        self.fetch(WEBHOOK_EVENTS_TABLE, event_id)
    }
}
