use crate::error::{EngineError, HandlerError};
use crate::storage::{WebhookStore, WorkflowStore};
use crate::types::{Job, JobId, JobType, RunId, RunStatus, WorkflowId};
use crate::workflow::{RunOutcome, RunRequest, WorkflowEngine};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Per-attempt context handed to a job handler
#[derive(Debug)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    /// 1-based attempt number
    pub attempt: u32,
    /// Cancelled when the job is cancelled
    pub cancellation: CancellationToken,
    run_id: Mutex<Option<RunId>>,
}

impl JobContext {
    pub fn new(job: &Job, attempt: u32, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            attempt,
            cancellation,
            run_id: Mutex::new(None),
        }
    }

    /// Note the workflow run this attempt started; stored on the attempt record
    pub fn record_run(&self, run_id: RunId) {
        *self.run_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(run_id);
    }

    pub fn recorded_run(&self) -> Option<RunId> {
        self.run_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Processes jobs of one queue
#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value, HandlerError>;
}

fn parse_data<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, HandlerError> {
    serde_json::from_value(job.data.clone())
        .map_err(|e| HandlerError::fatal(format!("invalid {} job data: {}", job.job_type, e)))
}

/// Load a workflow and run it under the job's token
async fn run_workflow(
    engine: &WorkflowEngine,
    workflows: &dyn WorkflowStore,
    workflow_id: &WorkflowId,
    input: Value,
    run_id: RunId,
    ctx: &JobContext,
) -> Result<RunOutcome, HandlerError> {
    let workflow = workflows
        .get_workflow(workflow_id)?
        .ok_or_else(|| HandlerError::fatal(format!("workflow {} not found", workflow_id)))?;

    ctx.record_run(run_id.clone());
    let request = RunRequest::new(workflow, input)
        .with_run_id(run_id)
        .with_cancellation(ctx.cancellation.clone());

    let outcome = engine.execute(request).await.map_err(|e| match e {
        e if e.is_definition_error() => HandlerError::fatal(e.to_string()),
        EngineError::Storage(e) => HandlerError::retryable(format!("{:#}", e)),
        e => HandlerError::retryable(e.to_string()),
    })?;

    match outcome.status {
        RunStatus::Completed => Ok(outcome),
        RunStatus::Cancelled => Err(HandlerError::Cancelled),
        _ => Err(HandlerError::retryable(format!(
            "run {} failed at node {}: {}",
            outcome.run_id,
            outcome.failed_node.as_deref().unwrap_or("unknown"),
            outcome.error.as_deref().unwrap_or("unknown error")
        ))),
    }
}

/// First attempt may use a caller-chosen run id; retries get fresh ones
fn attempt_run_id(requested: Option<RunId>, ctx: &JobContext) -> RunId {
    match requested {
        Some(run_id) if ctx.attempt == 1 => run_id,
        _ => RunId::generate(),
    }
}

#[derive(Debug, Deserialize)]
struct WorkflowJobData {
    #[serde(alias = "workflowId")]
    workflow_id: WorkflowId,
    #[serde(default)]
    input: Value,
    #[serde(default, alias = "runId")]
    run_id: Option<RunId>,
}

/// Runs a workflow; serves `workflow-execution` and `scheduled-workflow`
pub struct WorkflowJobHandler {
    engine: Arc<WorkflowEngine>,
    workflows: Arc<dyn WorkflowStore>,
}

impl WorkflowJobHandler {
    pub fn new(engine: Arc<WorkflowEngine>, workflows: Arc<dyn WorkflowStore>) -> Self {
        Self { engine, workflows }
    }
}

#[async_trait::async_trait]
impl JobHandler for WorkflowJobHandler {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value, HandlerError> {
        let data: WorkflowJobData = parse_data(job)?;
        let run_id = attempt_run_id(data.run_id, ctx);

        let outcome = run_workflow(
            &self.engine,
            self.workflows.as_ref(),
            &data.workflow_id,
            data.input,
            run_id,
            ctx,
        )
        .await?;

        Ok(json!({
            "run_id": outcome.run_id,
            "output": outcome.output,
            "duration_ms": outcome.duration_ms,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct WebhookJobData {
    #[serde(alias = "eventId")]
    event_id: String,
}

/// Runs the workflow bound to a webhook with the delivered payload
pub struct WebhookJobHandler {
    engine: Arc<WorkflowEngine>,
    workflows: Arc<dyn WorkflowStore>,
    webhooks: Arc<dyn WebhookStore>,
}

impl WebhookJobHandler {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        workflows: Arc<dyn WorkflowStore>,
        webhooks: Arc<dyn WebhookStore>,
    ) -> Self {
        Self {
            engine,
            workflows,
            webhooks,
        }
    }
}

#[async_trait::async_trait]
impl JobHandler for WebhookJobHandler {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value, HandlerError> {
        let data: WebhookJobData = parse_data(job)?;

        let mut event = self
            .webhooks
            .get_webhook_event(&data.event_id)?
            .ok_or_else(|| HandlerError::fatal(format!("webhook event {} not found", data.event_id)))?;
        let webhook = self
            .webhooks
            .get_webhook(&event.webhook_id)?
            .ok_or_else(|| HandlerError::fatal(format!("webhook {} not found", event.webhook_id)))?;

        let outcome = run_workflow(
            &self.engine,
            self.workflows.as_ref(),
            &webhook.workflow_id,
            event.payload.clone(),
            RunId::generate(),
            ctx,
        )
        .await?;

        event.processed = true;
        event.run_id = Some(outcome.run_id.clone());
        self.webhooks.save_webhook_event(&event)?;

        Ok(json!({
            "event_id": event.id,
            "run_id": outcome.run_id,
            "output": outcome.output,
        }))
    }
}

/// Agent state machine collaborator behind `agent-execution` jobs
#[async_trait::async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        input: Value,
        cancellation: CancellationToken,
    ) -> anyhow::Result<Value>;
}

#[derive(Debug, Deserialize)]
struct AgentJobData {
    #[serde(alias = "agentId")]
    agent_id: String,
    #[serde(default, alias = "sessionId")]
    session_id: Option<String>,
    #[serde(default)]
    input: Value,
}

/// Delegates `agent-execution` jobs to an [`AgentRunner`]
pub struct AgentJobHandler {
    runner: Arc<dyn AgentRunner>,
}

impl AgentJobHandler {
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait::async_trait]
impl JobHandler for AgentJobHandler {
    async fn handle(&self, job: &Job, ctx: &JobContext) -> Result<Value, HandlerError> {
        let data: AgentJobData = parse_data(job)?;
        if data.agent_id.is_empty() {
            return Err(HandlerError::fatal("agent job without agent_id"));
        }

        let result = self
            .runner
            .run(
                &data.agent_id,
                data.session_id.as_deref(),
                data.input,
                ctx.cancellation.clone(),
            )
            .await;

        match result {
            Ok(output) => Ok(output),
            Err(_) if ctx.cancellation.is_cancelled() => Err(HandlerError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}
