use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use weft_core::{
    events::{Event, EventLog},
    node::NodeDefinition,
    queue::QueueStats,
    storage::{RunStore, WorkflowStore},
    webhook::WebhookReceipt,
    workflow::WorkflowDag,
    Job, JobId, JobOptions, JobType, RunId, Webhook, WebhookId, WorkflowDefinition, WorkflowId,
    WorkflowRun,
};

/// List registered node types
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Vec<NodeDefinition>> {
    let definitions = state
        .registry
        .definitions()
        .into_iter()
        .map(|definition| definition.as_ref().clone())
        .collect();
    Json(definitions)
}

/// Store a workflow definition after checking it forms a DAG
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(workflow): Json<WorkflowDefinition>,
) -> ApiResult<Json<WorkflowDefinition>> {
    WorkflowDag::from_workflow(&workflow)?;
    state.store.save_workflow(&workflow)?;

    tracing::info!("Saved workflow {} ({} nodes)", workflow.id, workflow.nodes.len());
    Ok(Json(workflow))
}

pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    Ok(Json(state.store.list_workflows()?))
}

pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let workflow = state
        .store
        .get_workflow(&WorkflowId::new(workflow_id.clone()))?
        .ok_or_else(|| ApiError::not_found(format!("workflow {} not found", workflow_id)))?;
    Ok(Json(workflow))
}

#[derive(Debug, Default, Deserialize)]
pub struct RunWorkflowRequest {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub options: JobOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueuedResponse {
    pub job_id: JobId,
}

/// Enqueue a `workflow-execution` job; the run happens on a worker
pub async fn run_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(request): Json<RunWorkflowRequest>,
) -> ApiResult<(StatusCode, Json<EnqueuedResponse>)> {
    let workflow_id = WorkflowId::new(workflow_id);
    if state.store.get_workflow(&workflow_id)?.is_none() {
        return Err(ApiError::not_found(format!("workflow {} not found", workflow_id)));
    }

    let job_id = state.queue.enqueue(
        JobType::WorkflowExecution,
        serde_json::json!({
            "workflowId": workflow_id,
            "input": request.input,
        }),
        request.options,
    )?;

    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { job_id })))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<WorkflowRun>> {
    let run = state
        .store
        .get_run(&RunId::new(run_id.clone()))?
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))?;
    Ok(Json(run))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRunEventsResponse {
    pub events: Vec<Event>,
}

pub async fn get_run_events(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<GetRunEventsResponse>> {
    let events = state.event_log.get_run_events(&RunId::new(run_id)).await?;
    Ok(Json(GetRunEventsResponse { events }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Signal cancellation to an in-flight run; unknown runs report `false`
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Json<CancelResponse> {
    let cancelled = state.executions.cancel(&RunId::new(run_id));
    Json(CancelResponse { cancelled })
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Job>> {
    Ok(Json(state.queue.get_job(&JobId::new(job_id))?))
}

pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.queue.cancel_job(&JobId::new(job_id))?;
    Ok(Json(CancelResponse { cancelled }))
}

pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
) -> ApiResult<Json<QueueStats>> {
    Ok(Json(state.queue.stats(&queue)?))
}

pub async fn list_webhooks(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Webhook>>> {
    Ok(Json(state.webhooks.list_webhooks()?))
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookRequest {
    pub workflow_id: String,
    pub name: String,
    pub secret: Option<String>,
}

pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateWebhookRequest>,
) -> ApiResult<Json<Webhook>> {
    let webhook = state
        .webhooks
        .create_webhook(WorkflowId::new(req.workflow_id), req.name, req.secret)?;
    Ok(Json(webhook))
}

/// Inbound delivery; answers once the event is recorded and queued
pub async fn deliver_webhook(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<WebhookReceipt>)> {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let receipt = state
        .webhooks
        .process_webhook(&WebhookId::new(webhook_id), payload, headers)?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn test_webhook(
    State(state): State<Arc<AppState>>,
    Path(webhook_id): Path<String>,
) -> ApiResult<(StatusCode, Json<WebhookReceipt>)> {
    let receipt = state.webhooks.test_webhook(&WebhookId::new(webhook_id))?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
