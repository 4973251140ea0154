use super::dag::WorkflowDag;
use crate::error::EngineError;
use crate::events::{Event, EventLog, EventType};
use crate::execution::ExecutionManager;
use crate::node::{ExecutionContext, ExecutionResult, NodeInstance, NodeRegistry};
use crate::storage::RunStore;
use crate::types::{RunId, RunStatus, WorkflowDefinition, WorkflowNode, WorkflowRun};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A request to run one workflow
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow: WorkflowDefinition,
    pub input: Value,
    /// Run id to use; a fresh one is generated when absent
    pub run_id: Option<RunId>,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    /// Parent token, e.g. a job's; the run is cancelled when it is
    pub cancellation: Option<CancellationToken>,
}

impl RunRequest {
    pub fn new(workflow: WorkflowDefinition, input: Value) -> Self {
        Self {
            workflow,
            input,
            run_id: None,
            user_id: None,
            agent_id: None,
            session_id: None,
            cancellation: None,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>, session_id: Option<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self.session_id = session_id;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Terminal result of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub output: Option<Value>,
    /// Failing node's message; never set for cancelled runs
    pub error: Option<String>,
    pub failed_node: Option<String>,
    pub duration_ms: u64,
    /// Nodes that completed successfully, in execution order
    pub executed_nodes: Vec<String>,
    pub node_results: HashMap<String, ExecutionResult>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// How traversal stopped
enum Halt {
    Failed { node_id: String, error: String },
    Cancelled,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Marks a run failed when `execute` is dropped before recording an outcome,
/// e.g. when its job is aborted at shutdown
struct UnfinishedRun {
    runs: Arc<dyn RunStore>,
    run: Option<WorkflowRun>,
    started: Instant,
}

impl UnfinishedRun {
    fn disarm(&mut self) {
        self.run = None;
    }
}

impl Drop for UnfinishedRun {
    fn drop(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };

        tracing::warn!("Run {} abandoned before completion", run.id);
        run.status = RunStatus::Failed;
        run.error = Some("run abandoned before completion".to_string());
        run.completed_at = Some(Utc::now());
        run.duration_ms = Some(elapsed_ms(self.started));
        if let Err(e) = self.runs.save_run(&run) {
            tracing::error!("Failed to record abandoned run {}: {:#}", run.id, e);
        }
    }
}

/// Walks a workflow graph node by node in topological order
pub struct WorkflowEngine {
    registry: Arc<NodeRegistry>,
    executions: Arc<ExecutionManager>,
    runs: Arc<dyn RunStore>,
    event_log: Arc<dyn EventLog>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<NodeRegistry>,
        executions: Arc<ExecutionManager>,
        runs: Arc<dyn RunStore>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            registry,
            executions,
            runs,
            event_log,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn executions(&self) -> &Arc<ExecutionManager> {
        &self.executions
    }

    /// Execute a workflow to a terminal state.
    ///
    /// Returns `Err` only when the definition is invalid (before any node
    /// runs) or persistence fails. Node failures, unknown node types and
    /// cancellation are reported through the outcome's status.
    pub async fn execute(&self, request: RunRequest) -> Result<RunOutcome, EngineError> {
        let dag = WorkflowDag::from_workflow(&request.workflow)?;

        let run_id = request.run_id.clone().unwrap_or_else(RunId::generate);
        let workflow_id = request.workflow.id.clone();
        let started = Instant::now();

        let token = match &request.cancellation {
            Some(parent) => self.executions.register_with_token(
                run_id.clone(),
                workflow_id.clone(),
                parent.child_token(),
            ),
            None => self.executions.register(run_id.clone(), workflow_id.clone()),
        };
        let _registration = self.executions.guard(run_id.clone());

        tracing::info!(
            "Starting workflow execution: run_id={}, workflow_id={}",
            run_id,
            workflow_id
        );

        let mut run = WorkflowRun {
            id: run_id.clone(),
            workflow_id: workflow_id.clone(),
            status: RunStatus::Running,
            input: request.input.clone(),
            output: None,
            error: None,
            failed_node: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.runs.save_run(&run)?;
        let mut unfinished = UnfinishedRun {
            runs: self.runs.clone(),
            run: Some(run.clone()),
            started,
        };
        self.event_log
            .append(Event::new(
                run_id.clone(),
                EventType::RunStarted {
                    workflow_id: workflow_id.clone(),
                },
            ))
            .await?;

        let mut node_outputs: HashMap<String, Value> = HashMap::new();
        let mut node_results: HashMap<String, ExecutionResult> = HashMap::new();
        let mut executed_nodes: Vec<String> = Vec::new();
        let mut output_node: Option<String> = None;

        let mut halt = None;
        for node in dag.topological_order() {
            if token.is_cancelled() || self.executions.is_cancelled(&run_id) {
                halt = Some(Halt::Cancelled);
                break;
            }

            let result = self
                .execute_node(&dag, node, &request, &run_id, &token, &node_outputs)
                .await;

            match result {
                Ok(result) => {
                    node_outputs.insert(
                        node.id.clone(),
                        result.output.clone().unwrap_or(Value::Null),
                    );
                    node_results.insert(node.id.clone(), result);
                    executed_nodes.push(node.id.clone());
                    if node.output {
                        output_node = Some(node.id.clone());
                    }
                }
                Err((error, result)) => {
                    if let Some(result) = result {
                        node_results.insert(node.id.clone(), result);
                    }
                    // A node aborted by the run's token is a cancellation, not a failure
                    halt = Some(if token.is_cancelled() {
                        Halt::Cancelled
                    } else {
                        Halt::Failed {
                            node_id: node.id.clone(),
                            error,
                        }
                    });
                    break;
                }
            }
        }

        let duration_ms = elapsed_ms(started);
        let mut outcome = RunOutcome {
            run_id: run_id.clone(),
            status: RunStatus::Completed,
            output: None,
            error: None,
            failed_node: None,
            duration_ms,
            executed_nodes,
            node_results,
        };

        let terminal_event = match halt {
            None => {
                let output_node = output_node.or_else(|| outcome.executed_nodes.last().cloned());
                outcome.output = output_node.and_then(|id| node_outputs.remove(&id));

                tracing::info!(
                    "Workflow execution completed: run_id={}, nodes={}, duration_ms={}",
                    run_id,
                    outcome.executed_nodes.len(),
                    duration_ms
                );
                EventType::RunCompleted { duration_ms }
            }
            Some(Halt::Failed { node_id, error }) => {
                tracing::error!(
                    "Workflow execution failed: run_id={}, node={}, error={}",
                    run_id,
                    node_id,
                    error
                );
                outcome.status = RunStatus::Failed;
                outcome.error = Some(error.clone());
                outcome.failed_node = Some(node_id.clone());
                EventType::RunFailed {
                    error,
                    failed_node: Some(node_id),
                    duration_ms,
                }
            }
            Some(Halt::Cancelled) => {
                tracing::warn!(
                    "Workflow execution cancelled: run_id={}, completed_nodes={}",
                    run_id,
                    outcome.executed_nodes.len()
                );
                outcome.status = RunStatus::Cancelled;
                EventType::RunCancelled {
                    executed_nodes: outcome.executed_nodes.len(),
                }
            }
        };

        run.status = outcome.status;
        run.output = outcome.output.clone();
        run.error = outcome.error.clone();
        run.failed_node = outcome.failed_node.clone();
        run.completed_at = Some(Utc::now());
        run.duration_ms = Some(duration_ms);
        self.runs.save_run(&run)?;
        unfinished.disarm();
        self.event_log
            .append(Event::new(run_id, terminal_event))
            .await?;

        Ok(outcome)
    }

    /// Resolve, configure and invoke one node.
    ///
    /// On failure returns the error message and, when the node was invoked,
    /// its result.
    async fn execute_node(
        &self,
        dag: &WorkflowDag,
        node: &WorkflowNode,
        request: &RunRequest,
        run_id: &RunId,
        token: &CancellationToken,
        node_outputs: &HashMap<String, Value>,
    ) -> Result<ExecutionResult, (String, Option<ExecutionResult>)> {
        let resolved = self.registry.resolve(&node.node_type).map_err(|_| {
            let error = EngineError::NodeNotFound {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            };
            (error.to_string(), None)
        })?;

        let config = resolved.definition.resolve_config(&node.config).map_err(|missing| {
            let error = EngineError::NodeExecution {
                node_id: node.id.clone(),
                message: format!("missing required parameter '{}'", missing),
            };
            (error.to_string(), None)
        })?;

        let input = assemble_input(dag, node, config.clone(), &request.input, node_outputs);
        let instance = NodeInstance {
            id: node.id.clone(),
            node_type: resolved.definition.id.clone(),
            config: Value::Object(config),
        };
        let ctx = ExecutionContext {
            run_id: run_id.clone(),
            node_id: node.id.clone(),
            input,
            node_outputs: Arc::new(node_outputs.clone()),
            user_id: request.user_id.clone(),
            agent_id: request.agent_id.clone(),
            session_id: request.session_id.clone(),
            cancellation: token.clone(),
        };

        tracing::debug!("Executing node {} ({}) in run {}", node.id, instance.node_type, run_id);
        self.append_event(
            run_id,
            EventType::NodeStarted {
                node_id: node.id.clone(),
                node_type: instance.node_type.clone(),
            },
        )
        .await;

        let result = resolved.handle.execute(&instance, &ctx).await;

        if result.success {
            self.append_event(
                run_id,
                EventType::NodeCompleted {
                    node_id: node.id.clone(),
                    duration_ms: result.duration_ms,
                },
            )
            .await;
            Ok(result)
        } else {
            let error = result.error.clone().unwrap_or_default();
            self.append_event(
                run_id,
                EventType::NodeFailed {
                    node_id: node.id.clone(),
                    error: error.clone(),
                    duration_ms: result.duration_ms,
                },
            )
            .await;
            Err((error, Some(result)))
        }
    }

    /// Node-level events are best effort; the run records carry the outcome
    async fn append_event(&self, run_id: &RunId, event_type: EventType) {
        if let Err(e) = self
            .event_log
            .append(Event::new(run_id.clone(), event_type))
            .await
        {
            tracing::warn!("Failed to append event for run {}: {:#}", run_id, e);
        }
    }
}

/// Build a node's input: resolved config, then the run input for entry nodes
/// or each predecessor's output in visit order (later keys overwrite earlier).
fn assemble_input(
    dag: &WorkflowDag,
    node: &WorkflowNode,
    config: Map<String, Value>,
    run_input: &Value,
    node_outputs: &HashMap<String, Value>,
) -> Value {
    let mut input = config;

    if dag.is_entry(&node.id) {
        merge_into(&mut input, "input", run_input);
    } else {
        for predecessor in dag.predecessors(&node.id) {
            if let Some(output) = node_outputs.get(&predecessor.id) {
                merge_into(&mut input, &predecessor.id, output);
            }
        }
    }

    Value::Object(input)
}

/// Shallow-merge an object; anything else except null lands under `key`
fn merge_into(target: &mut Map<String, Value>, key: &str, value: &Value) {
    match value {
        Value::Object(fields) => {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        Value::Null => {}
        other => {
            target.insert(key.to_string(), other.clone());
        }
    }
}
