//! Error taxonomy for the orchestration core.

use crate::types::{JobId, RunId, WebhookId, WorkflowId};

/// Errors raised by the workflow engine.
///
/// Node-level failures never escape as `Err`; they are folded into a failed
/// [`RunOutcome`](crate::workflow::RunOutcome). These variants describe why a
/// run failed or could not start.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The edge set contains a cycle.
    #[error("workflow {workflow_id} contains a cycle")]
    CyclicGraph { workflow_id: String },

    /// Structural problem found while building the graph.
    #[error("invalid workflow {workflow_id}: {reason}")]
    InvalidWorkflow { workflow_id: String, reason: String },

    /// A node references a type the registry cannot resolve.
    #[error("node {node_id}: node type '{node_type}' not found")]
    NodeNotFound { node_id: String, node_type: String },

    /// A node returned `success: false`, panicked, or failed validation.
    #[error("node {node_id} failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// The run was stopped cooperatively.
    #[error("run {0} was cancelled")]
    Cancelled(RunId),

    /// The persistence collaborator failed.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the error is a property of the definition rather than of one execution.
    pub fn is_definition_error(&self) -> bool {
        matches!(self, Self::CyclicGraph { .. } | Self::InvalidWorkflow { .. })
    }
}

/// Errors raised by the node registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node '{0}' not found")]
    NotFound(String),

    #[error("invalid node definition '{id}': {reason}")]
    InvalidDefinition { id: String, reason: String },

    #[error("plugin '{name}' failed to load: {reason}")]
    LoadFailed { name: String, reason: String },
}

/// Errors raised by the job queue layer.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {job_id} failed after {attempts} attempts: {last_error}")]
    JobRetryExhausted {
        job_id: JobId,
        attempts: u32,
        last_error: String,
    },

    #[error("job {0} not found")]
    UnknownJob(JobId),

    #[error("no queue named '{0}'")]
    QueueNotFound(String),

    #[error("queue is shutting down")]
    ShuttingDown,

    #[error("job wait timed out")]
    WaitTimeout,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Outcome of a job handler that did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the queue retries while attempts remain.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; remaining retries are skipped.
    #[error("{0}")]
    Fatal(String),

    /// The work was cancelled; the job ends as `cancelled`.
    #[error("cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(format!("{:#}", err))
    }
}

/// Errors raised by webhook ingestion.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook {0} not found")]
    NotFound(WebhookId),

    #[error("webhook {0} is inactive")]
    Inactive(WebhookId),

    #[error("workflow {0} not found")]
    UnknownWorkflow(WorkflowId),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_messages_name_the_node() {
        let err = EngineError::NodeNotFound {
            node_id: "fetch".to_string(),
            node_type: "http-request".to_string(),
        };
        assert_eq!(err.to_string(), "node fetch: node type 'http-request' not found");
        assert!(!err.is_definition_error());

        let err = EngineError::CyclicGraph {
            workflow_id: "wf".to_string(),
        };
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_retry_exhausted_message() {
        let err = QueueError::JobRetryExhausted {
            job_id: JobId::new("j1"),
            attempts: 3,
            last_error: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "job j1 failed after 3 attempts: boom");
    }

    #[test]
    fn test_anyhow_into_handler_error_is_retryable() {
        let err: HandlerError = anyhow::anyhow!("db down").into();
        assert!(matches!(err, HandlerError::Retryable(ref m) if m == "db down"));
    }
}
