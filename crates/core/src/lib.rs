// Core orchestration for Weft: node registry, DAG engine, job queue

pub mod types;
pub mod error;
pub mod config;
pub mod node;
pub mod workflow;
pub mod execution;
pub mod queue;
pub mod webhook;
pub mod scheduler;
pub mod events;
pub mod storage;

pub use config::RuntimeConfig;
pub use error::{EngineError, HandlerError, QueueError, RegistryError, WebhookError};
pub use execution::ExecutionManager;
pub use node::{ExecutionContext, ExecutionResult, NodeRegistry};
pub use queue::{JobQueue, JobRuntime};
pub use scheduler::WorkflowScheduler;
pub use types::*;
pub use webhook::WebhookService;
pub use workflow::{RunOutcome, RunRequest, WorkflowEngine};
