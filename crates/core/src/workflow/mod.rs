pub mod dag;
pub mod engine;

pub use dag::WorkflowDag;
pub use engine::{RunOutcome, RunRequest, WorkflowEngine};
