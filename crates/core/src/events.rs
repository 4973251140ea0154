use crate::types::{RunId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// An event in a run's event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            timestamp: Utc::now(),
            event_type,
        }
    }
}

/// Types of events recorded while a run executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_id: WorkflowId,
    },
    RunCompleted {
        duration_ms: u64,
    },
    RunFailed {
        error: String,
        failed_node: Option<String>,
        duration_ms: u64,
    },
    RunCancelled {
        executed_nodes: usize,
    },

    // Node lifecycle events
    NodeStarted {
        node_id: String,
        node_type: String,
    },
    NodeCompleted {
        node_id: String,
        duration_ms: u64,
    },
    NodeFailed {
        node_id: String,
        error: String,
        duration_ms: u64,
    },
}

impl EventType {
    /// Whether this event closes the run's log
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run, oldest first
    async fn get_run_events(&self, run_id: &RunId) -> anyhow::Result<Vec<Event>>;
}

/// Event log kept in process memory
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, event: Event) -> anyhow::Result<()> {
        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.run_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: &RunId) -> anyhow::Result<Vec<Event>> {
        Ok(self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_tagging() {
        let event = EventType::NodeFailed {
            node_id: "b".to_string(),
            error: "boom".to_string(),
            duration_ms: 4,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_failed");
        assert_eq!(json["node_id"], "b");
        assert!(!event.is_terminal());
        assert!(EventType::RunCancelled { executed_nodes: 0 }.is_terminal());
    }

    #[tokio::test]
    async fn test_memory_log_keeps_runs_apart() {
        let log = MemoryEventLog::new();
        let r1 = RunId::new("r1");
        let r2 = RunId::new("r2");

        log.append(Event::new(
            r1.clone(),
            EventType::RunStarted {
                workflow_id: WorkflowId::new("wf"),
            },
        ))
        .await
        .unwrap();
        log.append(Event::new(r1.clone(), EventType::RunCompleted { duration_ms: 1 }))
            .await
            .unwrap();
        log.append(Event::new(r2.clone(), EventType::RunCancelled { executed_nodes: 0 }))
            .await
            .unwrap();

        let events = log.get_run_events(&r1).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event_type, EventType::RunStarted { .. }));
        assert_eq!(log.get_run_events(&r2).await.unwrap().len(), 1);
        assert!(log.get_run_events(&RunId::new("r3")).await.unwrap().is_empty());
    }
}
