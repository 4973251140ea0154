//! Process-wide registry of in-flight runs and their cancellation tokens.

use crate::types::{RunId, WorkflowId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// State tracked for one in-flight run
#[derive(Debug, Clone)]
pub struct RunningExecution {
    pub run_id: RunId,
    pub workflow_id: WorkflowId,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub token: CancellationToken,
    registered_at: Instant,
}

/// Holder and issuer of run cancellation tokens.
///
/// Independent of the job queue so synchronously triggered runs can be
/// cancelled too. Lookups take a shared lock; register/unregister serialize.
#[derive(Default)]
pub struct ExecutionManager {
    runs: RwLock<HashMap<RunId, RunningExecution>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RunId, RunningExecution>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RunId, RunningExecution>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a run and return its token.
    ///
    /// A run that is already registered keeps its existing token, so a caller
    /// may pre-register (and even cancel) a run before the engine starts it.
    pub fn register(&self, run_id: RunId, workflow_id: WorkflowId) -> CancellationToken {
        self.register_with_token(run_id, workflow_id, CancellationToken::new())
    }

    /// Register a run with a caller-supplied token, e.g. a child of a job token
    pub fn register_with_token(
        &self,
        run_id: RunId,
        workflow_id: WorkflowId,
        token: CancellationToken,
    ) -> CancellationToken {
        let mut runs = self.write();
        if let Some(existing) = runs.get(&run_id) {
            return existing.token.clone();
        }

        tracing::debug!("Registered run {} for workflow {}", run_id, workflow_id);
        runs.insert(
            run_id.clone(),
            RunningExecution {
                run_id,
                workflow_id,
                started_at: Utc::now(),
                cancelled: token.is_cancelled(),
                token: token.clone(),
                registered_at: Instant::now(),
            },
        );
        token
    }

    /// Cancel a run. Returns `true` for any known run, including one already
    /// cancelled, and `false` when the run is not registered.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        let mut runs = self.write();
        let Some(execution) = runs.get_mut(run_id) else {
            return false;
        };

        if !execution.cancelled {
            execution.cancelled = true;
            execution.token.cancel();
            tracing::info!("Cancellation signal sent for run {}", run_id);
        }
        true
    }

    pub fn is_cancelled(&self, run_id: &RunId) -> bool {
        self.read()
            .get(run_id)
            .map(|e| e.cancelled || e.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Remove a finished run; returns whether it was registered
    pub fn unregister(&self, run_id: &RunId) -> bool {
        self.write().remove(run_id).is_some()
    }

    pub fn get(&self, run_id: &RunId) -> Option<RunningExecution> {
        self.read().get(run_id).cloned()
    }

    pub fn active_runs(&self) -> Vec<RunningExecution> {
        let mut runs: Vec<_> = self.read().values().cloned().collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drop entries registered longer ago than `max_age`
    pub fn reap_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut runs = self.write();
        let before = runs.len();
        runs.retain(|_, e| now.duration_since(e.registered_at) < max_age);
        let reaped = before - runs.len();

        if reaped > 0 {
            tracing::warn!("Reaped {} stale run registrations", reaped);
        }
        reaped
    }

    /// Start the periodic stale-entry reaper, replacing any running one
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, stale_after: Duration) {
        let manager: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.reap_stale(stale_after);
            }
        });

        let mut reaper = self.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = reaper.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the reaper and cancel every remaining run
    pub fn shutdown(&self) {
        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        let mut runs = self.write();
        for execution in runs.values() {
            execution.token.cancel();
        }
        if !runs.is_empty() {
            tracing::info!("Cancelled {} runs during shutdown", runs.len());
        }
        runs.clear();
    }

    /// Registration that unregisters itself when dropped
    pub fn guard(self: &Arc<Self>, run_id: RunId) -> RegistrationGuard {
        RegistrationGuard {
            manager: self.clone(),
            run_id,
        }
    }
}

/// Unregisters its run on drop, including when the owning future is dropped mid-run
pub struct RegistrationGuard {
    manager: Arc<ExecutionManager>,
    run_id: RunId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(manager: &ExecutionManager, id: &str) -> CancellationToken {
        manager.register(RunId::new(id), WorkflowId::new("wf"))
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let manager = ExecutionManager::new();
        let token = register(&manager, "r1");

        assert!(manager.cancel(&RunId::new("r1")));
        assert!(manager.cancel(&RunId::new("r1")));
        assert!(token.is_cancelled());
        assert!(manager.is_cancelled(&RunId::new("r1")));
    }

    #[test]
    fn test_cancel_unknown_run() {
        let manager = ExecutionManager::new();
        assert!(!manager.cancel(&RunId::new("missing")));
        assert!(!manager.is_cancelled(&RunId::new("missing")));
    }

    #[test]
    fn test_register_reuses_existing_token() {
        let manager = ExecutionManager::new();
        let first = register(&manager, "r1");
        manager.cancel(&RunId::new("r1"));

        let second = register(&manager, "r1");
        assert!(second.is_cancelled());
        assert!(first.is_cancelled());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_register_with_parent_token() {
        let manager = ExecutionManager::new();
        let parent = CancellationToken::new();
        let token = manager.register_with_token(
            RunId::new("r1"),
            WorkflowId::new("wf"),
            parent.child_token(),
        );

        parent.cancel();
        assert!(token.is_cancelled());
        assert!(manager.is_cancelled(&RunId::new("r1")));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let manager = Arc::new(ExecutionManager::new());
        register(&manager, "r1");

        assert!(manager.unregister(&RunId::new("r1")));
        assert!(!manager.unregister(&RunId::new("r1")));

        register(&manager, "r2");
        {
            let _guard = manager.guard(RunId::new("r2"));
        }
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_stale_entries() {
        let manager = ExecutionManager::new();
        register(&manager, "old");
        tokio::time::advance(Duration::from_secs(3_000)).await;
        register(&manager, "new");
        tokio::time::advance(Duration::from_secs(700)).await;

        assert_eq!(manager.reap_stale(Duration::from_secs(3_600)), 1);
        assert!(manager.get(&RunId::new("old")).is_none());
        assert!(manager.get(&RunId::new("new")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_reaper() {
        let manager = Arc::new(ExecutionManager::new());
        register(&manager, "r1");
        manager.spawn_reaper(Duration::from_secs(1_800), Duration::from_secs(3_600));

        tokio::time::sleep(Duration::from_secs(1_801)).await;
        assert_eq!(manager.len(), 1, "entry is only 30 minutes old");

        tokio::time::sleep(Duration::from_secs(1_800)).await;
        assert!(manager.is_empty());

        manager.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_remaining_runs() {
        let manager = ExecutionManager::new();
        let token = register(&manager, "r1");

        manager.shutdown();
        assert!(token.is_cancelled());
        assert!(manager.is_empty());
    }
}
