use crate::error::QueueError;
use crate::queue::JobQueue;
use crate::types::{JobId, JobOptions, JobType, WorkflowId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A workflow triggered on a cron schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSchedule {
    pub id: String,
    pub workflow_id: WorkflowId,
    /// Seconds-resolution cron expression, e.g. `0 */15 * * * *`
    pub cron: String,
    pub input: Value,
    pub enabled: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

struct Entry {
    schedule: WorkflowSchedule,
    cron: CronSchedule,
}

impl Entry {
    fn advance(&mut self, after: DateTime<Utc>) {
        self.schedule.next_run = self.cron.after(&after).next();
    }
}

/// Cron scheduler for recurring workflows.
///
/// Due schedules become `scheduled-workflow` jobs; the scheduler never runs
/// a workflow itself.
pub struct WorkflowScheduler {
    queue: Arc<JobQueue>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl WorkflowScheduler {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            queue,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an enabled schedule
    pub fn add_schedule(
        &self,
        workflow_id: WorkflowId,
        cron: &str,
        input: Value,
    ) -> Result<WorkflowSchedule> {
        let parsed = CronSchedule::from_str(cron)
            .with_context(|| format!("Invalid cron expression '{}'", cron))?;

        let now = Utc::now();
        let mut entry = Entry {
            schedule: WorkflowSchedule {
                id: uuid::Uuid::new_v4().to_string(),
                workflow_id,
                cron: cron.to_string(),
                input,
                enabled: true,
                next_run: None,
                last_run: None,
                created_at: now,
            },
            cron: parsed,
        };
        entry.advance(now);

        let schedule = entry.schedule.clone();
        tracing::info!(
            "Scheduled workflow {} ({}), next run {:?}",
            schedule.workflow_id,
            schedule.cron,
            schedule.next_run
        );
        self.entries().insert(schedule.id.clone(), entry);
        Ok(schedule)
    }

    pub fn remove_schedule(&self, schedule_id: &str) -> bool {
        self.entries().remove(schedule_id).is_some()
    }

    pub fn get_schedule(&self, schedule_id: &str) -> Option<WorkflowSchedule> {
        self.entries().get(schedule_id).map(|e| e.schedule.clone())
    }

    /// All schedules, oldest first
    pub fn list_schedules(&self) -> Vec<WorkflowSchedule> {
        let mut schedules: Vec<WorkflowSchedule> =
            self.entries().values().map(|e| e.schedule.clone()).collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        schedules
    }

    /// Enable or disable a schedule. Re-enabling skips runs missed meanwhile.
    pub fn set_enabled(&self, schedule_id: &str, enabled: bool) -> Result<WorkflowSchedule> {
        let mut entries = self.entries();
        let entry = entries
            .get_mut(schedule_id)
            .ok_or_else(|| anyhow::anyhow!("Schedule not found: {}", schedule_id))?;

        if enabled && !entry.schedule.enabled {
            entry.advance(Utc::now());
        }
        entry.schedule.enabled = enabled;
        Ok(entry.schedule.clone())
    }

    /// Enabled schedules whose next run is at or before `now`
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Vec<WorkflowSchedule> {
        self.entries()
            .values()
            .filter(|e| is_due(&e.schedule, now))
            .map(|e| e.schedule.clone())
            .collect()
    }

    /// Enqueue one job per due schedule and advance each past `now`
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, QueueError> {
        let mut entries = self.entries();
        let mut enqueued = Vec::new();

        for entry in entries.values_mut() {
            if !is_due(&entry.schedule, now) {
                continue;
            }

            let job_id = self.queue.enqueue(
                JobType::ScheduledWorkflow,
                json!({
                    "workflowId": entry.schedule.workflow_id,
                    "input": entry.schedule.input,
                }),
                JobOptions::default(),
            )?;

            entry.schedule.last_run = Some(now);
            entry.advance(now);
            tracing::info!(
                "Schedule {} fired for workflow {} as job {}",
                entry.schedule.id,
                entry.schedule.workflow_id,
                job_id
            );
            enqueued.push(job_id);
        }

        Ok(enqueued)
    }

    /// Tick every `interval` until `shutdown` is cancelled
    pub fn spawn(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(e) = scheduler.tick(Utc::now()) {
                    tracing::error!("Scheduler tick failed: {}", e);
                    if matches!(e, QueueError::ShuttingDown) {
                        break;
                    }
                }
            }
            tracing::info!("Scheduler stopped");
        })
    }
}

fn is_due(schedule: &WorkflowSchedule, now: DateTime<Utc>) -> bool {
    schedule.enabled && schedule.next_run.is_some_and(|next| next <= now)
}
