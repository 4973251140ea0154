use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weft_core::node::builtin;
use weft_core::queue::{JobRuntime, WebhookJobHandler, WorkflowJobHandler};
use weft_core::storage::{JsonlEventLog, RedbStore};
use weft_core::{
    ExecutionManager, JobQueue, JobType, NodeRegistry, RuntimeConfig, WebhookService,
    WorkflowEngine, WorkflowId, WorkflowScheduler,
};

const SCHEDULER_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub server: HttpConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Cron-triggered workflows registered at startup
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub workflow_id: String,
    pub cron: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "weft.redb".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the event log path
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    /// Get the index file path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub store: Arc<RedbStore>,
    pub event_log: Arc<JsonlEventLog>,
    pub registry: Arc<NodeRegistry>,
    pub executions: Arc<ExecutionManager>,
    pub engine: Arc<WorkflowEngine>,
    pub queue: Arc<JobQueue>,
    pub runtime: JobRuntime,
    pub webhooks: WebhookService,
    pub scheduler: Arc<WorkflowScheduler>,
    pub config: Arc<RuntimeConfig>,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbStore::new(config.index_path()).context("Failed to create index store")?,
        );

        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let registry = Arc::new(NodeRegistry::new());
        let report = registry.load_catalog(&builtin::catalog());
        for skipped in &report.skipped {
            tracing::warn!("Node plugin {} unavailable: {}", skipped.name, skipped.reason);
        }

        let runtime_config = Arc::new(config.runtime.clone());
        let executions = Arc::new(ExecutionManager::new());
        let engine = Arc::new(WorkflowEngine::new(
            registry.clone(),
            executions.clone(),
            store.clone(),
            event_log.clone(),
        ));

        let queue = Arc::new(JobQueue::new(store.clone()));
        let workflow_handler = Arc::new(WorkflowJobHandler::new(engine.clone(), store.clone()));
        let mut runtime = JobRuntime::new(queue.clone(), runtime_config.clone());
        runtime.register_handler(JobType::WorkflowExecution, workflow_handler.clone());
        runtime.register_handler(JobType::ScheduledWorkflow, workflow_handler);
        runtime.register_handler(
            JobType::WebhookProcessing,
            Arc::new(WebhookJobHandler::new(
                engine.clone(),
                store.clone(),
                store.clone(),
            )),
        );

        let webhooks = WebhookService::new(store.clone(), store.clone(), queue.clone());

        let scheduler = Arc::new(WorkflowScheduler::new(queue.clone()));
        for schedule in &config.schedules {
            scheduler
                .add_schedule(
                    WorkflowId::new(schedule.workflow_id.clone()),
                    &schedule.cron,
                    schedule.input.clone(),
                )
                .with_context(|| format!("Invalid schedule for workflow {}", schedule.workflow_id))?;
        }

        Ok(Self {
            store,
            event_log,
            registry,
            executions,
            engine,
            queue,
            runtime,
            webhooks,
            scheduler,
            config: runtime_config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start workers, the stale-run reaper and the scheduler
    pub fn start(&self) -> Result<()> {
        self.runtime.start_workers()?;
        self.executions
            .spawn_reaper(self.config.reap_interval(), self.config.stale_after());
        self.scheduler.spawn(SCHEDULER_TICK, self.shutdown.child_token());
        Ok(())
    }

    /// Stop producers, drain workers within the grace period, cancel what
    /// is left and flush buffered events
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let released = self.runtime.stop_workers().await;
        if released > 0 {
            tracing::warn!("{} jobs returned to pending for the next start", released);
        }
        self.executions.shutdown();
        self.event_log.flush_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml"), dir.path().join("data"))
            .unwrap();

        assert!(dir.path().join("data").is_dir());
        assert_eq!(config.bind_addr(), "127.0.0.1:8080");
        assert_eq!(config.index_path(), dir.path().join("data").join("weft.redb"));
        assert_eq!(config.runtime.queue("webhook-processing").concurrency, 10);
        assert!(config.schedules.is_empty());
    }

    #[test]
    fn test_parse_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weft.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9090

[runtime.jobs]
default_retries = 5

[runtime.queues.workflow-execution]
concurrency = 12

[[schedules]]
workflow_id = "nightly"
cron = "0 0 2 * * *"
input = { full = true }
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.runtime.jobs.default_retries, 5);
        assert_eq!(config.runtime.jobs.default_timeout_ms, 300_000);
        assert_eq!(config.runtime.queue("workflow-execution").concurrency, 12);
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].input, serde_json::json!({"full": true}));
    }

    #[tokio::test]
    async fn test_state_wiring() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let state = AppState::new(&config).unwrap();
        assert!(state.registry.contains("manual-trigger"));
        state.start().unwrap();
        assert_eq!(state.runtime.running_queues().len(), 3);
        state.shutdown().await.unwrap();
        assert!(state.queue.is_closed());
    }
}
