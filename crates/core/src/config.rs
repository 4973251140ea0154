use crate::types::JobType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Runtime settings consumed by the queue layer and execution manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, QueueConfig>,

    #[serde(default)]
    pub jobs: JobDefaults,

    #[serde(default)]
    pub executions: ExecutionConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Worker pool settings for one named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// At most `max` jobs started per `per_ms` window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max: u32,
    pub per_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.per_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    #[serde(default = "default_retries")]
    pub default_retries: u32,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long a timed-out handler may take to wind down after its
    /// attempt is cancelled
    #[serde(default = "default_timeout_settle_ms")]
    pub timeout_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_concurrency() -> usize {
    1
}

fn default_retries() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_timeout_settle_ms() -> u64 {
    5_000
}

fn default_stale_after_secs() -> u64 {
    3_600
}

fn default_reap_interval_secs() -> u64 {
    1_800
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_queues() -> BTreeMap<String, QueueConfig> {
    let mut queues = BTreeMap::new();
    queues.insert(
        JobType::WorkflowExecution.queue_name().to_string(),
        QueueConfig {
            concurrency: 5,
            rate_limit: None,
        },
    );
    queues.insert(
        JobType::WebhookProcessing.queue_name().to_string(),
        QueueConfig {
            concurrency: 10,
            rate_limit: Some(RateLimitConfig {
                max: 20,
                per_ms: 1_000,
            }),
        },
    );
    queues.insert(
        JobType::AgentExecution.queue_name().to_string(),
        QueueConfig {
            concurrency: 5,
            rate_limit: None,
        },
    );
    queues.insert(
        JobType::ScheduledWorkflow.queue_name().to_string(),
        QueueConfig {
            concurrency: 3,
            rate_limit: None,
        },
    );
    queues
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            default_retries: default_retries(),
            default_timeout_ms: default_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_settle_ms: default_timeout_settle_ms(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            jobs: JobDefaults::default(),
            executions: ExecutionConfig::default(),
            shutdown: ShutdownConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Settings for a queue, falling back to a single-worker pool
    pub fn queue(&self, name: &str) -> QueueConfig {
        self.queues.get(name).cloned().unwrap_or(QueueConfig {
            concurrency: default_concurrency(),
            rate_limit: None,
        })
    }

    /// Backoff before attempt `attempt + 1`, doubling from the base and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .jobs
            .backoff_base_ms
            .saturating_mul(2_u64.pow(exponent))
            .min(self.jobs.backoff_max_ms);
        Duration::from_millis(delay)
    }

    pub fn timeout_settle(&self) -> Duration {
        Duration::from_millis(self.jobs.timeout_settle_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.executions.stale_after_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.executions.reap_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_period_secs)
    }
}
