//! Webhook ingestion: verifies deliveries, records them and hands them to the
//! `webhook-processing` queue.

use crate::error::{QueueError, WebhookError};
use crate::queue::JobQueue;
use crate::storage::{WebhookStore, WorkflowStore};
use crate::types::{
    Job, JobId, JobOptions, JobType, Webhook, WebhookEvent, WebhookId, WorkflowId,
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex digest>` for webhooks with a secret
pub const SIGNATURE_HEADER: &str = "x-weft-signature";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Returned to the caller once a delivery is accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookReceipt {
    pub event_id: String,
    pub job_id: JobId,
}

pub struct WebhookService {
    webhooks: Arc<dyn WebhookStore>,
    workflows: Arc<dyn WorkflowStore>,
    queue: Arc<JobQueue>,
}

impl WebhookService {
    pub fn new(
        webhooks: Arc<dyn WebhookStore>,
        workflows: Arc<dyn WorkflowStore>,
        queue: Arc<JobQueue>,
    ) -> Self {
        Self {
            webhooks,
            workflows,
            queue,
        }
    }

    /// Register a webhook that triggers `workflow_id`
    pub fn create_webhook(
        &self,
        workflow_id: WorkflowId,
        name: impl Into<String>,
        secret: Option<String>,
    ) -> Result<Webhook, WebhookError> {
        if self.workflows.get_workflow(&workflow_id)?.is_none() {
            return Err(WebhookError::UnknownWorkflow(workflow_id));
        }

        let webhook = Webhook {
            id: WebhookId::generate(),
            workflow_id,
            name: name.into(),
            secret: secret.filter(|s| !s.is_empty()),
            active: true,
            created_at: Utc::now(),
        };
        self.webhooks.save_webhook(&webhook)?;

        tracing::info!(
            "Created webhook {} for workflow {}",
            webhook.id,
            webhook.workflow_id
        );
        Ok(webhook)
    }

    pub fn list_webhooks(&self) -> Result<Vec<Webhook>, WebhookError> {
        Ok(self.webhooks.list_webhooks()?)
    }

    pub fn get_webhook(&self, webhook_id: &WebhookId) -> Result<Webhook, WebhookError> {
        self.webhooks
            .get_webhook(webhook_id)?
            .ok_or_else(|| WebhookError::NotFound(webhook_id.clone()))
    }

    /// Enable or disable deliveries
    pub fn set_active(&self, webhook_id: &WebhookId, active: bool) -> Result<Webhook, WebhookError> {
        let mut webhook = self.get_webhook(webhook_id)?;
        webhook.active = active;
        self.webhooks.save_webhook(&webhook)?;
        Ok(webhook)
    }

    pub fn get_event(&self, event_id: &str) -> Result<Option<WebhookEvent>, WebhookError> {
        Ok(self.webhooks.get_webhook_event(event_id)?)
    }

    /// Accept a delivery: check the webhook is active and, when it has a
    /// secret, that the payload is signed with it. Then record the event and
    /// enqueue a `webhook-processing` job for it.
    pub fn process_webhook(
        &self,
        webhook_id: &WebhookId,
        payload: Value,
        headers: HashMap<String, String>,
    ) -> Result<WebhookReceipt, WebhookError> {
        let webhook = self.active_webhook(webhook_id)?;

        if let Some(secret) = &webhook.secret {
            let signature = headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
                .map(|(_, value)| value.as_str());
            if !verify_signature(secret, &payload, signature) {
                tracing::warn!("Rejected delivery to webhook {}: bad signature", webhook_id);
                return Err(WebhookError::InvalidSignature);
            }
        }

        self.accept(&webhook, payload, headers)
    }

    /// Send a synthetic delivery through the queue, skipping signature checks
    pub fn test_webhook(&self, webhook_id: &WebhookId) -> Result<WebhookReceipt, WebhookError> {
        let webhook = self.active_webhook(webhook_id)?;
        let payload = json!({
            "test": true,
            "webhook_id": webhook.id,
            "timestamp": Utc::now(),
        });
        let headers = HashMap::from([("x-weft-test".to_string(), "true".to_string())]);

        self.accept(&webhook, payload, headers)
    }

    fn active_webhook(&self, webhook_id: &WebhookId) -> Result<Webhook, WebhookError> {
        let webhook = self.get_webhook(webhook_id)?;
        if !webhook.active {
            return Err(WebhookError::Inactive(webhook_id.clone()));
        }
        Ok(webhook)
    }

    fn accept(
        &self,
        webhook: &Webhook,
        payload: Value,
        headers: HashMap<String, String>,
    ) -> Result<WebhookReceipt, WebhookError> {
        if self.queue.is_closed() {
            return Err(QueueError::ShuttingDown.into());
        }

        let event_id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(
            JobType::WebhookProcessing,
            json!({ "eventId": event_id }),
            JobOptions::default(),
        );

        // The event must exist before the job can be claimed
        let event = WebhookEvent {
            id: event_id.clone(),
            webhook_id: webhook.id.clone(),
            payload,
            headers,
            received_at: Utc::now(),
            job_id: Some(job.id.clone()),
            processed: false,
            run_id: None,
        };
        self.webhooks.save_webhook_event(&event)?;
        let job_id = self.queue.enqueue_job(job)?;

        tracing::info!(
            "Accepted delivery {} for webhook {} as job {}",
            event_id,
            webhook.id,
            job_id
        );
        Ok(WebhookReceipt { event_id, job_id })
    }
}

/// `sha256=<hex HMAC-SHA256>` of the payload's JSON encoding
pub fn sign_payload(secret: &str, payload: &Value) -> String {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) else {
        // Unreachable: HMAC accepts keys of any length
        return String::new();
    };
    mac.update(payload_bytes(payload).as_slice());
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

fn verify_signature(secret: &str, payload: &Value, signature: Option<&str>) -> bool {
    let Some(digest) = signature.and_then(|s| s.strip_prefix(SIGNATURE_PREFIX)) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload_bytes(payload).as_slice());
    mac.verify_slice(&expected).is_ok()
}

fn payload_bytes(payload: &Value) -> Vec<u8> {
    // Object keys serialize sorted, so equal payloads sign identically
    serde_json::to_vec(payload).unwrap_or_default()
}
