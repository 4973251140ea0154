use crate::config::{AppState, ServerConfig};
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use weft_core::{EngineError, QueueError, WebhookError};

mod handlers;

/// Start the API server and run until Ctrl-C, then shut down gracefully
pub async fn serve(config: ServerConfig) -> Result<()> {
    let state = Arc::new(AppState::new(&config)?);
    state.start()?;

    let app = create_router(state.clone());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining workers");
    state.shutdown().await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create the API router
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/nodes", get(handlers::list_nodes))
        .route(
            "/api/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route("/api/workflows/{workflow_id}", get(handlers::get_workflow))
        .route("/api/workflows/{workflow_id}/run", post(handlers::run_workflow))
        .route("/api/runs/{run_id}", get(handlers::get_run))
        .route("/api/runs/{run_id}/events", get(handlers::get_run_events))
        .route("/api/runs/{run_id}/cancel", post(handlers::cancel_run))
        .route("/api/jobs/{job_id}", get(handlers::get_job))
        .route("/api/jobs/{job_id}/cancel", post(handlers::cancel_job))
        .route("/api/queues/{queue}/stats", get(handlers::queue_stats))
        .route(
            "/api/webhooks",
            get(handlers::list_webhooks).post(handlers::create_webhook),
        )
        .route("/api/webhooks/{webhook_id}", post(handlers::deliver_webhook))
        .route("/api/webhooks/{webhook_id}/test", post(handlers::test_webhook))
        // Middleware
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "weft",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Error type for API handlers; the status is derived from the domain error
pub struct ApiError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: anyhow::anyhow!(message.into()),
        }
    }
}

fn queue_status(err: &QueueError) -> StatusCode {
    match err {
        QueueError::UnknownJob(_) | QueueError::QueueNotFound(_) => StatusCode::NOT_FOUND,
        QueueError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::WaitTimeout => StatusCode::GATEWAY_TIMEOUT,
        QueueError::JobRetryExhausted { .. } | QueueError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    if let Some(err) = err.downcast_ref::<WebhookError>() {
        return match err {
            WebhookError::NotFound(_) | WebhookError::UnknownWorkflow(_) => StatusCode::NOT_FOUND,
            WebhookError::Inactive(_) => StatusCode::CONFLICT,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::Queue(err) => queue_status(err),
            WebhookError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
    }
    if let Some(err) = err.downcast_ref::<QueueError>() {
        return queue_status(err);
    }
    if let Some(err) = err.downcast_ref::<EngineError>() {
        if err.is_definition_error() {
            return StatusCode::BAD_REQUEST;
        }
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_msg = self.error.to_string();
        let details = self
            .error
            .chain()
            .skip(1)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ");

        if self.status.is_server_error() {
            tracing::error!("Request failed: {:#}", self.error);
        }

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (self.status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        let error = err.into();
        Self {
            status: status_for(&error),
            error,
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
