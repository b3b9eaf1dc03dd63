//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::AgentError;
use crate::server::handlers::{
    canary_analyze_handler, canary_get_handler, canary_list_handler, canary_metrics_handler,
    canary_pause_handler, canary_progress_handler, canary_promote_handler,
    canary_resume_handler, canary_rollback_handler, canary_start_handler, deploy_handler,
    deployments_handler, health_handler, rollback_handler, status_handler, version_handler,
    webhook_handler,
};
use crate::server::state::ServerState;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route("/status", get(status_handler))
        .route("/deployments", get(deployments_handler))
        .route("/webhook", post(webhook_handler))
        .route("/deploy", post(deploy_handler))
        .route("/rollback", post(rollback_handler))
        // Canary rollouts
        .route("/canary", get(canary_list_handler).post(canary_start_handler))
        .route("/canary/{id}", get(canary_get_handler))
        .route("/canary/{id}/metrics", get(canary_metrics_handler))
        .route("/canary/{id}/progress", post(canary_progress_handler))
        .route("/canary/{id}/analyze", post(canary_analyze_handler))
        .route("/canary/{id}/pause", post(canary_pause_handler))
        .route("/canary/{id}/resume", post(canary_resume_handler))
        .route("/canary/{id}/promote", post(canary_promote_handler))
        .route("/canary/{id}/rollback", post(canary_rollback_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), AgentError>>, AgentError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AgentError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| AgentError::ServerError(e.to_string()))
    });

    Ok(handle)
}
