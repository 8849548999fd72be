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
use crate::errors::ControllerError;
use crate::server::handlers::{
    create_service_handler, deploy_handler, get_deployment_handler, health_handler,
    list_deployments_handler, promote_handler, ready_handler, registry_status_handler,
    resolve_handler, rollback_handler, scale_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the intake router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/version", get(version_handler))
        // Intents
        .route("/webhooks/create-microservice", post(create_service_handler))
        .route("/webhooks/deploy", post(deploy_handler))
        .route("/webhooks/promote", post(promote_handler))
        .route("/webhooks/rollback", post(rollback_handler))
        .route("/webhooks/scale", post(scale_handler))
        // Registry status
        .route("/webhooks/registry", post(registry_status_handler))
        // Deployments
        .route("/deployments", get(list_deployments_handler))
        .route(
            "/deployments/{service}/{environment}",
            get(get_deployment_handler),
        )
        .route(
            "/deployments/{service}/{environment}/resolve",
            post(resolve_handler),
        )
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ControllerError>>, ControllerError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ControllerError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ControllerError::ServerError(e.to_string()))
    });

    Ok(handle)
}
