//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use intent_api::models::{
    CreateServiceProperties, DeployProperties, DeploymentListResponse, DeploymentView,
    HealthResponse, PromoteProperties, RegistryStatusPayload, RejectionResponse,
    RollbackProperties, ScaleProperties, SubmitResponse, VersionEventView, VersionResponse,
    WebhookPayload,
};
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{RejectionKind, SubmitError, ValidationError};
use crate::models::deployment::{DeploymentKey, DeploymentRecord, HealthStatus, SyncStatus};
use crate::models::operation::Operation;
use crate::reconcile::engine::SubmitOutcome;
use crate::reconcile::fsm::PipelineStage;
use crate::server::intents;
use crate::server::state::ServerState;
use crate::stores::RegistryStatus;
use crate::utils::version_info;

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "gitops-reconciler".to_string(),
        version: version.version,
    })
}

/// Readiness handler
pub async fn ready_handler() -> impl IntoResponse {
    Json(json!({ "status": "ready" }))
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================ INTENTS ======================================= //

pub async fn create_service_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<WebhookPayload<CreateServiceProperties>>,
) -> Response {
    submit(&state, intents::create(payload)).await
}

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<WebhookPayload<DeployProperties>>,
) -> Response {
    submit(&state, intents::deploy(payload)).await
}

pub async fn promote_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<WebhookPayload<PromoteProperties>>,
) -> Response {
    submit(&state, intents::promote(payload)).await
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<WebhookPayload<RollbackProperties>>,
) -> Response {
    submit(&state, intents::rollback(payload)).await
}

pub async fn scale_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<WebhookPayload<ScaleProperties>>,
) -> Response {
    submit(&state, intents::scale(payload)).await
}

async fn submit(state: &ServerState, operation: Result<Operation, ValidationError>) -> Response {
    let operation = match operation {
        Ok(operation) => operation,
        Err(e) => {
            info!("Rejecting invalid intent for {}: {}", e.key, e);
            return rejection(&SubmitError::from(e)).into_response();
        }
    };

    match state.engine.submit(operation).await {
        Ok(outcome) => (StatusCode::OK, Json(submit_response(outcome))).into_response(),
        Err(e) => rejection(&e).into_response(),
    }
}

/// Registry status webhook
pub async fn registry_status_handler(
    State(state): State<Arc<ServerState>>,
    Json(payload): Json<RegistryStatusPayload>,
) -> Response {
    let key = DeploymentKey::new(payload.service, payload.environment);
    let report = match (
        payload.sync_status.parse::<SyncStatus>(),
        payload.health.parse::<HealthStatus>(),
    ) {
        (Ok(sync_status), Ok(health)) => RegistryStatus {
            sync_status,
            health,
        },
        (Err(e), _) | (_, Err(e)) => {
            let err = ValidationError::new(&key, "status", e);
            return rejection(&SubmitError::from(err)).into_response();
        }
    };

    match state.engine.apply_status(&key, report).await {
        Some(record) => Json(deployment_view(&record)).into_response(),
        None => {
            warn!("Registry reported status for unknown deployment {}", key);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

// ================================ DEPLOYMENTS =================================== //

pub async fn list_deployments_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let deployments: Vec<DeploymentView> =
        state.engine.records().iter().map(deployment_view).collect();
    let total = deployments.len();
    Json(DeploymentListResponse { deployments, total })
}

pub async fn get_deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path((service, environment)): Path<(String, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    let key = DeploymentKey::new(service, environment);
    let record = state.engine.record(&key).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(deployment_view(&record)))
}

/// Operator acknowledgement of a failed compensation
pub async fn resolve_handler(
    State(state): State<Arc<ServerState>>,
    Path((service, environment)): Path<(String, String)>,
) -> Response {
    let key = DeploymentKey::new(service, environment);
    match state.engine.resolve_intervention(&key).await {
        Ok(record) => Json(deployment_view(&record)).into_response(),
        Err(e) => rejection(&e).into_response(),
    }
}

// ================================ MAPPING ======================================= //

/// HTTP status of a rejection kind
pub fn status_code(kind: RejectionKind) -> StatusCode {
    match kind {
        RejectionKind::Validation => StatusCode::BAD_REQUEST,
        RejectionKind::Busy => StatusCode::CONFLICT,
        RejectionKind::Precondition => StatusCode::PRECONDITION_FAILED,
        RejectionKind::Store => StatusCode::BAD_GATEWAY,
        RejectionKind::CompensationFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rejection(err: &SubmitError) -> (StatusCode, Json<RejectionResponse>) {
    let key = err.key();
    let stage: PipelineStage = err.stage();
    (
        status_code(err.kind()),
        Json(RejectionResponse {
            kind: err.kind().as_str().to_string(),
            service: key.service.clone(),
            environment: key.environment.clone(),
            stage: stage.to_string(),
            message: err.to_string(),
        }),
    )
}

fn submit_response(outcome: SubmitOutcome) -> SubmitResponse {
    SubmitResponse {
        accepted: true,
        replayed: outcome.replayed,
        catalog_synced: outcome.catalog_synced,
        operation_id: outcome.operation_id,
        deployment: deployment_view(&outcome.record),
    }
}

pub fn deployment_view(record: &DeploymentRecord) -> DeploymentView {
    DeploymentView {
        service: record.key.service.clone(),
        environment: record.key.environment.clone(),
        current_version: record.current_version.clone(),
        desired_version: record.desired_version.clone(),
        status: record.status.as_str().to_string(),
        sync_status: record.sync_status.as_str().to_string(),
        health: record.health.map(|h| h.as_str().to_string()),
        revision: record.revision,
        in_flight_operation_id: record.in_flight_operation_id.clone(),
        intervention: record.intervention.clone(),
        replicas: record.parameters.replicas,
        cpu_limit: record.parameters.cpu_limit.clone(),
        memory_limit: record.parameters.memory_limit.clone(),
        auto_sync: record.auto_sync,
        updated_at: record.updated_at,
        history: record
            .history
            .iter()
            .map(|e| VersionEventView {
                version: e.version.clone(),
                operation_type: e.operation_type.as_str().to_string(),
                timestamp: e.timestamp,
                source_environment: e.source_environment.clone(),
                reason: e.reason.clone(),
                request_id: e.request_id.clone(),
            })
            .collect(),
    }
}
