//! Webhook payloads to validated operations

use intent_api::models::{
    CreateServiceProperties, DeployProperties, EntityRef, PromoteProperties, RollbackProperties,
    RunContext, ScaleProperties, WebhookPayload,
};
use tracing::debug;

use crate::errors::ValidationError;
use crate::models::deployment::DeploymentKey;
use crate::models::operation::{Operation, OperationParameters, ServiceScaffold};
use crate::utils::generate_uuid;

const DEFAULT_ENVIRONMENT: &str = "dev";
const DEFAULT_TEMPLATE: &str = "basic";

/// Idempotency key of an intent; the action run id when the caller sent one
fn request_id(context: &RunContext) -> String {
    match context.run_id.as_deref().map(str::trim) {
        Some(run_id) if !run_id.is_empty() => run_id.to_string(),
        _ => {
            let id = generate_uuid();
            debug!("Intent carries no run id, using {}", id);
            id
        }
    }
}

/// The deployment entity an action was triggered on
fn entity(entity: Option<EntityRef>) -> Result<EntityRef, ValidationError> {
    entity.ok_or_else(|| {
        ValidationError::new(&DeploymentKey::new("", ""), "entity", "action requires a deployment entity")
    })
}

pub fn create(payload: WebhookPayload<CreateServiceProperties>) -> Result<Operation, ValidationError> {
    let request_id = request_id(&payload.context);
    let props = payload.properties;
    let environment = props
        .environment
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string());

    Operation::create(
        DeploymentKey::new(props.name, environment),
        props.version,
        ServiceScaffold {
            team: props.team,
            language: props.language,
            framework: props.framework,
            template: props
                .template
                .unwrap_or_else(|| DEFAULT_TEMPLATE.to_string()),
        },
        OperationParameters::default(),
        request_id,
    )
}

pub fn deploy(payload: WebhookPayload<DeployProperties>) -> Result<Operation, ValidationError> {
    let request_id = request_id(&payload.context);
    let props = payload.properties;
    Operation::deploy(
        DeploymentKey::new(props.service, props.environment),
        props.version,
        OperationParameters {
            replicas: props.replicas,
            cpu_limit: props.cpu_limit,
            memory_limit: props.memory_limit,
            auto_sync: props.auto_sync,
            run_tests: false,
        },
        request_id,
    )
}

/// The entity names the source environment; the target comes from the properties
pub fn promote(payload: WebhookPayload<PromoteProperties>) -> Result<Operation, ValidationError> {
    let request_id = request_id(&payload.context);
    let source = entity(payload.entity)?.properties;
    let props = payload.properties;
    Operation::promote(
        DeploymentKey::new(source.service, props.target_environment),
        source.environment,
        source.version,
        OperationParameters {
            auto_sync: props.auto_sync,
            run_tests: props.run_tests.unwrap_or(true),
            ..Default::default()
        },
        request_id,
    )
}

pub fn rollback(payload: WebhookPayload<RollbackProperties>) -> Result<Operation, ValidationError> {
    let request_id = request_id(&payload.context);
    let target = entity(payload.entity)?.properties;
    Operation::rollback(
        DeploymentKey::new(target.service, target.environment),
        payload.properties.target_version,
        payload.properties.reason,
        request_id,
    )
}

pub fn scale(payload: WebhookPayload<ScaleProperties>) -> Result<Operation, ValidationError> {
    let request_id = request_id(&payload.context);
    let target = entity(payload.entity)?.properties;
    let props = payload.properties;
    Operation::scale(
        DeploymentKey::new(target.service, target.environment),
        OperationParameters {
            replicas: props.replicas,
            cpu_limit: props.cpu_limit,
            memory_limit: props.memory_limit,
            ..Default::default()
        },
        request_id,
    )
}
