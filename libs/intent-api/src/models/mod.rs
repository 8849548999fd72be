//! Intent webhook and response models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ================================ REQUESTS ===================================== //

/// Context attached to every intent by the catalog's action runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    /// Action run identifier, used as the idempotency key
    #[serde(default)]
    pub run_id: Option<String>,

    #[serde(default)]
    pub user_email: Option<String>,

    #[serde(default)]
    pub blueprint: Option<String>,
}

/// Properties of the deployment entity an action was triggered on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentEntityProperties {
    pub service: String,
    pub environment: String,

    /// Version as displayed in the catalog; a hint only
    #[serde(default)]
    pub version: Option<String>,
}

/// Entity an action was triggered on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default)]
    pub identifier: Option<String>,

    #[serde(default)]
    pub blueprint: Option<String>,

    pub properties: DeploymentEntityProperties,
}

/// Webhook envelope, generic over the action-specific properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload<P> {
    #[serde(default)]
    pub action: Option<String>,

    #[serde(default)]
    pub entity: Option<EntityRef>,

    #[serde(default)]
    pub context: RunContext,

    pub properties: P,
}

/// Create a new microservice (scaffold + dev environment)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServiceProperties {
    pub name: String,
    pub team: String,
    pub language: String,
    pub framework: String,

    #[serde(default)]
    pub template: Option<String>,

    /// Environment to create; defaults to `dev`
    #[serde(default)]
    pub environment: Option<String>,

    /// Initial image version, if one already exists
    #[serde(default)]
    pub version: Option<String>,
}

/// Deploy a version to an environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployProperties {
    pub service: String,
    pub environment: String,
    pub version: String,

    #[serde(default)]
    pub auto_sync: Option<bool>,

    #[serde(default)]
    pub replicas: Option<u32>,

    #[serde(default)]
    pub cpu_limit: Option<String>,

    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Promote the entity's environment to a target environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromoteProperties {
    pub target_environment: String,

    #[serde(default)]
    pub run_tests: Option<bool>,

    #[serde(default)]
    pub auto_sync: Option<bool>,
}

/// Roll the entity's environment back
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackProperties {
    #[serde(default)]
    pub reason: Option<String>,

    /// Explicit target; resolved from history when absent or empty
    #[serde(default)]
    pub target_version: Option<String>,
}

/// Change resources of the entity's environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScaleProperties {
    #[serde(default)]
    pub replicas: Option<u32>,

    #[serde(default)]
    pub cpu_limit: Option<String>,

    #[serde(default)]
    pub memory_limit: Option<String>,
}

/// Application status reported by the CD registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatusPayload {
    pub service: String,
    pub environment: String,
    pub sync_status: String,
    pub health: String,
}

// ================================ RESPONSES ==================================== //

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// One entry of a deployment's version history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionEventView {
    pub version: String,
    pub operation_type: String,
    pub timestamp: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_environment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub request_id: String,
}

/// Snapshot of a deployment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentView {
    pub service: String,
    pub environment: String,
    pub current_version: String,
    pub desired_version: String,
    pub status: String,
    pub sync_status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<String>,

    pub revision: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight_operation_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub intervention: Option<String>,

    pub replicas: u32,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub auto_sync: bool,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub history: Vec<VersionEventView>,
}

/// Accepted intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub accepted: bool,

    /// True when the request id had already been applied
    pub replayed: bool,

    /// False when the catalog mirror could not be updated
    pub catalog_synced: bool,

    pub operation_id: String,
    pub deployment: DeploymentView,
}

/// Rejected intent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionResponse {
    pub kind: String,
    pub service: String,
    pub environment: String,
    pub stage: String,
    pub message: String,
}

/// Deployment list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentListResponse {
    pub deployments: Vec<DeploymentView>,
    pub total: usize,
}
