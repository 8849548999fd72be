//! Catalog mirror
//!
//! Projects ledger records onto catalog entities and writes them with bounded
//! retry. The catalog is a mirror: a write that still fails after the retries
//! is reported back as a gap, never as an operation failure.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::models::deployment::{DeploymentRecord, OperationType};
use crate::models::operation::ServiceScaffold;
use crate::stores::{Catalog, StoreError};
use crate::utils::{calc_exp_backoff, BackoffOptions};

pub const DEPLOYMENT_ENTITY: &str = "deployment";
pub const MICROSERVICE_ENTITY: &str = "microservice";

/// Where the collaborators live; used to fill in catalog links
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollaboratorEndpoints {
    /// Manifest repository URL
    #[serde(default = "default_manifest_repo")]
    pub manifest_repo: String,

    /// Application registry server
    #[serde(default = "default_registry_server")]
    pub registry_server: String,

    /// Registry project applications are declared in
    #[serde(default = "default_registry_project")]
    pub registry_project: String,

    /// Catalog API base URL
    #[serde(default = "default_catalog_url")]
    pub catalog_url: String,
}

fn default_manifest_repo() -> String {
    "https://git.local/platform/manifests".to_string()
}

fn default_registry_server() -> String {
    "https://argocd.local".to_string()
}

fn default_registry_project() -> String {
    "default".to_string()
}

fn default_catalog_url() -> String {
    "https://api.getport.io".to_string()
}

impl Default for CollaboratorEndpoints {
    fn default() -> Self {
        Self {
            manifest_repo: default_manifest_repo(),
            registry_server: default_registry_server(),
            registry_project: default_registry_project(),
            catalog_url: default_catalog_url(),
        }
    }
}

impl CollaboratorEndpoints {
    /// Repository path holding a service's manifests
    pub fn repository(&self, service: &str) -> String {
        format!("{}/services/{}", self.manifest_repo.trim_end_matches('/'), service)
    }
}

/// Catalog retry policy
#[derive(Debug, Clone)]
pub struct CatalogRetry {
    /// Retries after the first attempt
    pub retries: u32,
    pub backoff: BackoffOptions,
    pub call_timeout: Duration,
}

/// Catalog properties for a deployment record
pub fn deployment_properties(
    record: &DeploymentRecord,
    endpoints: &CollaboratorEndpoints,
) -> Value {
    let key = &record.key;
    let mut props = Map::new();
    props.insert("service".into(), json!(key.service));
    props.insert("environment".into(), json!(key.environment));
    props.insert("version".into(), json!(record.current_version));
    props.insert("desired_version".into(), json!(record.desired_version));
    props.insert("status".into(), json!(record.status.as_str()));
    props.insert("sync_status".into(), json!(record.sync_status.as_str()));
    if let Some(health) = record.health {
        props.insert("health".into(), json!(health.as_str()));
    }
    props.insert("auto_sync".into(), json!(record.auto_sync));
    props.insert("replicas".into(), json!(record.parameters.replicas));
    props.insert("cpu_limit".into(), json!(record.parameters.cpu_limit));
    props.insert("memory_limit".into(), json!(record.parameters.memory_limit));
    props.insert("repository".into(), json!(endpoints.repository(&key.service)));
    props.insert("registry_app".into(), json!(key.entity_id()));
    props.insert("updated_at".into(), json!(record.updated_at.to_rfc3339()));

    if let Some(note) = &record.intervention {
        props.insert("intervention".into(), json!(note));
    }

    if let Some(event) = record.history.last() {
        props.insert("last_operation".into(), json!(event.operation_type.as_str()));
        match event.operation_type {
            OperationType::Promote => {
                props.insert("promoted_from".into(), json!(event.source_environment));
                props.insert("tests_required".into(), json!(event.tests_required));
                props.insert("promoted_at".into(), json!(event.timestamp.to_rfc3339()));
            }
            OperationType::Rollback => {
                props.insert("rollback_reason".into(), json!(event.reason));
                props.insert("rolled_back_at".into(), json!(event.timestamp.to_rfc3339()));
            }
            OperationType::Scale => {
                props.insert("scaled_at".into(), json!(event.timestamp.to_rfc3339()));
            }
            OperationType::Create | OperationType::Deploy => {
                props.insert("deployed_at".into(), json!(event.timestamp.to_rfc3339()));
            }
        }
    }

    Value::Object(props)
}

/// Catalog properties for a newly scaffolded service
pub fn microservice_properties(
    record: &DeploymentRecord,
    scaffold: &ServiceScaffold,
    endpoints: &CollaboratorEndpoints,
) -> Value {
    json!({
        "name": record.key.service,
        "team": scaffold.team,
        "language": scaffold.language,
        "framework": scaffold.framework,
        "template": scaffold.template,
        "status": "created",
        "repository": endpoints.repository(&record.key.service),
        "registry_app": record.key.entity_id(),
        "created_at": record.updated_at.to_rfc3339(),
    })
}

/// Upsert with bounded retry and exponential backoff.
///
/// Returns the last error once every attempt failed.
pub async fn upsert_with_retry(
    catalog: &Arc<dyn Catalog>,
    retry: &CatalogRetry,
    entity_id: &str,
    entity_type: &str,
    properties: &Value,
) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(
            retry.call_timeout,
            catalog.upsert(entity_id, entity_type, properties),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(retry.call_timeout)),
        };

        match result {
            Ok(()) => {
                debug!("Catalog entity {} written (attempt {})", entity_id, attempt + 1);
                return Ok(());
            }
            Err(e) if attempt < retry.retries => {
                let delay = calc_exp_backoff(&retry.backoff, attempt);
                warn!(
                    "Catalog upsert of {} failed (attempt {}): {}, retrying in {:?}",
                    entity_id,
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
