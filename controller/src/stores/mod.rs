//! Collaborator contracts
//!
//! The engine talks to three independently authoritative systems: the manifest
//! repository, the CD application registry and the service catalog. Transport,
//! authentication and retries at the wire level are the implementations' concern;
//! the engine only sees these traits.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::deployment::{DeploymentKey, DeploymentParameters, HealthStatus, SyncStatus};

/// Reference to a manifest commit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef(pub String);

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a declared registry application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationRef {
    pub name: String,

    /// Manifest commit the application points at
    pub revision: String,
}

/// Status pushed by the registry outside the reconciliation path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStatus {
    pub sync_status: SyncStatus,
    pub health: HealthStatus,
}

/// Which collaborator an error came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreKind {
    ManifestStore,
    ApplicationRegistry,
    Catalog,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreKind::ManifestStore => "manifest store",
            StoreKind::ApplicationRegistry => "application registry",
            StoreKind::Catalog => "catalog",
        };
        f.write_str(name)
    }
}

/// Collaborator failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Versioned deployment manifests keyed by (service, environment)
#[async_trait]
pub trait ManifestStore: Send + Sync {
    /// Write the manifest for `version` with `parameters`
    async fn write(
        &self,
        key: &DeploymentKey,
        version: &str,
        parameters: &DeploymentParameters,
    ) -> Result<CommitRef, StoreError>;

    /// Restore the manifest content of `restore_to`, or remove the manifest
    /// when the key had no committed manifest before
    async fn revert(
        &self,
        key: &DeploymentKey,
        restore_to: Option<&CommitRef>,
    ) -> Result<(), StoreError>;
}

/// Desired-state application objects
#[async_trait]
pub trait ApplicationRegistry: Send + Sync {
    /// Declare or update the application for `key` pointing at `manifest_ref`.
    /// With `auto_sync` false the application is declared manual-sync.
    async fn declare(
        &self,
        key: &DeploymentKey,
        manifest_ref: &CommitRef,
        auto_sync: bool,
    ) -> Result<ApplicationRef, StoreError>;

    /// Whether resources can be patched without a versioned manifest write
    fn supports_resource_patch(&self) -> bool {
        false
    }

    async fn patch_resources(
        &self,
        key: &DeploymentKey,
        _parameters: &DeploymentParameters,
    ) -> Result<(), StoreError> {
        Err(StoreError::Unsupported(format!(
            "resource patching for {}",
            key
        )))
    }

    /// Stream of sync/health reports for `key`
    fn on_status_change(&self, key: &DeploymentKey) -> BoxStream<'static, RegistryStatus>;
}

/// Operator-facing entity records
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn upsert(
        &self,
        entity_id: &str,
        entity_type: &str,
        properties: &serde_json::Value,
    ) -> Result<(), StoreError>;
}

/// The three collaborators the engine drives
#[derive(Clone)]
pub struct Collaborators {
    pub manifests: Arc<dyn ManifestStore>,
    pub registry: Arc<dyn ApplicationRegistry>,
    pub catalog: Arc<dyn Catalog>,
}

impl Collaborators {
    pub fn new(
        manifests: Arc<dyn ManifestStore>,
        registry: Arc<dyn ApplicationRegistry>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            manifests,
            registry,
            catalog,
        }
    }
}
