//! Deployment models

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stores::{ApplicationRef, CommitRef};

/// Identity of a reconciliation target
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub service: String,
    pub environment: String,
}

impl DeploymentKey {
    pub fn new(service: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            environment: environment.into(),
        }
    }

    /// Name shared by the registry application and the catalog entity
    pub fn entity_id(&self) -> String {
        format!("{}-{}", self.service, self.environment)
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.environment)
    }
}

/// Deployment status as tracked by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    Pending,
    Progressing,
    Synced,
    Degraded,
    RolledBack,
    Failed,

    /// A compensating action failed; an operator must resolve the record
    CompensationFailed,
}

impl DeploymentStatus {
    /// Terminal statuses a promotion may read from
    pub fn is_promotable(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Synced | DeploymentStatus::Degraded | DeploymentStatus::RolledBack
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "Pending",
            DeploymentStatus::Progressing => "Progressing",
            DeploymentStatus::Synced => "Synced",
            DeploymentStatus::Degraded => "Degraded",
            DeploymentStatus::RolledBack => "RolledBack",
            DeploymentStatus::Failed => "Failed",
            DeploymentStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

/// Registry-reported agreement between desired and live state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    InSync,
    OutOfSync,
    Unknown,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InSync => "InSync",
            SyncStatus::OutOfSync => "OutOfSync",
            SyncStatus::Unknown => "Unknown",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', '-'], "").as_str() {
            "insync" | "synced" => Ok(SyncStatus::InSync),
            "outofsync" => Ok(SyncStatus::OutOfSync),
            "unknown" => Ok(SyncStatus::Unknown),
            _ => Err(format!("Invalid sync status: {}", s)),
        }
    }
}

/// Application health as reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Suspended,
    Missing,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "Healthy",
            HealthStatus::Progressing => "Progressing",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Suspended => "Suspended",
            HealthStatus::Missing => "Missing",
            HealthStatus::Unknown => "Unknown",
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "healthy" => Ok(HealthStatus::Healthy),
            "progressing" => Ok(HealthStatus::Progressing),
            "degraded" => Ok(HealthStatus::Degraded),
            "suspended" => Ok(HealthStatus::Suspended),
            "missing" => Ok(HealthStatus::Missing),
            "unknown" => Ok(HealthStatus::Unknown),
            _ => Err(format!("Invalid health status: {}", s)),
        }
    }
}

/// Kind of operation that produced a history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Create,
    Deploy,
    Promote,
    Rollback,
    Scale,
}

impl OperationType {
    /// Whether events of this type can move the live version
    pub fn is_version_transition(&self) -> bool {
        !matches!(self, OperationType::Scale)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "Create",
            OperationType::Deploy => "Deploy",
            OperationType::Promote => "Promote",
            OperationType::Rollback => "Rollback",
            OperationType::Scale => "Scale",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource parameters carried by a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentParameters {
    pub replicas: u32,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub port: u16,
}

impl Default for DeploymentParameters {
    fn default() -> Self {
        Self {
            replicas: 2,
            cpu_limit: "200m".to_string(),
            memory_limit: "256Mi".to_string(),
            port: 8080,
        }
    }
}

/// Immutable history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEvent {
    /// Version live after the event; Scale markers carry the previous version forward
    pub version: String,
    pub operation_type: OperationType,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_environment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub request_id: String,
    pub operation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<u32>,

    #[serde(default)]
    pub tests_required: bool,
}

/// Ledger-owned state of one deployment key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub key: DeploymentKey,

    /// Last version the registry accepted; empty if never deployed
    pub current_version: String,

    /// Version the last accepted intent requested
    pub desired_version: String,

    pub status: DeploymentStatus,
    pub sync_status: SyncStatus,

    #[serde(default)]
    pub health: Option<HealthStatus>,

    /// Append-only, newest last
    pub history: Vec<VersionEvent>,

    #[serde(default)]
    pub in_flight_operation_id: Option<String>,

    /// Bumped on every mutation; the compare-and-set token
    pub revision: u64,

    #[serde(default)]
    pub manifest_ref: Option<CommitRef>,

    #[serde(default)]
    pub application_ref: Option<ApplicationRef>,

    #[serde(default)]
    pub parameters: DeploymentParameters,

    pub auto_sync: bool,

    /// Why the record needs an operator, when it does
    #[serde(default)]
    pub intervention: Option<String>,

    #[serde(default)]
    pub last_operation_id: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// A record that has never been touched by an operation
    pub fn new(key: DeploymentKey) -> Self {
        Self {
            key,
            current_version: String::new(),
            desired_version: String::new(),
            status: DeploymentStatus::Pending,
            sync_status: SyncStatus::Unknown,
            health: None,
            history: Vec::new(),
            in_flight_operation_id: None,
            revision: 0,
            manifest_ref: None,
            application_ref: None,
            parameters: DeploymentParameters::default(),
            auto_sync: true,
            intervention: None,
            last_operation_id: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether any operation has completed against this key
    pub fn is_initialized(&self) -> bool {
        !self.history.is_empty()
    }

    /// History event produced by the given request, if it was applied
    pub fn applied_request(&self, request_id: &str) -> Option<&VersionEvent> {
        self.history.iter().find(|e| e.request_id == request_id)
    }

    /// Versions the key actually moved through, oldest first.
    ///
    /// Scale markers and empty versions are skipped and consecutive repeats
    /// collapse into one transition.
    pub fn version_transitions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = Vec::new();
        for event in &self.history {
            if !event.operation_type.is_version_transition() || event.version.is_empty() {
                continue;
            }
            if versions.last() != Some(&event.version.as_str()) {
                versions.push(event.version.as_str());
            }
        }
        versions
    }

    /// Version a rollback without explicit target should land on
    pub fn previous_version(&self) -> Option<&str> {
        let versions = self.version_transitions();
        if versions.len() < 2 {
            return None;
        }
        Some(versions[versions.len() - 2])
    }
}
