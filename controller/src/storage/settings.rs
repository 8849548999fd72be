//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::ControllerError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::reconcile::catalog::CollaboratorEndpoints;
use crate::reconcile::engine::{EngineOptions, ScaleStrategy};
use crate::serializer::SerializerOptions;
use crate::utils::BackoffOptions;

/// Reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// Also write daily log files under the storage logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// HTTP intake configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Engine configuration
    #[serde(default)]
    pub engine: EngineSettings,

    /// Lease configuration
    #[serde(default)]
    pub serializer: SerializerSettings,

    /// Background worker configuration
    #[serde(default)]
    pub workers: WorkerSettings,

    /// Persist the ledger to disk
    #[serde(default = "default_true")]
    pub persist_ledger: bool,

    /// Collaborator locations
    #[serde(default)]
    pub endpoints: CollaboratorEndpoints,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            log_to_file: false,
            server: ServerSettings::default(),
            engine: EngineSettings::default(),
            serializer: SerializerSettings::default(),
            workers: WorkerSettings::default(),
            persist_ledger: true,
            endpoints: CollaboratorEndpoints::default(),
        }
    }
}

impl Settings {
    /// Read settings from `file`; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, ControllerError> {
        if !file.exists().await {
            info!("No settings file at {:?}, using defaults", file.path());
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            ControllerError::ConfigError(format!("invalid settings file {:?}: {}", file.path(), e))
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            call_timeout: Duration::from_secs(self.engine.call_timeout_secs),
            catalog_retries: self.engine.catalog_retries,
            catalog_backoff: BackoffOptions {
                base_delay: Duration::from_millis(self.engine.catalog_backoff_base_ms),
                max_delay: Duration::from_millis(self.engine.catalog_backoff_max_ms),
                ..Default::default()
            },
            scale_strategy: self.engine.scale_strategy,
            endpoints: self.endpoints.clone(),
        }
    }

    pub fn serializer_options(&self) -> SerializerOptions {
        SerializerOptions {
            queue_depth: self.serializer.queue_depth,
            lease_timeout: Duration::from_secs(self.serializer.lease_timeout_secs),
        }
    }
}

/// HTTP intake settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Timeout of a single collaborator call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Catalog retries after the first attempt
    #[serde(default = "default_catalog_retries")]
    pub catalog_retries: u32,

    #[serde(default = "default_catalog_backoff_base")]
    pub catalog_backoff_base_ms: u64,

    #[serde(default = "default_catalog_backoff_max")]
    pub catalog_backoff_max_ms: u64,

    #[serde(default = "default_scale_strategy")]
    pub scale_strategy: ScaleStrategy,
}

fn default_call_timeout() -> u64 {
    30
}

fn default_catalog_retries() -> u32 {
    3
}

fn default_catalog_backoff_base() -> u64 {
    500
}

fn default_catalog_backoff_max() -> u64 {
    10_000
}

fn default_scale_strategy() -> ScaleStrategy {
    ScaleStrategy::ManifestDelta
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            catalog_retries: default_catalog_retries(),
            catalog_backoff_base_ms: default_catalog_backoff_base(),
            catalog_backoff_max_ms: default_catalog_backoff_max(),
            scale_strategy: default_scale_strategy(),
        }
    }
}

/// Lease settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializerSettings {
    /// Waiters allowed behind an active lease; 0 rejects immediately
    #[serde(default)]
    pub queue_depth: usize,

    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,
}

fn default_lease_timeout() -> u64 {
    300
}

impl Default for SerializerSettings {
    fn default() -> Self {
        Self {
            queue_depth: 0,
            lease_timeout_secs: default_lease_timeout(),
        }
    }
}

/// Background worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Interval between expired lease sweeps
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Follow registry status streams for declared deployments
    #[serde(default = "default_true")]
    pub enable_status_watcher: bool,
}

fn default_reaper_interval() -> u64 {
    15
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            reaper_interval_secs: default_reaper_interval(),
            enable_status_watcher: true,
        }
    }
}
