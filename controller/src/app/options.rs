//! Application configuration options

use std::time::Duration;

use crate::reconcile::engine::EngineOptions;
use crate::serializer::SerializerOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::reaper;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Engine configuration
    pub engine: EngineOptions,

    /// Lease configuration
    pub serializer: SerializerOptions,

    /// Lease reaper worker options
    pub reaper: reaper::Options,

    /// Follow registry status streams
    pub enable_status_watcher: bool,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            server: ServerOptions::default(),
            engine: EngineOptions::default(),
            serializer: SerializerOptions::default(),
            reaper: reaper::Options::default(),
            enable_status_watcher: true,
        }
    }
}

impl AppOptions {
    /// Options described by a settings file stored under `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            storage: StorageOptions {
                layout,
                persist_ledger: settings.persist_ledger,
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            engine: settings.engine_options(),
            serializer: settings.serializer_options(),
            reaper: reaper::Options {
                interval: Duration::from_secs(settings.workers.reaper_interval_secs),
            },
            enable_status_watcher: settings.workers.enable_status_watcher,
            ..Default::default()
        }
    }
}

/// Lifecycle options for the reconciler
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone, Default)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Keep the ledger in `ledger.json`
    pub persist_ledger: bool,
}

/// HTTP intake options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}
