//! Shared fixtures: an engine wired to in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use reconciler::ledger::Ledger;
use reconciler::models::deployment::DeploymentKey;
use reconciler::models::operation::{Operation, OperationParameters, ServiceScaffold};
use reconciler::reconcile::engine::{EngineOptions, ReconciliationEngine};
use reconciler::serializer::{OperationSerializer, SerializerOptions};
use reconciler::stores::memory::{InMemoryCatalog, InMemoryManifestStore, InMemoryRegistry};
use reconciler::stores::Collaborators;
use reconciler::utils::BackoffOptions;

pub struct Harness {
    pub manifests: Arc<InMemoryManifestStore>,
    pub registry: Arc<InMemoryRegistry>,
    pub catalog: Arc<InMemoryCatalog>,
    pub ledger: Arc<Ledger>,
    pub engine: Arc<ReconciliationEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(
            fast_options(),
            SerializerOptions::default(),
            InMemoryRegistry::new(),
        )
    }

    pub fn build(
        options: EngineOptions,
        serializer: SerializerOptions,
        registry: InMemoryRegistry,
    ) -> Self {
        let manifests = Arc::new(InMemoryManifestStore::new());
        let registry = Arc::new(registry);
        let catalog = Arc::new(InMemoryCatalog::new());
        let ledger = Arc::new(Ledger::new());
        let engine = Arc::new(ReconciliationEngine::new(
            ledger.clone(),
            Arc::new(OperationSerializer::new(serializer)),
            Collaborators::new(manifests.clone(), registry.clone(), catalog.clone()),
            options,
        ));
        Self {
            manifests,
            registry,
            catalog,
            ledger,
            engine,
        }
    }
}

/// Engine options with millisecond catalog backoff
pub fn fast_options() -> EngineOptions {
    EngineOptions {
        call_timeout: Duration::from_secs(2),
        catalog_retries: 3,
        catalog_backoff: BackoffOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn key(environment: &str) -> DeploymentKey {
    DeploymentKey::new("payments", environment)
}

pub fn create(environment: &str, request_id: &str) -> Operation {
    Operation::create(
        key(environment),
        Some("v1".to_string()),
        ServiceScaffold {
            team: "platform".to_string(),
            language: "rust".to_string(),
            framework: "axum".to_string(),
            template: "basic".to_string(),
        },
        OperationParameters::default(),
        request_id,
    )
    .unwrap()
}

pub fn deploy(environment: &str, version: &str, request_id: &str) -> Operation {
    Operation::deploy(
        key(environment),
        version,
        OperationParameters::default(),
        request_id,
    )
    .unwrap()
}

pub fn scale(environment: &str, replicas: u32, request_id: &str) -> Operation {
    Operation::scale(
        key(environment),
        OperationParameters {
            replicas: Some(replicas),
            ..Default::default()
        },
        request_id,
    )
    .unwrap()
}

pub fn rollback(environment: &str, target: Option<&str>, request_id: &str) -> Operation {
    Operation::rollback(
        key(environment),
        target.map(str::to_string),
        Some("bad release".to_string()),
        request_id,
    )
    .unwrap()
}

pub fn promote(source: &str, target: &str, hint: Option<&str>, request_id: &str) -> Operation {
    Operation::promote(
        key(target),
        source,
        hint.map(str::to_string),
        OperationParameters::default(),
        request_id,
    )
    .unwrap()
}
