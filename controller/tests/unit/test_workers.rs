//! Worker unit tests

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use reconciler::ledger::Ledger;
use reconciler::models::deployment::{DeploymentStatus, HealthStatus, SyncStatus};
use reconciler::reconcile::engine::ReconciliationEngine;
use reconciler::serializer::{OperationSerializer, SerializerOptions};
use reconciler::stores::memory::{InMemoryCatalog, InMemoryManifestStore, InMemoryRegistry};
use reconciler::stores::{Collaborators, RegistryStatus};
use reconciler::workers::{reaper, status};

use crate::common::{deploy, fast_options, key, Harness};

#[tokio::test]
async fn test_status_watcher_applies_registry_reports() {
    let registry = Arc::new(InMemoryRegistry::new());
    let (declared_tx, declared_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(
        ReconciliationEngine::new(
            Arc::new(Ledger::new()),
            Arc::new(OperationSerializer::new(SerializerOptions::default())),
            Collaborators::new(
                Arc::new(InMemoryManifestStore::new()),
                registry.clone(),
                Arc::new(InMemoryCatalog::new()),
            ),
            fast_options(),
        )
        .with_declared_keys(declared_tx),
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let watcher = tokio::spawn(status::run(
        engine.clone(),
        declared_rx,
        Box::pin(async move {
            let _ = shutdown_rx.await;
        }),
    ));

    engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();

    // The watcher subscribes asynchronously; keep reporting until it lands
    let report = RegistryStatus {
        sync_status: SyncStatus::InSync,
        health: HealthStatus::Healthy,
    };
    let mut synced = false;
    for _ in 0..50 {
        registry.push_status(&key("prod"), report);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if engine.record(&key("prod")).unwrap().status == DeploymentStatus::Synced {
            synced = true;
            break;
        }
    }
    assert!(synced);

    shutdown_tx.send(()).unwrap();
    watcher.await.unwrap();
}

#[tokio::test]
async fn test_reaper_fails_stuck_operation() {
    let h = Harness::build(
        fast_options(),
        SerializerOptions {
            lease_timeout: Duration::from_millis(30),
            ..Default::default()
        },
        InMemoryRegistry::new(),
    );
    h.manifests.set_write_delay(Duration::from_millis(300));

    let engine = h.engine.clone();
    let stuck = tokio::spawn(async move { engine.submit(deploy("prod", "v1", "req-1")).await });

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let engine = h.engine.clone();
    let worker = tokio::spawn(async move {
        reaper::run(
            &reaper::Options {
                interval: Duration::from_millis(10),
            },
            engine.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.await;
            }),
        )
        .await;
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.in_flight_operation_id.is_none());

    shutdown_tx.send(()).unwrap();
    worker.await.unwrap();
    assert!(stuck.await.unwrap().is_err());
}
