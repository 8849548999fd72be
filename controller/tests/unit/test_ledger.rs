//! Ledger persistence unit tests

use std::path::PathBuf;
use std::sync::Arc;

use reconciler::filesys::file::File;
use reconciler::ledger::journal::LedgerJournal;
use reconciler::ledger::Ledger;
use reconciler::models::deployment::DeploymentStatus;
use reconciler::reconcile::engine::ReconciliationEngine;
use reconciler::serializer::{OperationSerializer, SerializerOptions};
use reconciler::stores::memory::{InMemoryCatalog, InMemoryManifestStore, InMemoryRegistry};
use reconciler::stores::Collaborators;
use reconciler::utils::generate_uuid;

use crate::common::{deploy, fast_options, key};

fn ledger_path() -> PathBuf {
    std::env::temp_dir()
        .join(format!("reconciler-test-{}", generate_uuid()))
        .join("ledger.json")
}

fn engine_over(ledger: Arc<Ledger>) -> Arc<ReconciliationEngine> {
    Arc::new(ReconciliationEngine::new(
        ledger,
        Arc::new(OperationSerializer::new(SerializerOptions::default())),
        Collaborators::new(
            Arc::new(InMemoryManifestStore::new()),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryCatalog::new()),
        ),
        fast_options(),
    ))
}

#[tokio::test]
async fn test_missing_snapshot_loads_empty() {
    let path = ledger_path();
    let ledger = Ledger::load(LedgerJournal::new(File::new(&path))).await.unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_committed_operations_survive_restart() {
    let path = ledger_path();

    let ledger = Arc::new(Ledger::load(LedgerJournal::new(File::new(&path))).await.unwrap());
    let engine = engine_over(ledger);
    engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    engine.submit(deploy("prod", "v2", "req-2")).await.unwrap();

    let reloaded = Ledger::load(LedgerJournal::new(File::new(&path))).await.unwrap();
    let record = reloaded.find(&key("prod")).unwrap();
    assert_eq!(record.current_version, "v2");
    assert_eq!(record.history.len(), 2);
    assert_eq!(record.status, DeploymentStatus::Progressing);

    // Replays keep working after a restart
    let engine = engine_over(Arc::new(reloaded));
    let replay = engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    assert!(replay.replayed);

    let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
}

#[tokio::test]
async fn test_in_flight_record_is_failed_on_load() {
    let path = ledger_path();

    let ledger = Ledger::load(LedgerJournal::new(File::new(&path))).await.unwrap();
    ledger.begin_operation(&key("prod"), "op-crashed");
    ledger.persist().await.unwrap();

    let reloaded = Ledger::load(LedgerJournal::new(File::new(&path))).await.unwrap();
    let record = reloaded.find(&key("prod")).unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.in_flight_operation_id.is_none());

    let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
}

#[tokio::test]
async fn test_unknown_snapshot_format_is_rejected() {
    let path = ledger_path();
    File::new(&path)
        .write_atomic(br#"{"format": 99, "saved_at": "2024-01-01T00:00:00Z", "records": []}"#)
        .await
        .unwrap();

    assert!(Ledger::load(LedgerJournal::new(File::new(&path))).await.is_err());

    let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
}
