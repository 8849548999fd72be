//! Reconciliation engine unit tests

use std::time::Duration;

use reconciler::errors::{RejectionKind, SubmitError};
use reconciler::models::deployment::{
    DeploymentStatus, HealthStatus, OperationType, SyncStatus,
};
use reconciler::models::operation::{Operation, OperationParameters};
use reconciler::reconcile::engine::{EngineOptions, ScaleStrategy};
use reconciler::reconcile::fsm::PipelineStage;
use reconciler::serializer::SerializerOptions;
use reconciler::stores::memory::InMemoryRegistry;
use reconciler::stores::{RegistryStatus, StoreError, StoreKind};

use tokio_test::{assert_err, assert_ok};

use crate::common::{create, deploy, fast_options, key, promote, rollback, scale, Harness};

fn healthy() -> RegistryStatus {
    RegistryStatus {
        sync_status: SyncStatus::InSync,
        health: HealthStatus::Healthy,
    }
}

// ================================= DEPLOY ======================================= //

#[tokio::test]
async fn test_deploy_commits_across_all_stores() {
    let h = Harness::new();

    let outcome = assert_ok!(h.engine.submit(deploy("prod", "v1", "req-1")).await);
    assert!(!outcome.replayed);
    assert!(outcome.catalog_synced);

    let record = outcome.record;
    assert_eq!(record.current_version, "v1");
    assert_eq!(record.desired_version, "v1");
    assert_eq!(record.status, DeploymentStatus::Progressing);
    assert_eq!(record.sync_status, SyncStatus::OutOfSync);
    assert_eq!(record.history.len(), 1);
    assert!(record.in_flight_operation_id.is_none());
    assert_eq!(record.last_operation_id.as_deref(), Some(outcome.operation_id.as_str()));

    let head = h.manifests.head(&key("prod")).unwrap();
    assert_eq!(head.version, "v1");
    assert_eq!(record.manifest_ref.as_ref(), Some(&head.commit));

    let app = h.registry.application(&key("prod")).unwrap();
    assert_eq!(app.manifest_ref, head.commit);
    assert!(app.auto_sync);

    let entity = h.catalog.entity("payments-prod").unwrap();
    assert_eq!(entity.entity_type, "deployment");
    assert_eq!(entity.properties["version"], "v1");
    assert_eq!(entity.properties["status"], DeploymentStatus::Progressing.as_str());
}

#[tokio::test]
async fn test_last_version_wins_across_scale() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap();
    h.engine.submit(scale("prod", 4, "req-3")).await.unwrap();
    h.engine.submit(deploy("prod", "v3", "req-4")).await.unwrap();
    let record = h.engine.submit(scale("prod", 6, "req-5")).await.unwrap().record;

    assert_eq!(record.current_version, "v3");
    assert_eq!(record.desired_version, "v3");
    assert_eq!(record.parameters.replicas, 6);
    assert_eq!(record.history.len(), 5);
    assert_eq!(record.version_transitions(), vec!["v1", "v2", "v3"]);
}

#[tokio::test]
async fn test_deploy_keeps_manual_sync() {
    let h = Harness::new();

    let manual = Operation::deploy(
        key("prod"),
        "v1",
        OperationParameters {
            auto_sync: Some(false),
            ..Default::default()
        },
        "req-1",
    )
    .unwrap();
    h.engine.submit(manual).await.unwrap();
    assert!(!h.registry.application(&key("prod")).unwrap().auto_sync);

    // A later deploy that does not mention sync keeps it manual
    let record = h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap().record;
    assert!(!record.auto_sync);
    assert!(!h.registry.application(&key("prod")).unwrap().auto_sync);
}

#[tokio::test]
async fn test_deploy_replay_returns_existing_record() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-a")).await.unwrap();
    h.engine.submit(deploy("prod", "v2", "req-b")).await.unwrap();

    let replay = h.engine.submit(deploy("prod", "v1", "req-a")).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.record.current_version, "v2");
    assert_eq!(replay.record.history.len(), 2);
    assert_eq!(h.manifests.writes().len(), 2);
}

// ================================= CREATE ======================================= //

#[tokio::test]
async fn test_create_writes_service_and_deployment_entities() {
    let h = Harness::new();

    let record = h.engine.submit(create("dev", "run-1")).await.unwrap().record;
    assert_eq!(record.current_version, "v1");
    assert_eq!(record.history[0].operation_type, OperationType::Create);

    let service = h.catalog.entity("payments").unwrap();
    assert_eq!(service.entity_type, "microservice");
    assert_eq!(service.properties["team"], "platform");
    assert!(h.catalog.entity("payments-dev").is_some());
}

#[tokio::test]
async fn test_create_replay_is_idempotent() {
    let h = Harness::new();

    let first = h.engine.submit(create("dev", "run-1")).await.unwrap();
    let second = h.engine.submit(create("dev", "run-1")).await.unwrap();

    assert!(second.replayed);
    assert_eq!(second.operation_id, first.operation_id);
    assert_eq!(second.record.history.len(), 1);
    assert_eq!(h.manifests.writes().len(), 1);
}

#[tokio::test]
async fn test_create_existing_service_is_rejected() {
    let h = Harness::new();

    h.engine.submit(create("dev", "run-1")).await.unwrap();
    let err = assert_err!(h.engine.submit(create("dev", "run-2")).await);

    assert_eq!(err.kind(), RejectionKind::Precondition);
    assert_eq!(h.manifests.writes().len(), 1);
}

// ================================= PROMOTE ====================================== //

#[tokio::test]
async fn test_promote_uses_source_version_from_ledger() {
    let h = Harness::new();

    h.engine.submit(deploy("staging", "v3", "req-1")).await.unwrap();
    h.engine.apply_status(&key("staging"), healthy()).await.unwrap();

    // The hint is stale; the ledger's version wins
    let record = h
        .engine
        .submit(promote("staging", "prod", Some("v9"), "req-2"))
        .await
        .unwrap()
        .record;

    assert_eq!(record.current_version, "v3");
    assert_eq!(record.status, DeploymentStatus::Progressing);
    let event = record.history.last().unwrap();
    assert_eq!(event.operation_type, OperationType::Promote);
    assert_eq!(event.source_environment.as_deref(), Some("staging"));

    let entity = h.catalog.entity("payments-prod").unwrap();
    assert_eq!(entity.properties["promoted_from"], "staging");
}

#[tokio::test]
async fn test_promote_from_missing_source_writes_nothing() {
    let h = Harness::new();

    let err = h
        .engine
        .submit(promote("staging", "prod", None, "req-1"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), RejectionKind::Precondition);
    assert_eq!(err.stage(), PipelineStage::Validated);
    assert!(h.manifests.writes().is_empty());
    assert!(h.registry.application(&key("prod")).is_none());
    assert_eq!(h.catalog.attempts(), 0);
    assert!(h.ledger.find(&key("prod")).is_none());
}

#[tokio::test]
async fn test_promote_from_unsettled_source_is_rejected() {
    let h = Harness::new();

    // Still Progressing, never reported healthy
    h.engine.submit(deploy("staging", "v3", "req-1")).await.unwrap();

    let err = h
        .engine
        .submit(promote("staging", "prod", None, "req-2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);
    assert_eq!(h.manifests.writes().len(), 1);
}

// ================================= ROLLBACK ===================================== //

#[tokio::test]
async fn test_rollback_skips_scale_markers() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap();
    h.engine.submit(scale("prod", 5, "req-3")).await.unwrap();
    h.engine.submit(deploy("prod", "v4", "req-4")).await.unwrap();

    let record = h
        .engine
        .submit(rollback("prod", None, "req-5"))
        .await
        .unwrap()
        .record;

    assert_eq!(record.current_version, "v2");
    assert_eq!(record.desired_version, "v2");
    assert_eq!(record.status, DeploymentStatus::RolledBack);
    let event = record.history.last().unwrap();
    assert_eq!(event.operation_type, OperationType::Rollback);
    assert_eq!(event.reason.as_deref(), Some("bad release"));
    assert_eq!(h.manifests.head(&key("prod")).unwrap().version, "v2");
}

#[tokio::test]
async fn test_rollback_to_explicit_target() {
    let h = Harness::new();

    for (i, version) in ["v1", "v2", "v3"].iter().enumerate() {
        h.engine
            .submit(deploy("prod", version, &format!("req-{}", i)))
            .await
            .unwrap();
    }

    let record = h
        .engine
        .submit(rollback("prod", Some("v1"), "req-rb"))
        .await
        .unwrap()
        .record;
    assert_eq!(record.current_version, "v1");
}

#[tokio::test]
async fn test_rollback_rejections() {
    let h = Harness::new();

    // Unknown key
    let err = h.engine.submit(rollback("prod", None, "req-1")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);
    assert!(h.ledger.find(&key("prod")).is_none());

    // Single version
    h.engine.submit(deploy("prod", "v1", "req-2")).await.unwrap();
    let err = h.engine.submit(rollback("prod", None, "req-3")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);

    // Target already live, and target never deployed
    h.engine.submit(deploy("prod", "v2", "req-4")).await.unwrap();
    let err = h
        .engine
        .submit(rollback("prod", Some("v2"), "req-5"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);
    let err = h
        .engine
        .submit(rollback("prod", Some("v7"), "req-6"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);

    assert_eq!(h.manifests.writes().len(), 2);
    assert_eq!(h.ledger.find(&key("prod")).unwrap().current_version, "v2");
}

// ================================== SCALE ======================================= //

#[tokio::test]
async fn test_scale_writes_manifest_at_current_version() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    h.engine.apply_status(&key("prod"), healthy()).await.unwrap();

    let record = h.engine.submit(scale("prod", 5, "req-2")).await.unwrap().record;

    assert_eq!(h.manifests.writes().last().unwrap().1, "v1");
    assert_eq!(h.manifests.head(&key("prod")).unwrap().parameters.replicas, 5);
    assert_eq!(record.parameters.replicas, 5);
    assert_eq!(record.current_version, "v1");
    // Scaling does not reset a settled status
    assert_eq!(record.status, DeploymentStatus::Synced);
    assert_eq!(record.history.last().unwrap().replicas, Some(5));
}

#[tokio::test]
async fn test_scale_through_registry_patch() {
    let h = Harness::build(
        EngineOptions {
            scale_strategy: ScaleStrategy::RegistryPatch,
            ..fast_options()
        },
        SerializerOptions::default(),
        InMemoryRegistry::with_resource_patching(),
    );

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    let commit = h.manifests.head(&key("prod")).unwrap().commit;

    let record = h.engine.submit(scale("prod", 5, "req-2")).await.unwrap().record;

    assert_eq!(h.manifests.writes().len(), 1);
    assert_eq!(record.manifest_ref, Some(commit));
    assert_eq!(record.parameters.replicas, 5);
    let app = h.registry.application(&key("prod")).unwrap();
    assert_eq!(app.patched.unwrap().replicas, 5);
}

#[tokio::test]
async fn test_scale_patch_falls_back_without_registry_support() {
    let h = Harness::build(
        EngineOptions {
            scale_strategy: ScaleStrategy::RegistryPatch,
            ..fast_options()
        },
        SerializerOptions::default(),
        InMemoryRegistry::new(),
    );

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    h.engine.submit(scale("prod", 5, "req-2")).await.unwrap();

    assert_eq!(h.manifests.writes().len(), 2);
}

#[tokio::test]
async fn test_scale_undeployed_key_is_rejected() {
    let h = Harness::new();

    let err = h.engine.submit(scale("prod", 5, "req-1")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);
    assert!(h.manifests.writes().is_empty());
}

// ================================ FAILURES ====================================== //

#[tokio::test]
async fn test_manifest_failure_leaves_ledger_untouched() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    let before = h.ledger.find(&key("prod")).unwrap();

    h.manifests.fail_next_writes(1);
    let err = h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap_err();

    match &err {
        SubmitError::Store { stage, store, .. } => {
            assert_eq!(*stage, PipelineStage::Validated);
            assert_eq!(*store, StoreKind::ManifestStore);
        }
        other => panic!("expected store error, got {:?}", other),
    }
    assert!(err.is_retryable());

    let after = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(after.current_version, "v1");
    assert_eq!(after.desired_version, "v1");
    assert_eq!(after.history, before.history);
    assert!(after.in_flight_operation_id.is_none());
    assert_eq!(
        h.registry.application(&key("prod")).unwrap().manifest_ref,
        before.manifest_ref.unwrap()
    );
}

#[tokio::test]
async fn test_registry_failure_reverts_to_prior_commit() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    let prior = h.ledger.find(&key("prod")).unwrap().manifest_ref;

    h.registry.fail_next_declares(1);
    let err = h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap_err();

    match &err {
        SubmitError::Store { stage, store, .. } => {
            assert_eq!(*stage, PipelineStage::ManifestWritten);
            assert_eq!(*store, StoreKind::ApplicationRegistry);
        }
        other => panic!("expected store error, got {:?}", other),
    }

    assert_eq!(h.manifests.reverts().last().unwrap(), &(key("prod"), prior));
    assert_eq!(h.manifests.head(&key("prod")).unwrap().version, "v1");

    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.current_version, "v1");
    assert_eq!(record.desired_version, "v1");
    assert_eq!(record.history.len(), 1);
}

#[tokio::test]
async fn test_first_deploy_registry_failure_removes_manifest() {
    let h = Harness::new();

    h.registry.fail_next_declares(1);
    let err = h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap_err();

    assert_eq!(err.kind(), RejectionKind::Store);
    assert_eq!(h.manifests.reverts(), vec![(key("prod"), None)]);
    assert!(h.manifests.head(&key("prod")).is_none());
}

#[tokio::test]
async fn test_compensation_failure_requires_intervention() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();

    h.registry.fail_next_declares(1);
    h.manifests.fail_next_reverts(1);
    let err = h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::CompensationFailed);

    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.status, DeploymentStatus::CompensationFailed);
    assert!(record.intervention.is_some());
    assert!(record.in_flight_operation_id.is_none());
    let entity = h.catalog.entity("payments-prod").unwrap();
    assert!(entity.properties.get("intervention").is_some());

    // Registry reports do not clear the flag
    let record = h.engine.apply_status(&key("prod"), healthy()).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::CompensationFailed);

    let err = h.engine.submit(deploy("prod", "v3", "req-3")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);

    let resolved = h.engine.resolve_intervention(&key("prod")).await.unwrap();
    assert_eq!(resolved.status, DeploymentStatus::Failed);
    assert!(resolved.intervention.is_none());

    let record = h.engine.submit(deploy("prod", "v3", "req-3")).await.unwrap().record;
    assert_eq!(record.current_version, "v3");
    assert_eq!(record.status, DeploymentStatus::Progressing);
}

#[tokio::test]
async fn test_resolve_without_intervention_is_rejected() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    let err = h.engine.resolve_intervention(&key("prod")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);

    let err = h.engine.resolve_intervention(&key("qa")).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);
}

#[tokio::test]
async fn test_catalog_gap_does_not_fail_operation() {
    let h = Harness::new();

    // First attempt plus three retries
    h.catalog.fail_next_upserts(4);
    let outcome = h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();

    assert!(!outcome.catalog_synced);
    assert_eq!(outcome.record.current_version, "v1");
    assert_eq!(h.catalog.attempts(), 4);
    assert!(h.catalog.entity("payments-prod").is_none());
}

#[tokio::test]
async fn test_catalog_transient_failure_is_retried() {
    let h = Harness::new();

    h.catalog.fail_next_upserts(2);
    let outcome = h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();

    assert!(outcome.catalog_synced);
    assert_eq!(h.catalog.attempts(), 3);
    assert_eq!(h.catalog.entity("payments-prod").unwrap().properties["version"], "v1");
}

#[tokio::test]
async fn test_collaborator_timeout_is_store_error() {
    let h = Harness::build(
        EngineOptions {
            call_timeout: Duration::from_millis(50),
            ..fast_options()
        },
        SerializerOptions::default(),
        InMemoryRegistry::new(),
    );

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    h.manifests.set_write_delay(Duration::from_millis(300));

    let err = h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap_err();
    match err {
        SubmitError::Store { source, .. } => assert!(matches!(source, StoreError::Timeout(_))),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(h.ledger.find(&key("prod")).unwrap().current_version, "v1");
}

// =============================== CONCURRENCY ==================================== //

#[tokio::test]
async fn test_concurrent_submits_on_one_key() {
    let h = Harness::new();
    h.manifests.set_write_delay(Duration::from_millis(100));

    let (a, b) = tokio::join!(
        h.engine.submit(deploy("prod", "v1", "req-1")),
        h.engine.submit(deploy("prod", "v2", "req-2")),
    );

    let (ok, busy) = match (a, b) {
        (Ok(ok), Err(busy)) | (Err(busy), Ok(ok)) => (ok, busy),
        other => panic!("expected one success and one busy, got {:?}", other),
    };
    assert_eq!(busy.kind(), RejectionKind::Busy);
    assert_eq!(busy.stage(), PipelineStage::Validated);
    assert!(busy.is_retryable());
    assert_eq!(ok.record.history.len(), 1);
    assert_eq!(h.manifests.writes().len(), 1);
}

#[tokio::test]
async fn test_concurrent_submits_on_different_keys() {
    let h = Harness::new();
    h.manifests.set_write_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(
        h.engine.submit(deploy("staging", "v1", "req-1")),
        h.engine.submit(deploy("prod", "v1", "req-2")),
    );
    assert!(a.is_ok());
    assert!(b.is_ok());
}

#[tokio::test]
async fn test_queued_submit_runs_after_holder() {
    let h = Harness::build(
        fast_options(),
        SerializerOptions {
            queue_depth: 1,
            ..Default::default()
        },
        InMemoryRegistry::new(),
    );
    h.manifests.set_write_delay(Duration::from_millis(50));

    let (a, b) = tokio::join!(
        h.engine.submit(deploy("prod", "v1", "req-1")),
        h.engine.submit(deploy("prod", "v2", "req-2")),
    );
    a.unwrap();
    b.unwrap();

    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.history.len(), 2);
    assert_eq!(record.current_version, "v2");
}

#[tokio::test]
async fn test_expired_lease_marks_record_failed() {
    let h = Harness::build(
        fast_options(),
        SerializerOptions {
            lease_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        InMemoryRegistry::new(),
    );
    h.manifests.set_write_delay(Duration::from_millis(250));

    let engine = h.engine.clone();
    let stuck = tokio::spawn(async move { engine.submit(deploy("prod", "v1", "req-1")).await });

    tokio::time::sleep(Duration::from_millis(120)).await;
    let reaped = h.engine.reap_expired().await;
    assert_eq!(reaped, vec![key("prod")]);

    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.in_flight_operation_id.is_none());

    // The late pipeline cannot commit over the reclaimed record
    let err = stuck.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), RejectionKind::Precondition);
    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert!(record.history.is_empty());
}

#[tokio::test]
async fn test_superseded_pipeline_leaves_catalog_matching_ledger() {
    let h = Harness::build(
        fast_options(),
        SerializerOptions {
            lease_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        InMemoryRegistry::new(),
    );
    h.manifests.set_write_delay(Duration::from_millis(250));

    let engine = h.engine.clone();
    let stuck = tokio::spawn(async move { engine.submit(deploy("prod", "v1", "req-1")).await });

    tokio::time::sleep(Duration::from_millis(120)).await;
    h.engine.reap_expired().await;
    assert_err!(stuck.await.unwrap());

    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.status, DeploymentStatus::Failed);
    assert_eq!(record.current_version, "");

    let entity = h.catalog.entity("payments-prod").unwrap();
    assert_eq!(entity.properties["status"], record.status.as_str());
    assert_eq!(entity.properties["version"], record.current_version.as_str());

    // The stores did take the late write, so the ledger must point at it
    let head = h.manifests.head(&key("prod")).unwrap();
    assert_eq!(record.manifest_ref, Some(head.commit.clone()));
    assert!(record.application_ref.is_some());
    assert_eq!(h.registry.application(&key("prod")).unwrap().manifest_ref, head.commit);
}

#[tokio::test]
async fn test_aborted_caller_still_completes() {
    let h = Harness::new();
    h.registry.set_declare_delay(Duration::from_millis(200));

    let engine = h.engine.clone();
    let caller = tokio::spawn(async move { engine.submit(deploy("prod", "v1", "req-1")).await });

    // Give up while the registry declare is in progress
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.manifests.head(&key("prod")).is_some());
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let record = h.ledger.find(&key("prod")).unwrap();
    assert_eq!(record.current_version, "v1");
    assert_eq!(record.status, DeploymentStatus::Progressing);
    assert!(record.in_flight_operation_id.is_none());
    assert_eq!(h.catalog.entity("payments-prod").unwrap().properties["version"], "v1");

    // The key is free again
    assert_ok!(h.engine.submit(deploy("prod", "v2", "req-2")).await);
}

// ================================= STATUS ======================================= //

#[tokio::test]
async fn test_apply_status_transitions() {
    let h = Harness::new();

    assert!(h.engine.apply_status(&key("prod"), healthy()).await.is_none());

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    let record = h.engine.apply_status(&key("prod"), healthy()).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::Synced);
    assert_eq!(record.sync_status, SyncStatus::InSync);
    assert_eq!(record.health, Some(HealthStatus::Healthy));

    let record = h
        .engine
        .apply_status(
            &key("prod"),
            RegistryStatus {
                sync_status: SyncStatus::InSync,
                health: HealthStatus::Degraded,
            },
        )
        .await
        .unwrap();
    assert_eq!(record.status, DeploymentStatus::Degraded);
    assert_eq!(
        h.catalog.entity("payments-prod").unwrap().properties["health"],
        HealthStatus::Degraded.as_str()
    );
}

#[tokio::test]
async fn test_healthy_report_does_not_sync_undeployed_record() {
    let h = Harness::new();

    h.manifests.fail_next_writes(1);
    assert_err!(h.engine.submit(deploy("prod", "v1", "req-1")).await);
    let before = h.ledger.find(&key("prod")).unwrap();
    assert!(!before.is_initialized());

    let record = h.engine.apply_status(&key("prod"), healthy()).await.unwrap();
    assert_eq!(record.status, before.status);
    assert_ne!(record.status, DeploymentStatus::Synced);
    assert_eq!(record.current_version, "");
    assert_eq!(record.sync_status, SyncStatus::InSync);
    assert_eq!(record.health, Some(HealthStatus::Healthy));
}

#[tokio::test]
async fn test_rolled_back_status_survives_healthy_report() {
    let h = Harness::new();

    h.engine.submit(deploy("prod", "v1", "req-1")).await.unwrap();
    h.engine.submit(deploy("prod", "v2", "req-2")).await.unwrap();
    h.engine.submit(rollback("prod", None, "req-3")).await.unwrap();

    let record = h.engine.apply_status(&key("prod"), healthy()).await.unwrap();
    assert_eq!(record.status, DeploymentStatus::RolledBack);
}
