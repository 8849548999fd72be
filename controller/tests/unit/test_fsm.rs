//! FSM unit tests

use reconciler::reconcile::fsm::{PipelineEvent, PipelineFsm, PipelineStage};
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_fsm_initial_state() {
    let fsm = PipelineFsm::new();
    assert_eq!(fsm.stage(), PipelineStage::Received);
    assert!(fsm.error().is_none());
    assert!(!fsm.catalog_synced());
}

#[test]
fn test_fsm_manifest_flow() {
    let mut fsm = PipelineFsm::new();

    // Received -> Validated
    fsm.process(PipelineEvent::Validate).unwrap();
    assert_eq!(fsm.stage(), PipelineStage::Validated);

    // Validated -> ManifestWritten -> RegistryUpdated
    fsm.process(PipelineEvent::ManifestWritten).unwrap();
    fsm.process(PipelineEvent::RegistryUpdated).unwrap();
    assert_eq!(fsm.stage(), PipelineStage::RegistryUpdated);

    // RegistryUpdated -> CatalogUpdated -> Complete
    fsm.process(PipelineEvent::CatalogUpdated { synced: true }).unwrap();
    fsm.process(PipelineEvent::Commit).unwrap();
    assert_eq!(fsm.stage(), PipelineStage::Complete);
    assert!(fsm.stage().is_terminal());
}

#[test]
fn test_fsm_registry_patch_flow() {
    let mut fsm = PipelineFsm::new();

    assert_ok!(fsm.process(PipelineEvent::Validate));
    let stage = assert_ok!(fsm.process(PipelineEvent::RegistryUpdated));
    assert_eq!(stage, PipelineStage::RegistryUpdated);
}

#[test]
fn test_fsm_catalog_gap() {
    let mut fsm = PipelineFsm::new();

    fsm.process(PipelineEvent::Validate).unwrap();
    fsm.process(PipelineEvent::ManifestWritten).unwrap();
    fsm.process(PipelineEvent::RegistryUpdated).unwrap();
    fsm.process(PipelineEvent::CatalogUpdated { synced: false }).unwrap();
    fsm.process(PipelineEvent::Commit).unwrap();

    assert_eq!(fsm.stage(), PipelineStage::Complete);
    assert!(!fsm.catalog_synced());
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = PipelineFsm::new();

    // Cannot write a manifest before validation
    assert_err!(fsm.process(PipelineEvent::ManifestWritten));
    assert_eq!(fsm.stage(), PipelineStage::Received);

    // Nothing follows Complete
    fsm.process(PipelineEvent::Validate).unwrap();
    fsm.process(PipelineEvent::ManifestWritten).unwrap();
    fsm.process(PipelineEvent::RegistryUpdated).unwrap();
    fsm.process(PipelineEvent::CatalogUpdated { synced: true }).unwrap();
    fsm.process(PipelineEvent::Commit).unwrap();
    assert_err!(fsm.process(PipelineEvent::CompensationFailed("late".to_string())));
    assert!(fsm.error().is_none());
}

#[test]
fn test_stage_names() {
    assert_eq!(PipelineStage::ManifestWritten.to_string(), "ManifestWritten");
    assert_eq!(
        serde_json::to_string(&PipelineStage::CompensationFailed).unwrap(),
        "\"CompensationFailed\""
    );
    assert!(!PipelineStage::CatalogUpdated.is_terminal());
}
