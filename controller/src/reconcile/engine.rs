//! Reconciliation engine
//!
//! Drives one validated [`Operation`] through the ordered pipeline
//!
//! ```text
//! Validated -> ManifestWritten -> RegistryUpdated -> CatalogUpdated -> Complete
//! ```
//!
//! holding the key's lease throughout. A manifest failure leaves the ledger
//! untouched. A registry failure reverts the manifest to the prior commit, and
//! a failed revert parks the record in `CompensationFailed` until an operator
//! resolves it. Catalog failures only produce a logged gap.
//!
//! Once the manifest write has been issued the pipeline runs on its own task,
//! so a caller that goes away cannot stop it half way.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::SubmitError;
use crate::ledger::{CasResult, Ledger, RecordUpdate};
use crate::models::deployment::{
    DeploymentKey, DeploymentParameters, DeploymentRecord, DeploymentStatus, HealthStatus,
    SyncStatus, VersionEvent,
};
use crate::models::operation::{Operation, OperationKind};
use crate::reconcile::catalog::{
    deployment_properties, microservice_properties, upsert_with_retry, CatalogRetry,
    CollaboratorEndpoints, DEPLOYMENT_ENTITY, MICROSERVICE_ENTITY,
};
use crate::reconcile::fsm::{PipelineEvent, PipelineFsm, PipelineStage};
use crate::serializer::{Busy, LeaseGuard, OperationSerializer};
use crate::stores::{ApplicationRef, Collaborators, CommitRef, RegistryStatus, StoreError, StoreKind};
use crate::utils::{generate_uuid, BackoffOptions};

/// How Scale reaches the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleStrategy {
    /// Write a manifest at the current version with the new parameters
    ManifestDelta,

    /// Patch resources in the registry directly, when it supports that
    RegistryPatch,
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Timeout applied to every collaborator call
    pub call_timeout: Duration,

    /// Catalog retries after the first attempt
    pub catalog_retries: u32,
    pub catalog_backoff: BackoffOptions,

    pub scale_strategy: ScaleStrategy,
    pub endpoints: CollaboratorEndpoints,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            catalog_retries: 3,
            catalog_backoff: BackoffOptions::default(),
            scale_strategy: ScaleStrategy::ManifestDelta,
            endpoints: CollaboratorEndpoints::default(),
        }
    }
}

/// Accepted submission
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub operation_id: String,

    /// Ledger snapshot after the operation
    pub record: DeploymentRecord,

    /// The request had already been applied; nothing was written
    pub replayed: bool,

    /// False when the catalog mirror could not be written
    pub catalog_synced: bool,
}

/// What preflight resolved for an accepted operation
struct Plan {
    operation: Operation,
    operation_id: String,
    target_version: String,

    /// Status to commit; `None` leaves it alone
    status: Option<DeploymentStatus>,
    parameters: DeploymentParameters,
    auto_sync: bool,
    patch_resources: bool,
    source_environment: Option<String>,
    reason: Option<String>,

    /// Record as it was when the operation began
    prior: DeploymentRecord,
}

/// Clears the in-flight marker, then releases the lease, on every exit path
struct OperationScope {
    ledger: Arc<Ledger>,
    key: DeploymentKey,
    operation_id: String,
    lease: LeaseGuard,
}

impl Drop for OperationScope {
    fn drop(&mut self) {
        self.ledger.end_operation(&self.key, &self.operation_id);
    }
}

pub struct ReconciliationEngine {
    ledger: Arc<Ledger>,
    serializer: Arc<OperationSerializer>,
    collaborators: Collaborators,
    options: EngineOptions,
    declared: Option<mpsc::UnboundedSender<DeploymentKey>>,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        serializer: Arc<OperationSerializer>,
        collaborators: Collaborators,
        options: EngineOptions,
    ) -> Self {
        Self {
            ledger,
            serializer,
            collaborators,
            options,
            declared: None,
        }
    }

    /// Announce every key declared in the registry on `tx`
    pub fn with_declared_keys(mut self, tx: mpsc::UnboundedSender<DeploymentKey>) -> Self {
        self.declared = Some(tx);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn serializer(&self) -> &Arc<OperationSerializer> {
        &self.serializer
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn record(&self, key: &DeploymentKey) -> Option<DeploymentRecord> {
        self.ledger.find(key)
    }

    pub fn records(&self) -> Vec<DeploymentRecord> {
        self.ledger.list()
    }

    /// Submit a validated operation
    pub async fn submit(self: &Arc<Self>, operation: Operation) -> Result<SubmitOutcome, SubmitError> {
        let key = operation.key().clone();
        if let Some(outcome) = self.replay(&operation) {
            return Ok(outcome);
        }

        let operation_id = generate_uuid();
        let lease = self
            .serializer
            .acquire_guard(&key, &operation_id)
            .await
            .map_err(|busy| self.busy(busy))?;

        // The same request may have completed while this call waited
        if let Some(outcome) = self.replay(&operation) {
            return Ok(outcome);
        }

        let mut plan = self.preflight(operation, operation_id)?;
        plan.prior = self.ledger.begin_operation(&key, &plan.operation_id);
        let scope = OperationScope {
            ledger: self.ledger.clone(),
            key,
            operation_id: plan.operation_id.clone(),
            lease,
        };

        let engine = self.clone();
        let pipeline = tokio::spawn(async move { engine.run_pipeline(plan, scope).await });
        match pipeline.await {
            Ok(result) => result,
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        }
    }

    /// Apply a registry sync/health report to the ledger and mirror it
    pub async fn apply_status(
        &self,
        key: &DeploymentKey,
        report: RegistryStatus,
    ) -> Option<DeploymentRecord> {
        let (previous, updated) = loop {
            let Some(record) = self.ledger.find(key) else {
                debug!("Ignoring registry status for unknown deployment {}", key);
                return None;
            };
            if record.status == DeploymentStatus::CompensationFailed {
                debug!("{} awaits intervention, ignoring registry status", key);
                return Some(record);
            }

            // Nothing committed yet, so there is no deployment to call synced
            let status = if record.is_initialized() {
                status_from_report(record.status, report)
            } else {
                record.status
            };
            let update = RecordUpdate::new()
                .sync_status(report.sync_status)
                .health(report.health)
                .status(status);
            match self.ledger.compare_and_set(key, record.revision, update) {
                CasResult::Success(updated) => break (record.status, updated),
                CasResult::RevisionMismatch { .. } => continue,
                CasResult::NotFound => return None,
            }
        };

        if previous != updated.status {
            info!(
                "Deployment {} is now {} ({}/{})",
                key,
                updated.status.as_str(),
                report.sync_status.as_str(),
                report.health.as_str()
            );
        }
        self.mirror_record(&updated).await;
        Some(updated)
    }

    /// Reclaim expired leases and mark the records they guarded failed
    pub async fn reap_expired(&self) -> Vec<DeploymentKey> {
        let mut failed = Vec::new();
        for reclaimed in self.serializer.reclaim_expired() {
            let updated = self.update_with(&reclaimed.key, Some(&reclaimed.operation_id), |record| {
                if record.status == DeploymentStatus::CompensationFailed {
                    RecordUpdate::new().in_flight(None)
                } else {
                    RecordUpdate::new()
                        .status(DeploymentStatus::Failed)
                        .in_flight(None)
                }
            });

            match updated {
                Some(record) => {
                    error!(
                        "Operation {} on {} did not finish within its lease (acquired {}), deployment marked {}",
                        reclaimed.operation_id,
                        reclaimed.key,
                        reclaimed.acquired_at,
                        record.status.as_str()
                    );
                    self.mirror_record(&record).await;
                    failed.push(reclaimed.key);
                }
                None => debug!(
                    "Operation {} on {} had already finished when its lease was reclaimed",
                    reclaimed.operation_id, reclaimed.key
                ),
            }
        }

        if !failed.is_empty() {
            self.persist().await;
        }
        failed
    }

    /// Clear the operator flag on a `CompensationFailed` record; it becomes `Failed`
    pub async fn resolve_intervention(
        &self,
        key: &DeploymentKey,
    ) -> Result<DeploymentRecord, SubmitError> {
        let stage = PipelineStage::Validated;
        let operation_id = generate_uuid();
        let _lease = self
            .serializer
            .acquire_guard(key, &operation_id)
            .await
            .map_err(|busy| self.busy(busy))?;

        let Some(record) = self.ledger.find(key) else {
            return Err(SubmitError::precondition(
                key,
                stage,
                format!("no deployment record for {}", key),
            ));
        };
        if record.status != DeploymentStatus::CompensationFailed {
            return Err(SubmitError::precondition(
                key,
                stage,
                format!(
                    "{} does not need intervention (status {})",
                    key,
                    record.status.as_str()
                ),
            ));
        }

        let updated = self
            .update_with(key, None, |_| {
                RecordUpdate::new()
                    .status(DeploymentStatus::Failed)
                    .intervention(None)
            })
            .ok_or_else(|| {
                SubmitError::precondition(key, stage, format!("no deployment record for {}", key))
            })?;
        info!(
            "Intervention on {} resolved, deployment marked Failed (was: {})",
            key,
            record.intervention.as_deref().unwrap_or("no note")
        );

        self.persist().await;
        self.mirror_record(&updated).await;
        Ok(updated)
    }

    fn replay(&self, operation: &Operation) -> Option<SubmitOutcome> {
        let record = self.ledger.find(operation.key())?;
        let operation_id = record
            .applied_request(operation.request_id())?
            .operation_id
            .clone();
        info!(
            "Request {} was already applied to {} by operation {}, returning existing record",
            operation.request_id(),
            record.key,
            operation_id
        );
        Some(SubmitOutcome {
            operation_id,
            record,
            replayed: true,
            catalog_synced: true,
        })
    }

    fn busy(&self, busy: Busy) -> SubmitError {
        info!("{} is busy with operation {}, rejecting", busy.key, busy.holder);
        SubmitError::Busy {
            key: busy.key,
            stage: PipelineStage::Validated,
            holder: busy.holder,
        }
    }

    /// Check preconditions against the ledger and resolve the target version.
    /// Never writes.
    fn preflight(&self, operation: Operation, operation_id: String) -> Result<Plan, SubmitError> {
        let key = operation.key().clone();
        let stage = PipelineStage::Validated;
        let existing = self.ledger.find(&key);

        if let Some(record) = &existing {
            if record.status == DeploymentStatus::CompensationFailed {
                return Err(SubmitError::precondition(
                    &key,
                    stage,
                    format!(
                        "{} requires operator intervention: {}",
                        key,
                        record.intervention.as_deref().unwrap_or("compensation failed")
                    ),
                ));
            }
        }
        let initialized = existing.as_ref().filter(|r| r.is_initialized());
        let carried = existing
            .as_ref()
            .map(|r| r.parameters.clone())
            .unwrap_or_default();

        let (target_version, status, base, source_environment, reason) = match operation.kind() {
            OperationKind::Create { version, .. } => {
                if let Some(record) = initialized {
                    let created_by = record
                        .history
                        .first()
                        .map(|e| e.request_id.as_str())
                        .unwrap_or("unknown");
                    return Err(SubmitError::precondition(
                        &key,
                        stage,
                        format!("{} already exists (created by request {})", key, created_by),
                    ));
                }
                (
                    version.clone().unwrap_or_default(),
                    Some(DeploymentStatus::Progressing),
                    DeploymentParameters::default(),
                    None,
                    None,
                )
            }

            OperationKind::Deploy { version } => (
                version.clone(),
                Some(DeploymentStatus::Progressing),
                carried,
                None,
                None,
            ),

            OperationKind::Promote {
                source_environment,
                version_hint,
            } => {
                let source_key = DeploymentKey::new(key.service.clone(), source_environment.clone());
                let Some(source) = self.ledger.find(&source_key) else {
                    return Err(SubmitError::precondition(
                        &key,
                        stage,
                        format!("source {} has no deployment record", source_key),
                    ));
                };
                if !source.status.is_promotable() {
                    return Err(SubmitError::precondition(
                        &key,
                        stage,
                        format!(
                            "source {} is {}, not a settled deployment",
                            source_key,
                            source.status.as_str()
                        ),
                    ));
                }
                if source.current_version.is_empty() {
                    return Err(SubmitError::precondition(
                        &key,
                        stage,
                        format!("source {} has no deployed version", source_key),
                    ));
                }
                if let Some(hint) = version_hint {
                    if hint != &source.current_version {
                        warn!(
                            "Promotion to {} named version {} but {} runs {}, promoting {}",
                            key, hint, source_key, source.current_version, source.current_version
                        );
                    }
                }

                let base = match initialized {
                    Some(record) => record.parameters.clone(),
                    None => source.parameters.clone(),
                };
                (
                    source.current_version,
                    Some(DeploymentStatus::Progressing),
                    base,
                    Some(source_environment.clone()),
                    None,
                )
            }

            OperationKind::Rollback {
                target_version,
                reason,
            } => {
                let Some(record) = initialized else {
                    return Err(SubmitError::precondition(
                        &key,
                        stage,
                        format!("nothing to roll back to: {} has no history", key),
                    ));
                };
                let target = match target_version {
                    Some(target) => {
                        if target == &record.current_version {
                            return Err(SubmitError::precondition(
                                &key,
                                stage,
                                format!("{} already runs version {}", key, target),
                            ));
                        }
                        if !record.version_transitions().contains(&target.as_str()) {
                            return Err(SubmitError::precondition(
                                &key,
                                stage,
                                format!("version {} never ran on {}", target, key),
                            ));
                        }
                        target.clone()
                    }
                    None => match record.previous_version() {
                        Some(previous) => previous.to_string(),
                        None => {
                            return Err(SubmitError::precondition(
                                &key,
                                stage,
                                format!("nothing to roll back to: {} has a single version", key),
                            ));
                        }
                    },
                };
                (
                    target,
                    Some(DeploymentStatus::RolledBack),
                    record.parameters.clone(),
                    None,
                    reason.clone(),
                )
            }

            OperationKind::Scale => {
                let Some(record) = initialized else {
                    return Err(SubmitError::precondition(
                        &key,
                        stage,
                        format!("{} has never been deployed", key),
                    ));
                };
                (
                    record.current_version.clone(),
                    None,
                    record.parameters.clone(),
                    None,
                    None,
                )
            }
        };

        let patch_resources = matches!(operation.kind(), OperationKind::Scale)
            && self.options.scale_strategy == ScaleStrategy::RegistryPatch
            && self.patch_supported();

        let parameters = operation.parameters().apply_to(&base);
        let auto_sync = operation
            .parameters()
            .auto_sync
            .unwrap_or_else(|| existing.as_ref().map(|r| r.auto_sync).unwrap_or(true));

        Ok(Plan {
            operation,
            operation_id,
            target_version,
            status,
            parameters,
            auto_sync,
            patch_resources,
            source_environment,
            reason,
            prior: existing.unwrap_or_else(|| DeploymentRecord::new(key)),
        })
    }

    fn patch_supported(&self) -> bool {
        let supported = self.collaborators.registry.supports_resource_patch();
        if !supported {
            debug!("Registry cannot patch resources, scaling through a manifest delta");
        }
        supported
    }

    async fn run_pipeline(
        &self,
        plan: Plan,
        scope: OperationScope,
    ) -> Result<SubmitOutcome, SubmitError> {
        let key = plan.operation.key().clone();
        let op_type = plan.operation.operation_type();
        let mut fsm = PipelineFsm::new();
        advance(&mut fsm, PipelineEvent::Validate);

        info!(
            "Reconciling {} on {} to version {} (operation {}, request {})",
            op_type,
            key,
            plan.target_version,
            plan.operation_id,
            plan.operation.request_id()
        );

        let (manifest_ref, application_ref) = if plan.patch_resources {
            self.call(
                self.collaborators
                    .registry
                    .patch_resources(&key, &plan.parameters),
            )
            .await
            .map_err(|source| {
                store_failure(&key, fsm.stage(), StoreKind::ApplicationRegistry, source)
            })?;
            advance(&mut fsm, PipelineEvent::RegistryUpdated);
            (plan.prior.manifest_ref.clone(), plan.prior.application_ref.clone())
        } else {
            let commit = self
                .call(self.collaborators.manifests.write(
                    &key,
                    &plan.target_version,
                    &plan.parameters,
                ))
                .await
                .map_err(|source| {
                    store_failure(&key, fsm.stage(), StoreKind::ManifestStore, source)
                })?;
            if op_type.is_version_transition() {
                self.update_with(&key, Some(&plan.operation_id), |_| {
                    RecordUpdate::new().desired_version(plan.target_version.clone())
                });
            }
            advance(&mut fsm, PipelineEvent::ManifestWritten);
            debug!("Manifest for {} committed as {}", key, commit);
            heartbeat(&scope);

            let app = match self
                .call(self.collaborators.registry.declare(&key, &commit, plan.auto_sync))
                .await
            {
                Ok(app) => app,
                Err(cause) => return Err(self.compensate(&plan, &mut fsm, cause).await),
            };
            advance(&mut fsm, PipelineEvent::RegistryUpdated);
            (Some(commit), Some(app))
        };
        heartbeat(&scope);

        let written = (manifest_ref.clone(), application_ref.clone());
        let update = commit_update(&plan, manifest_ref, application_ref);
        let current = self.ledger.find(&key).unwrap_or_else(|| plan.prior.clone());
        let synced = self.mirror_operation(&plan, &update.clone().preview(&current)).await;
        advance(&mut fsm, PipelineEvent::CatalogUpdated { synced });

        let Some(record) = self.update_with(&key, Some(&plan.operation_id), |_| update.clone())
        else {
            warn!(
                "Operation {} on {} lost its lease before committing, leaving the record to its new owner",
                plan.operation_id, key
            );
            self.settle_superseded(&key, written).await;
            return Err(SubmitError::precondition(
                &key,
                fsm.stage(),
                format!("operation {} was superseded after its lease expired", plan.operation_id),
            ));
        };
        advance(&mut fsm, PipelineEvent::Commit);
        info!(
            "{} on {} complete: version {} is {} (revision {})",
            op_type,
            key,
            record.current_version,
            record.status.as_str(),
            record.revision
        );

        self.persist().await;
        if !plan.patch_resources {
            self.announce(&key);
        }
        drop(scope);

        Ok(SubmitOutcome {
            operation_id: plan.operation_id,
            record,
            replayed: false,
            catalog_synced: fsm.catalog_synced(),
        })
    }

    /// Record what the stores accepted for a superseded operation and put the
    /// catalog back in line with the ledger. Status and version stay with the
    /// record's current owner.
    async fn settle_superseded(
        &self,
        key: &DeploymentKey,
        (manifest_ref, application_ref): (Option<CommitRef>, Option<ApplicationRef>),
    ) {
        let settled = self.update_with(key, None, |_| {
            let update = RecordUpdate::new().manifest_ref(manifest_ref.clone());
            match &application_ref {
                Some(app) => update.application_ref(app.clone()),
                None => update,
            }
        });
        if let Some(record) = settled {
            self.mirror_record(&record).await;
            self.persist().await;
        }
    }

    /// Undo the manifest write after the registry refused it
    async fn compensate(
        &self,
        plan: &Plan,
        fsm: &mut PipelineFsm,
        cause: StoreError,
    ) -> SubmitError {
        let key = plan.operation.key();
        let stage = fsm.stage();
        let restore_to = plan.prior.manifest_ref.as_ref();
        warn!(
            "Registry rejected {} for operation {}: {}, reverting manifest to {}",
            key,
            plan.operation_id,
            cause,
            restore_to.map(|c| c.0.as_str()).unwrap_or("nothing")
        );

        match self
            .call(self.collaborators.manifests.revert(key, restore_to))
            .await
        {
            Ok(()) => {
                if plan.operation.operation_type().is_version_transition() {
                    self.update_with(key, Some(&plan.operation_id), |_| {
                        RecordUpdate::new().desired_version(plan.prior.desired_version.clone())
                    });
                }
                SubmitError::Store {
                    key: key.clone(),
                    stage,
                    store: StoreKind::ApplicationRegistry,
                    source: cause,
                }
            }
            Err(compensation) => {
                let note = format!(
                    "operation {} ({} to {}) left an unreverted manifest: registry error: {}; revert error: {}",
                    plan.operation_id,
                    plan.operation.operation_type(),
                    plan.target_version,
                    cause,
                    compensation
                );
                advance(fsm, PipelineEvent::CompensationFailed(note.clone()));
                error!(
                    "COMPENSATION FAILED on {}: {}. Manual intervention required",
                    key, note
                );

                if let Some(record) = self.update_with(key, None, |_| {
                    RecordUpdate::new()
                        .status(DeploymentStatus::CompensationFailed)
                        .intervention(Some(note.clone()))
                }) {
                    self.persist().await;
                    self.mirror_record(&record).await;
                }

                SubmitError::CompensationFailed {
                    key: key.clone(),
                    stage,
                    store: StoreKind::ApplicationRegistry,
                    cause,
                    compensation,
                }
            }
        }
    }

    /// Write the catalog entities for an operation; false on a reconciliation gap
    async fn mirror_operation(&self, plan: &Plan, projected: &DeploymentRecord) -> bool {
        let key = &projected.key;
        let retry = self.catalog_retry();
        let mut synced = true;

        if let OperationKind::Create { scaffold, .. } = plan.operation.kind() {
            let props = microservice_properties(projected, scaffold, &self.options.endpoints);
            if let Err(e) = upsert_with_retry(
                &self.collaborators.catalog,
                &retry,
                &key.service,
                MICROSERVICE_ENTITY,
                &props,
            )
            .await
            {
                warn!(
                    "Reconciliation gap: catalog service entity {} not written: {}",
                    key.service, e
                );
                synced = false;
            }
        }

        let props = deployment_properties(projected, &self.options.endpoints);
        if let Err(e) = upsert_with_retry(
            &self.collaborators.catalog,
            &retry,
            &key.entity_id(),
            DEPLOYMENT_ENTITY,
            &props,
        )
        .await
        {
            warn!(
                "Reconciliation gap: catalog entity {} for operation {} not written after {} attempts: {}",
                key.entity_id(),
                plan.operation_id,
                retry.retries + 1,
                e
            );
            synced = false;
        }
        synced
    }

    /// Mirror a record outside the pipeline, best effort
    async fn mirror_record(&self, record: &DeploymentRecord) {
        let props = deployment_properties(record, &self.options.endpoints);
        if let Err(e) = upsert_with_retry(
            &self.collaborators.catalog,
            &self.catalog_retry(),
            &record.key.entity_id(),
            DEPLOYMENT_ENTITY,
            &props,
        )
        .await
        {
            warn!(
                "Reconciliation gap: catalog entity {} not updated: {}",
                record.key.entity_id(),
                e
            );
        }
    }

    fn catalog_retry(&self) -> CatalogRetry {
        CatalogRetry {
            retries: self.options.catalog_retries,
            backoff: self.options.catalog_backoff.clone(),
            call_timeout: self.options.call_timeout,
        }
    }

    /// Collaborator call bounded by the call timeout
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.options.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.options.call_timeout)),
        }
    }

    /// Compare-and-set loop. With `owner` set the update only applies while
    /// the record still names that operation in flight.
    fn update_with<F>(
        &self,
        key: &DeploymentKey,
        owner: Option<&str>,
        mut build: F,
    ) -> Option<DeploymentRecord>
    where
        F: FnMut(&DeploymentRecord) -> RecordUpdate,
    {
        loop {
            let record = self.ledger.find(key)?;
            if let Some(owner) = owner {
                if record.in_flight_operation_id.as_deref() != Some(owner) {
                    return None;
                }
            }
            match self
                .ledger
                .compare_and_set(key, record.revision, build(&record))
            {
                CasResult::Success(updated) => return Some(updated),
                CasResult::RevisionMismatch { actual } => {
                    debug!(
                        "Record {} moved from revision {} to {}, re-evaluating",
                        key, record.revision, actual.revision
                    );
                }
                CasResult::NotFound => return None,
            }
        }
    }

    async fn persist(&self) {
        if let Err(e) = self.ledger.persist().await {
            error!("Failed to persist ledger: {}", e);
        }
    }

    fn announce(&self, key: &DeploymentKey) {
        if let Some(tx) = &self.declared {
            if tx.send(key.clone()).is_err() {
                debug!("Status watcher is gone, not announcing {}", key);
            }
        }
    }
}

/// Ledger status implied by a registry report
pub fn status_from_report(current: DeploymentStatus, report: RegistryStatus) -> DeploymentStatus {
    match (report.sync_status, report.health) {
        (_, HealthStatus::Degraded) => DeploymentStatus::Degraded,
        (_, HealthStatus::Progressing) | (SyncStatus::InSync, HealthStatus::Healthy)
            if current == DeploymentStatus::RolledBack =>
        {
            DeploymentStatus::RolledBack
        }
        (_, HealthStatus::Progressing) => DeploymentStatus::Progressing,
        (SyncStatus::InSync, HealthStatus::Healthy) => DeploymentStatus::Synced,
        _ => current,
    }
}

/// Fields the final compare-and-set writes
fn commit_update(
    plan: &Plan,
    manifest_ref: Option<CommitRef>,
    application_ref: Option<ApplicationRef>,
) -> RecordUpdate {
    let event = VersionEvent {
        version: plan.target_version.clone(),
        operation_type: plan.operation.operation_type(),
        timestamp: Utc::now(),
        source_environment: plan.source_environment.clone(),
        reason: plan.reason.clone(),
        request_id: plan.operation.request_id().to_string(),
        operation_id: plan.operation_id.clone(),
        replicas: match plan.operation.kind() {
            OperationKind::Scale => Some(plan.parameters.replicas),
            _ => None,
        },
        tests_required: plan.operation.parameters().run_tests,
    };

    let mut update = RecordUpdate::new()
        .parameters(plan.parameters.clone())
        .auto_sync(plan.auto_sync)
        .in_flight(None)
        .last_operation_id(plan.operation_id.clone())
        .append(event);
    if let Some(commit) = manifest_ref {
        update = update.manifest_ref(Some(commit));
    }
    if let Some(app) = application_ref {
        update = update.application_ref(app);
    }
    if let Some(status) = plan.status {
        update = update
            .status(status)
            .current_version(plan.target_version.clone())
            .desired_version(plan.target_version.clone())
            .sync_status(SyncStatus::OutOfSync);
    }
    update
}

fn store_failure(
    key: &DeploymentKey,
    stage: PipelineStage,
    store: StoreKind,
    source: StoreError,
) -> SubmitError {
    warn!("{} failed for {} at stage {}: {}", store, key, stage, source);
    SubmitError::Store {
        key: key.clone(),
        stage,
        store,
        source,
    }
}

fn advance(fsm: &mut PipelineFsm, event: PipelineEvent) {
    match fsm.process(event) {
        Ok(stage) => debug!("Pipeline stage {}", stage),
        Err(e) => warn!("{}", e),
    }
}

fn heartbeat(scope: &OperationScope) {
    if !scope.lease.heartbeat() {
        warn!(
            "Lease on {} for operation {} was reclaimed, continuing until commit",
            scope.key, scope.operation_id
        );
    }
}
