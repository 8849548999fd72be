//! Deployment ledger
//!
//! The ledger owns every [`DeploymentRecord`] and is the engine's source of
//! truth for the current version, the operation in flight and the version
//! history of each deployment key.
//!
//! ## Compare-and-set
//!
//! Every mutation of version or status fields goes through
//! [`Ledger::compare_and_set`], conditioned on the record's `revision`. A
//! mismatch means someone else (the lease reaper, the registry status channel)
//! changed the record since it was read; the caller re-reads and re-evaluates.
//!
//! History can only grow: [`RecordUpdate`] has no way to remove or reorder
//! events.

pub mod journal;

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, warn};

use crate::errors::ControllerError;
use crate::ledger::journal::LedgerJournal;
use crate::models::deployment::{
    DeploymentKey, DeploymentParameters, DeploymentRecord, DeploymentStatus, HealthStatus,
    SyncStatus, VersionEvent,
};
use crate::stores::{ApplicationRef, CommitRef};

/// Result of a compare-and-set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Update applied; carries the new snapshot
    Success(DeploymentRecord),

    /// No record for the key
    NotFound,

    /// Record changed since it was read
    RevisionMismatch { actual: DeploymentRecord },
}

/// A set of field changes applied atomically to one record
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    current_version: Option<String>,
    desired_version: Option<String>,
    status: Option<DeploymentStatus>,
    sync_status: Option<SyncStatus>,
    health: Option<HealthStatus>,
    manifest_ref: Option<Option<CommitRef>>,
    application_ref: Option<ApplicationRef>,
    parameters: Option<DeploymentParameters>,
    auto_sync: Option<bool>,
    intervention: Option<Option<String>>,
    in_flight: Option<Option<String>>,
    last_operation_id: Option<String>,
    events: Vec<VersionEvent>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_version(mut self, version: impl Into<String>) -> Self {
        self.current_version = Some(version.into());
        self
    }

    pub fn desired_version(mut self, version: impl Into<String>) -> Self {
        self.desired_version = Some(version.into());
        self
    }

    pub fn status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn sync_status(mut self, sync_status: SyncStatus) -> Self {
        self.sync_status = Some(sync_status);
        self
    }

    pub fn health(mut self, health: HealthStatus) -> Self {
        self.health = Some(health);
        self
    }

    pub fn manifest_ref(mut self, commit: Option<CommitRef>) -> Self {
        self.manifest_ref = Some(commit);
        self
    }

    pub fn application_ref(mut self, app: ApplicationRef) -> Self {
        self.application_ref = Some(app);
        self
    }

    pub fn parameters(mut self, parameters: DeploymentParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = Some(auto_sync);
        self
    }

    pub fn intervention(mut self, note: Option<String>) -> Self {
        self.intervention = Some(note);
        self
    }

    pub fn in_flight(mut self, operation_id: Option<String>) -> Self {
        self.in_flight = Some(operation_id);
        self
    }

    pub fn last_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.last_operation_id = Some(operation_id.into());
        self
    }

    pub fn append(mut self, event: VersionEvent) -> Self {
        self.events.push(event);
        self
    }

    /// The record as it would read after this update, without storing it
    pub fn preview(self, record: &DeploymentRecord) -> DeploymentRecord {
        let mut preview = record.clone();
        self.apply(&mut preview);
        preview
    }

    fn apply(self, record: &mut DeploymentRecord) {
        if let Some(v) = self.current_version {
            record.current_version = v;
        }
        if let Some(v) = self.desired_version {
            record.desired_version = v;
        }
        if let Some(s) = self.status {
            record.status = s;
        }
        if let Some(s) = self.sync_status {
            record.sync_status = s;
        }
        if let Some(h) = self.health {
            record.health = Some(h);
        }
        if let Some(m) = self.manifest_ref {
            record.manifest_ref = m;
        }
        if let Some(a) = self.application_ref {
            record.application_ref = Some(a);
        }
        if let Some(p) = self.parameters {
            record.parameters = p;
        }
        if let Some(a) = self.auto_sync {
            record.auto_sync = a;
        }
        if let Some(i) = self.intervention {
            record.intervention = i;
        }
        if let Some(f) = self.in_flight {
            record.in_flight_operation_id = f;
        }
        if let Some(o) = self.last_operation_id {
            record.last_operation_id = Some(o);
        }
        record.history.extend(self.events);
        record.revision += 1;
        record.updated_at = Utc::now();
    }
}

/// Index of deployment records keyed by [`DeploymentKey`]
#[derive(Debug, Default)]
pub struct Ledger {
    records: RwLock<HashMap<DeploymentKey, DeploymentRecord>>,
    journal: Option<LedgerJournal>,
}

impl Ledger {
    /// Create an in-memory ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a ledger backed by `journal`.
    ///
    /// Records that were mid-operation when the snapshot was written belong to
    /// a reconciliation that did not survive the restart; they are released and
    /// marked failed.
    pub async fn load(journal: LedgerJournal) -> Result<Self, ControllerError> {
        let mut records = HashMap::new();
        for mut record in journal.read().await? {
            if let Some(op) = record.in_flight_operation_id.take() {
                warn!(
                    "Deployment {} had operation {} in flight at shutdown, marking failed",
                    record.key, op
                );
                record.status = DeploymentStatus::Failed;
                record.revision += 1;
                record.updated_at = Utc::now();
            }
            records.insert(record.key.clone(), record);
        }
        debug!("Loaded {} deployment records", records.len());

        Ok(Self {
            records: RwLock::new(records),
            journal: Some(journal),
        })
    }

    /// Get the record for `key`, creating a default one if absent
    pub fn get(&self, key: &DeploymentKey) -> DeploymentRecord {
        if let Some(record) = self.find(key) {
            return record;
        }
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records
            .entry(key.clone())
            .or_insert_with(|| DeploymentRecord::new(key.clone()))
            .clone()
    }

    /// Get the record for `key` without creating it
    pub fn find(&self, key: &DeploymentKey) -> Option<DeploymentRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(key).cloned()
    }

    /// All records, ordered by key
    pub fn list(&self) -> Vec<DeploymentRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn len(&self) -> usize {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `event` to the history of `key` unconditionally
    pub fn append(&self, key: &DeploymentKey, event: VersionEvent) -> DeploymentRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(key.clone())
            .or_insert_with(|| DeploymentRecord::new(key.clone()));
        RecordUpdate::new().append(event).apply(record);
        record.clone()
    }

    /// Apply `update` if the record's revision still equals `expected_revision`
    pub fn compare_and_set(
        &self,
        key: &DeploymentKey,
        expected_revision: u64,
        update: RecordUpdate,
    ) -> CasResult {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let Some(record) = records.get_mut(key) else {
            return CasResult::NotFound;
        };
        if record.revision != expected_revision {
            return CasResult::RevisionMismatch {
                actual: record.clone(),
            };
        }
        update.apply(record);
        CasResult::Success(record.clone())
    }

    /// Record `operation_id` as in flight for `key`, creating the record if needed
    pub fn begin_operation(&self, key: &DeploymentKey, operation_id: &str) -> DeploymentRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .entry(key.clone())
            .or_insert_with(|| DeploymentRecord::new(key.clone()));
        if let Some(previous) = &record.in_flight_operation_id {
            warn!(
                "Deployment {} still named operation {} in flight, replacing with {}",
                key, previous, operation_id
            );
        }
        RecordUpdate::new()
            .in_flight(Some(operation_id.to_string()))
            .apply(record);
        record.clone()
    }

    /// Clear the in-flight marker if it still names `operation_id`
    pub fn end_operation(&self, key: &DeploymentKey, operation_id: &str) -> bool {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(key) {
            Some(record) if record.in_flight_operation_id.as_deref() == Some(operation_id) => {
                RecordUpdate::new().in_flight(None).apply(record);
                true
            }
            _ => false,
        }
    }

    /// Write a snapshot to the journal, if the ledger has one
    pub async fn persist(&self) -> Result<(), ControllerError> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        journal.write_with(|| self.list()).await
    }
}
