//! Finite state machine for a single reconciliation

use std::fmt;

use serde::{Deserialize, Serialize};

/// Pipeline stage of an in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    /// Intent received, not yet validated
    Received,

    /// Operation validated against the ledger
    Validated,

    /// Manifest accepted by the manifest store
    ManifestWritten,

    /// Desired state accepted by the application registry
    RegistryUpdated,

    /// Catalog mirror written (or the gap logged)
    CatalogUpdated,

    /// Ledger committed
    Complete,

    /// Compensation failed; operator intervention required
    CompensationFailed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Received => "Received",
            PipelineStage::Validated => "Validated",
            PipelineStage::ManifestWritten => "ManifestWritten",
            PipelineStage::RegistryUpdated => "RegistryUpdated",
            PipelineStage::CatalogUpdated => "CatalogUpdated",
            PipelineStage::Complete => "Complete",
            PipelineStage::CompensationFailed => "CompensationFailed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStage::Complete | PipelineStage::CompensationFailed
        )
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Operation validated and leased
    Validate,

    /// Manifest write accepted
    ManifestWritten,

    /// Registry declare (or resource patch) accepted
    RegistryUpdated,

    /// Catalog step finished; `synced` is false when only a gap was logged
    CatalogUpdated { synced: bool },

    /// Ledger commit succeeded
    Commit,

    /// Compensating action failed
    CompensationFailed(String),
}

/// Reconciliation FSM
#[derive(Debug, Clone)]
pub struct PipelineFsm {
    stage: PipelineStage,
    catalog_synced: bool,
    error: Option<String>,
}

impl PipelineFsm {
    /// Create a new FSM in received stage
    pub fn new() -> Self {
        Self {
            stage: PipelineStage::Received,
            catalog_synced: false,
            error: None,
        }
    }

    /// Get current stage
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Whether the catalog mirror was written
    pub fn catalog_synced(&self) -> bool {
        self.catalog_synced
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition stage
    pub fn process(&mut self, event: PipelineEvent) -> Result<PipelineStage, String> {
        let next = match (self.stage, &event) {
            (PipelineStage::Received, PipelineEvent::Validate) => PipelineStage::Validated,
            (PipelineStage::Validated, PipelineEvent::ManifestWritten) => {
                PipelineStage::ManifestWritten
            }

            // Registry patching skips the manifest write
            (PipelineStage::Validated, PipelineEvent::RegistryUpdated)
            | (PipelineStage::ManifestWritten, PipelineEvent::RegistryUpdated) => {
                PipelineStage::RegistryUpdated
            }

            (PipelineStage::RegistryUpdated, PipelineEvent::CatalogUpdated { synced }) => {
                self.catalog_synced = *synced;
                PipelineStage::CatalogUpdated
            }
            (PipelineStage::CatalogUpdated, PipelineEvent::Commit) => PipelineStage::Complete,

            (stage, PipelineEvent::CompensationFailed(err)) if !stage.is_terminal() => {
                self.error = Some(err.clone());
                PipelineStage::CompensationFailed
            }

            // Invalid transitions
            (stage, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", stage, event));
            }
        };

        self.stage = next;
        Ok(next)
    }
}

impl Default for PipelineFsm {
    fn default() -> Self {
        Self::new()
    }
}
