//! Error types for the reconciler

use thiserror::Error;

use crate::models::deployment::DeploymentKey;
use crate::reconcile::fsm::PipelineStage;
use crate::stores::{StoreError, StoreKind};

/// Process-level error type
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::Internal(err.to_string())
    }
}

/// A malformed or incomplete operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub key: DeploymentKey,
    pub field: &'static str,
    pub reason: String,
}

impl ValidationError {
    pub fn new(key: &DeploymentKey, field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            key: key.clone(),
            field,
            reason: reason.into(),
        }
    }
}

/// Coarse classification of a rejected submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Busy,
    Validation,
    Precondition,
    Store,
    CompensationFailed,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::Busy => "Busy",
            RejectionKind::Validation => "ValidationError",
            RejectionKind::Precondition => "PreconditionError",
            RejectionKind::Store => "StoreError",
            RejectionKind::CompensationFailed => "CompensationFailed",
        }
    }
}

/// Everything `submit` can report besides success
#[derive(Error, Debug, Clone)]
pub enum SubmitError {
    #[error("{key} is busy with operation {holder} (stage {stage})")]
    Busy {
        key: DeploymentKey,
        stage: PipelineStage,
        holder: String,
    },

    #[error("{key}: {source} (stage {stage})")]
    Validation {
        key: DeploymentKey,
        stage: PipelineStage,
        source: ValidationError,
    },

    #[error("{key}: precondition failed: {reason} (stage {stage})")]
    Precondition {
        key: DeploymentKey,
        stage: PipelineStage,
        reason: String,
    },

    #[error("{key}: {store} failed: {source} (stage {stage})")]
    Store {
        key: DeploymentKey,
        stage: PipelineStage,
        store: StoreKind,
        source: StoreError,
    },

    #[error("{key}: compensation failed after {store} error ({cause}): {compensation} (stage {stage})")]
    CompensationFailed {
        key: DeploymentKey,
        stage: PipelineStage,
        store: StoreKind,
        cause: StoreError,
        compensation: StoreError,
    },
}

impl SubmitError {
    pub fn precondition(
        key: &DeploymentKey,
        stage: PipelineStage,
        reason: impl Into<String>,
    ) -> Self {
        SubmitError::Precondition {
            key: key.clone(),
            stage,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> RejectionKind {
        match self {
            SubmitError::Busy { .. } => RejectionKind::Busy,
            SubmitError::Validation { .. } => RejectionKind::Validation,
            SubmitError::Precondition { .. } => RejectionKind::Precondition,
            SubmitError::Store { .. } => RejectionKind::Store,
            SubmitError::CompensationFailed { .. } => RejectionKind::CompensationFailed,
        }
    }

    pub fn key(&self) -> &DeploymentKey {
        match self {
            SubmitError::Busy { key, .. }
            | SubmitError::Validation { key, .. }
            | SubmitError::Precondition { key, .. }
            | SubmitError::Store { key, .. }
            | SubmitError::CompensationFailed { key, .. } => key,
        }
    }

    pub fn stage(&self) -> PipelineStage {
        match self {
            SubmitError::Busy { stage, .. }
            | SubmitError::Validation { stage, .. }
            | SubmitError::Precondition { stage, .. }
            | SubmitError::Store { stage, .. }
            | SubmitError::CompensationFailed { stage, .. } => *stage,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Busy { .. } | SubmitError::Store { .. })
    }
}

impl From<ValidationError> for SubmitError {
    fn from(err: ValidationError) -> Self {
        SubmitError::Validation {
            key: err.key.clone(),
            stage: PipelineStage::Received,
            source: err,
        }
    }
}
