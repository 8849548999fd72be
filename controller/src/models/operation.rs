//! Validated operation requests
//!
//! An [`Operation`] can only be built through the typed constructors below, so
//! the engine never sees a request that failed validation.

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::models::deployment::{DeploymentKey, DeploymentParameters, OperationType};

const MAX_NAME_LEN: usize = 63;
const MAX_REPLICAS: u32 = 1000;

/// Scaffold metadata for a new service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceScaffold {
    pub team: String,
    pub language: String,
    pub framework: String,
    pub template: String,
}

/// Operation-specific payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Create {
        version: Option<String>,
        scaffold: ServiceScaffold,
    },
    Deploy {
        version: String,
    },
    Promote {
        source_environment: String,
        /// Caller's view of the source version; never trusted
        version_hint: Option<String>,
    },
    Rollback {
        target_version: Option<String>,
        reason: Option<String>,
    },
    Scale,
}

/// Optional knobs shared by all operation types
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationParameters {
    pub replicas: Option<u32>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,

    /// `None` keeps whatever the record had
    pub auto_sync: Option<bool>,

    /// Test gate requested by a promotion
    pub run_tests: bool,
}

impl OperationParameters {
    /// Overlay these parameters on the ones a record already carries
    pub fn apply_to(&self, base: &DeploymentParameters) -> DeploymentParameters {
        let mut merged = base.clone();
        if let Some(replicas) = self.replicas {
            merged.replicas = replicas;
        }
        if let Some(cpu) = &self.cpu_limit {
            merged.cpu_limit = cpu.clone();
        }
        if let Some(memory) = &self.memory_limit {
            merged.memory_limit = memory.clone();
        }
        merged
    }

    fn has_resources(&self) -> bool {
        self.replicas.is_some() || self.cpu_limit.is_some() || self.memory_limit.is_some()
    }
}

/// A validated request against one deployment key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    key: DeploymentKey,
    kind: OperationKind,
    parameters: OperationParameters,
    request_id: String,
}

impl Operation {
    pub fn create(
        key: DeploymentKey,
        version: Option<String>,
        scaffold: ServiceScaffold,
        parameters: OperationParameters,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let version = version.filter(|v| !v.trim().is_empty());
        if let Some(v) = &version {
            validate_version(&key, "version", v)?;
        }
        if scaffold.team.trim().is_empty() {
            return Err(ValidationError::new(&key, "team", "must not be empty"));
        }
        Self::build(key, OperationKind::Create { version, scaffold }, parameters, request_id)
    }

    pub fn deploy(
        key: DeploymentKey,
        version: impl Into<String>,
        parameters: OperationParameters,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let version = version.into();
        validate_version(&key, "version", &version)?;
        Self::build(key, OperationKind::Deploy { version }, parameters, request_id)
    }

    pub fn promote(
        key: DeploymentKey,
        source_environment: impl Into<String>,
        version_hint: Option<String>,
        parameters: OperationParameters,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let source_environment = source_environment.into();
        validate_name(&key, "source_environment", &source_environment)?;
        if source_environment == key.environment {
            return Err(ValidationError::new(
                &key,
                "source_environment",
                "must differ from the target environment",
            ));
        }
        let version_hint = version_hint.filter(|v| !v.trim().is_empty());
        Self::build(
            key,
            OperationKind::Promote {
                source_environment,
                version_hint,
            },
            parameters,
            request_id,
        )
    }

    pub fn rollback(
        key: DeploymentKey,
        target_version: Option<String>,
        reason: Option<String>,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let target_version = target_version.filter(|v| !v.trim().is_empty());
        if let Some(v) = &target_version {
            validate_version(&key, "target_version", v)?;
        }
        let reason = reason.filter(|r| !r.trim().is_empty());
        Self::build(
            key,
            OperationKind::Rollback {
                target_version,
                reason,
            },
            OperationParameters::default(),
            request_id,
        )
    }

    pub fn scale(
        key: DeploymentKey,
        parameters: OperationParameters,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        if !parameters.has_resources() {
            return Err(ValidationError::new(
                &key,
                "parameters",
                "scale requires replicas, cpu_limit or memory_limit",
            ));
        }
        Self::build(key, OperationKind::Scale, parameters, request_id)
    }

    fn build(
        key: DeploymentKey,
        kind: OperationKind,
        parameters: OperationParameters,
        request_id: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        validate_name(&key, "service", &key.service)?;
        validate_name(&key, "environment", &key.environment)?;

        let request_id = request_id.into();
        if request_id.trim().is_empty() {
            return Err(ValidationError::new(&key, "request_id", "must not be empty"));
        }

        if let Some(replicas) = parameters.replicas {
            if replicas > MAX_REPLICAS {
                return Err(ValidationError::new(
                    &key,
                    "replicas",
                    format!("must be at most {}", MAX_REPLICAS),
                ));
            }
        }
        for (field, value) in [
            ("cpu_limit", &parameters.cpu_limit),
            ("memory_limit", &parameters.memory_limit),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                return Err(ValidationError::new(&key, field, "must not be empty"));
            }
        }

        Ok(Self {
            key,
            kind,
            parameters,
            request_id,
        })
    }

    pub fn key(&self) -> &DeploymentKey {
        &self.key
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn parameters(&self) -> &OperationParameters {
        &self.parameters
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            OperationKind::Create { .. } => OperationType::Create,
            OperationKind::Deploy { .. } => OperationType::Deploy,
            OperationKind::Promote { .. } => OperationType::Promote,
            OperationKind::Rollback { .. } => OperationType::Rollback,
            OperationKind::Scale => OperationType::Scale,
        }
    }
}

fn validate_name(key: &DeploymentKey, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new(key, field, "must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(ValidationError::new(
            key,
            field,
            format!("must be at most {} characters", MAX_NAME_LEN),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::new(
            key,
            field,
            "may only contain lowercase letters, digits and '-'",
        ));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(ValidationError::new(key, field, "must not start or end with '-'"));
    }
    Ok(())
}

fn validate_version(key: &DeploymentKey, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(key, field, "must not be empty"));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(ValidationError::new(key, field, "must not contain whitespace"));
    }
    Ok(())
}
