//! Small helpers shared across the reconciler

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Build stamp reported by `/version` and at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

pub fn version_info() -> VersionInfo {
    let stamp = |value: Option<&str>| value.unwrap_or("unknown").to_string();
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: stamp(option_env!("GIT_HASH")),
        build_time: stamp(option_env!("BUILD_TIME")),
    }
}

/// Retry spacing for collaborator calls that are allowed to be retried
#[derive(Debug, Clone)]
pub struct BackoffOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Delay before retry number `attempt` (zero based), never above `max_delay`
pub fn calc_exp_backoff(options: &BackoffOptions, attempt: u32) -> Duration {
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let scaled = options.base_delay.as_secs_f64() * options.multiplier.powi(exponent);
    if !scaled.is_finite() || scaled >= options.max_delay.as_secs_f64() {
        return options.max_delay;
    }
    Duration::from_secs_f64(scaled)
}

pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lowercase hex SHA-256 digest
pub fn sha256_hash(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}
