//! In-memory collaborators
//!
//! Used by the test suite and by the binary when no remote collaborators are
//! wired in. Each store can be told to fail its next calls or to add latency,
//! and records the calls it received.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::deployment::{DeploymentKey, DeploymentParameters};
use crate::stores::{
    ApplicationRef, ApplicationRegistry, Catalog, CommitRef, ManifestStore, RegistryStatus,
    StoreError,
};
use crate::utils::sha256_hash;

/// Injected behaviour shared by the in-memory stores
#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    delay: Option<Duration>,
}

impl Faults {
    /// Consume one injected failure, if any
    fn take_failure(&mut self) -> bool {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            true
        } else {
            false
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ================================ MANIFESTS ===================================== //

/// A manifest commit held by [`InMemoryManifestStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestCommit {
    pub commit: CommitRef,
    pub key: DeploymentKey,
    pub version: String,
    pub parameters: DeploymentParameters,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ManifestState {
    commits: HashMap<CommitRef, ManifestCommit>,
    heads: HashMap<DeploymentKey, CommitRef>,
    writes: Vec<(DeploymentKey, String)>,
    reverts: Vec<(DeploymentKey, Option<CommitRef>)>,
}

/// Manifest repository kept in memory
#[derive(Debug, Default)]
pub struct InMemoryManifestStore {
    state: RwLock<ManifestState>,
    write_faults: Mutex<Faults>,
    revert_faults: Mutex<Faults>,
    seq: AtomicU64,
}

impl InMemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail
    pub fn fail_next_writes(&self, n: u32) {
        lock(&self.write_faults).fail_next = n;
    }

    /// Make the next `n` reverts fail
    pub fn fail_next_reverts(&self, n: u32) {
        lock(&self.revert_faults).fail_next = n;
    }

    /// Delay every write by `delay`
    pub fn set_write_delay(&self, delay: Duration) {
        lock(&self.write_faults).delay = Some(delay);
    }

    /// Current manifest for `key`
    pub fn head(&self, key: &DeploymentKey) -> Option<ManifestCommit> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .heads
            .get(key)
            .and_then(|commit| state.commits.get(commit))
            .cloned()
    }

    /// Successful writes as (key, version), oldest first
    pub fn writes(&self) -> Vec<(DeploymentKey, String)> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.writes.clone()
    }

    /// Revert calls as (key, restore target), oldest first
    pub fn reverts(&self) -> Vec<(DeploymentKey, Option<CommitRef>)> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.reverts.clone()
    }
}

#[async_trait]
impl ManifestStore for InMemoryManifestStore {
    async fn write(
        &self,
        key: &DeploymentKey,
        version: &str,
        parameters: &DeploymentParameters,
    ) -> Result<CommitRef, StoreError> {
        let (fail, delay) = {
            let mut faults = lock(&self.write_faults);
            (faults.take_failure(), faults.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StoreError::Unavailable(format!(
                "manifest repository refused write for {}",
                key
            )));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let digest = sha256_hash(
            format!("{}|{}|{:?}|{}", key, version, parameters, seq).as_bytes(),
        );
        let commit = CommitRef(digest[..12].to_string());

        info!("Writing manifest for {} at version {} ({})", key, version, commit);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.commits.insert(
            commit.clone(),
            ManifestCommit {
                commit: commit.clone(),
                key: key.clone(),
                version: version.to_string(),
                parameters: parameters.clone(),
                committed_at: Utc::now(),
            },
        );
        state.heads.insert(key.clone(), commit.clone());
        state.writes.push((key.clone(), version.to_string()));
        Ok(commit)
    }

    async fn revert(
        &self,
        key: &DeploymentKey,
        restore_to: Option<&CommitRef>,
    ) -> Result<(), StoreError> {
        let fail = lock(&self.revert_faults).take_failure();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.reverts.push((key.clone(), restore_to.cloned()));
        if fail {
            return Err(StoreError::Unavailable(format!(
                "manifest repository refused revert for {}",
                key
            )));
        }

        info!("Reverting manifest for {} to {:?}", key, restore_to);
        match restore_to {
            Some(commit) => {
                if !state.commits.contains_key(commit) {
                    return Err(StoreError::NotFound(format!("commit {}", commit)));
                }
                state.heads.insert(key.clone(), commit.clone());
            }
            None => {
                state.heads.remove(key);
            }
        }
        Ok(())
    }
}

// ================================ REGISTRY ====================================== //

/// An application declared in [`InMemoryRegistry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredApplication {
    pub name: String,
    pub manifest_ref: CommitRef,
    pub auto_sync: bool,
    pub patched: Option<DeploymentParameters>,
    pub declared_at: DateTime<Utc>,
}

/// CD application registry kept in memory
#[derive(Debug)]
pub struct InMemoryRegistry {
    apps: RwLock<HashMap<DeploymentKey, DeclaredApplication>>,
    channels: RwLock<HashMap<DeploymentKey, broadcast::Sender<RegistryStatus>>>,
    declare_faults: Mutex<Faults>,
    resource_patching: bool,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            declare_faults: Mutex::new(Faults::default()),
            resource_patching: false,
        }
    }

    /// A registry that can patch resources independently of manifests
    pub fn with_resource_patching() -> Self {
        Self {
            resource_patching: true,
            ..Self::new()
        }
    }

    /// Make the next `n` declare (and patch) calls fail
    pub fn fail_next_declares(&self, n: u32) {
        lock(&self.declare_faults).fail_next = n;
    }

    pub fn set_declare_delay(&self, delay: Duration) {
        lock(&self.declare_faults).delay = Some(delay);
    }

    pub fn application(&self, key: &DeploymentKey) -> Option<DeclaredApplication> {
        let apps = self.apps.read().unwrap_or_else(|e| e.into_inner());
        apps.get(key).cloned()
    }

    /// Publish a status report for `key`; returns the number of subscribers
    pub fn push_status(&self, key: &DeploymentKey, status: RegistryStatus) -> usize {
        self.sender(key).send(status).unwrap_or(0)
    }

    fn sender(&self, key: &DeploymentKey) -> broadcast::Sender<RegistryStatus> {
        {
            let channels = self.channels.read().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = channels.get(key) {
                return tx.clone();
            }
        }
        let mut channels = self.channels.write().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(key.clone())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    async fn injected(&self, key: &DeploymentKey) -> Result<(), StoreError> {
        let (fail, delay) = {
            let mut faults = lock(&self.declare_faults);
            (faults.take_failure(), faults.delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(StoreError::Unavailable(format!(
                "registry refused application {}",
                key.entity_id()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ApplicationRegistry for InMemoryRegistry {
    async fn declare(
        &self,
        key: &DeploymentKey,
        manifest_ref: &CommitRef,
        auto_sync: bool,
    ) -> Result<ApplicationRef, StoreError> {
        self.injected(key).await?;

        let name = key.entity_id();
        info!(
            "Declaring application {} at {} (auto_sync={})",
            name, manifest_ref, auto_sync
        );

        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        apps.insert(
            key.clone(),
            DeclaredApplication {
                name: name.clone(),
                manifest_ref: manifest_ref.clone(),
                auto_sync,
                patched: None,
                declared_at: Utc::now(),
            },
        );
        Ok(ApplicationRef {
            name,
            revision: manifest_ref.0.clone(),
        })
    }

    fn supports_resource_patch(&self) -> bool {
        self.resource_patching
    }

    async fn patch_resources(
        &self,
        key: &DeploymentKey,
        parameters: &DeploymentParameters,
    ) -> Result<(), StoreError> {
        if !self.resource_patching {
            return Err(StoreError::Unsupported(format!("resource patching for {}", key)));
        }
        self.injected(key).await?;

        let mut apps = self.apps.write().unwrap_or_else(|e| e.into_inner());
        let app = apps
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("application {}", key.entity_id())))?;
        info!(
            "Patching {}: replicas={}, cpu={}, memory={}",
            app.name, parameters.replicas, parameters.cpu_limit, parameters.memory_limit
        );
        app.patched = Some(parameters.clone());
        Ok(())
    }

    fn on_status_change(&self, key: &DeploymentKey) -> BoxStream<'static, RegistryStatus> {
        let rx = self.sender(key).subscribe();
        stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(status) => return Some((status, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Status subscriber lagged, skipped {} reports", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

// ================================ CATALOG ======================================= //

/// An entity held by [`InMemoryCatalog`]
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntity {
    pub entity_type: String,
    pub properties: serde_json::Value,
}

/// Service catalog kept in memory
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entities: RwLock<HashMap<String, CatalogEntity>>,
    faults: Mutex<Faults>,
    attempts: AtomicU64,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` upserts fail
    pub fn fail_next_upserts(&self, n: u32) {
        lock(&self.faults).fail_next = n;
    }

    pub fn entity(&self, entity_id: &str) -> Option<CatalogEntity> {
        let entities = self.entities.read().unwrap_or_else(|e| e.into_inner());
        entities.get(entity_id).cloned()
    }

    /// Upsert calls received, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Catalog for InMemoryCatalog {
    async fn upsert(
        &self,
        entity_id: &str,
        entity_type: &str,
        properties: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.faults).take_failure() {
            return Err(StoreError::Unavailable(format!(
                "catalog refused entity {}",
                entity_id
            )));
        }

        debug!("Upserting catalog entity {} of type {}", entity_id, entity_type);

        let mut entities = self.entities.write().unwrap_or_else(|e| e.into_inner());
        let entity = entities
            .entry(entity_id.to_string())
            .or_insert_with(|| CatalogEntity {
                entity_type: entity_type.to_string(),
                properties: serde_json::Value::Object(serde_json::Map::new()),
            });
        entity.entity_type = entity_type.to_string();

        // Properties merge; absent keys keep their previous value
        match (&mut entity.properties, properties) {
            (serde_json::Value::Object(existing), serde_json::Value::Object(update)) => {
                for (k, v) in update {
                    existing.insert(k.clone(), v.clone());
                }
            }
            (slot, value) => *slot = value.clone(),
        }
        Ok(())
    }
}
