//! Operation serializer
//!
//! Grants at most one lease per [`DeploymentKey`]. A second request for a held
//! key either fails fast with [`Busy`] or, when a queue depth is configured,
//! waits in a bounded queue and is handed the lease when the holder releases it.
//!
//! Leases are time-bounded. A holder that neither completes nor heartbeats
//! within the lease timeout loses the lease; [`OperationSerializer::reclaim_expired`]
//! reports such leases so the engine can mark their records failed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::models::deployment::DeploymentKey;
use crate::utils::generate_uuid;

/// Serializer settings
#[derive(Debug, Clone)]
pub struct SerializerOptions {
    /// Waiters allowed behind an active lease; 0 rejects immediately
    pub queue_depth: usize,

    /// Time after which an unreleased lease is reclaimed
    pub lease_timeout: Duration,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            queue_depth: 0,
            lease_timeout: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Exclusive, time-bounded right to reconcile one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: DeploymentKey,
    pub operation_id: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

/// Lease contention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Busy {
    pub key: DeploymentKey,

    /// Operation holding the key
    pub holder: String,
}

/// A lease taken away from its holder after it expired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedLease {
    pub key: DeploymentKey,
    pub operation_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug)]
struct ActiveLease {
    lease: Lease,
    deadline: Instant,
}

#[derive(Debug)]
struct Waiter {
    operation_id: String,
    tx: oneshot::Sender<Lease>,
}

#[derive(Debug)]
struct Slot {
    active: ActiveLease,
    waiters: VecDeque<Waiter>,
}

/// Per-key lease table
#[derive(Debug)]
pub struct OperationSerializer {
    slots: Mutex<HashMap<DeploymentKey, Slot>>,
    reclaimed: Mutex<Vec<ReclaimedLease>>,
    options: SerializerOptions,
}

impl Default for OperationSerializer {
    fn default() -> Self {
        Self::new(SerializerOptions::default())
    }
}

impl OperationSerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            reclaimed: Mutex::new(Vec::new()),
            options,
        }
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DeploymentKey, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn grant(&self, key: &DeploymentKey, operation_id: &str) -> ActiveLease {
        ActiveLease {
            lease: Lease {
                key: key.clone(),
                operation_id: operation_id.to_string(),
                token: generate_uuid(),
                acquired_at: Utc::now(),
            },
            deadline: Instant::now() + self.options.lease_timeout,
        }
    }

    /// Acquire the lease for `key` on behalf of `operation_id`
    pub async fn acquire(&self, key: &DeploymentKey, operation_id: &str) -> Result<Lease, Busy> {
        let (mut rx, holder) = {
            let mut slots = self.slots();
            let now = Instant::now();

            match slots.get_mut(key) {
                None => {
                    let active = self.grant(key, operation_id);
                    let lease = active.lease.clone();
                    slots.insert(
                        key.clone(),
                        Slot {
                            active,
                            waiters: VecDeque::new(),
                        },
                    );
                    debug!("Lease on {} granted to {}", key, operation_id);
                    return Ok(lease);
                }
                Some(slot) if slot.active.deadline <= now => {
                    let expired = std::mem::replace(&mut slot.active, self.grant(key, operation_id));
                    warn!(
                        "Lease on {} held by {} expired, reclaimed for {}",
                        key, expired.lease.operation_id, operation_id
                    );
                    self.push_reclaimed(expired.lease);
                    return Ok(slot.active.lease.clone());
                }
                Some(slot) if slot.waiters.len() < self.options.queue_depth => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push_back(Waiter {
                        operation_id: operation_id.to_string(),
                        tx,
                    });
                    debug!(
                        "Operation {} queued behind {} on {} ({} waiting)",
                        operation_id,
                        slot.active.lease.operation_id,
                        key,
                        slot.waiters.len()
                    );
                    (rx, slot.active.lease.operation_id.clone())
                }
                Some(slot) => {
                    return Err(Busy {
                        key: key.clone(),
                        holder: slot.active.lease.operation_id.clone(),
                    });
                }
            }
        };

        match tokio::time::timeout(self.options.lease_timeout, &mut rx).await {
            Ok(Ok(lease)) => Ok(lease),
            _ => {
                // Leave the queue; the lease may have been handed over meanwhile
                let still_queued = {
                    let mut slots = self.slots();
                    match slots.get_mut(key) {
                        Some(slot) => {
                            let before = slot.waiters.len();
                            slot.waiters.retain(|w| w.operation_id != operation_id);
                            slot.waiters.len() != before
                        }
                        None => false,
                    }
                };
                if !still_queued {
                    if let Ok(lease) = rx.try_recv() {
                        return Ok(lease);
                    }
                }
                Err(Busy {
                    key: key.clone(),
                    holder,
                })
            }
        }
    }

    /// Acquire and wrap the lease in a guard that releases it on drop
    pub async fn acquire_guard(
        self: &Arc<Self>,
        key: &DeploymentKey,
        operation_id: &str,
    ) -> Result<LeaseGuard, Busy> {
        let lease = self.acquire(key, operation_id).await?;
        Ok(LeaseGuard {
            serializer: self.clone(),
            lease: Some(lease),
        })
    }

    /// Release `lease`; returns false if it had already been reclaimed
    pub fn release(&self, lease: &Lease) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(&lease.key) else {
            return false;
        };
        if slot.active.lease.token != lease.token {
            return false;
        }
        debug!("Lease on {} released by {}", lease.key, lease.operation_id);
        if !self.hand_off(slot) {
            slots.remove(&lease.key);
        }
        true
    }

    /// Extend `lease` by another lease timeout; false if it was lost
    pub fn heartbeat(&self, lease: &Lease) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(&lease.key) {
            Some(slot) if slot.active.lease.token == lease.token => {
                slot.active.deadline = Instant::now() + self.options.lease_timeout;
                true
            }
            _ => false,
        }
    }

    /// Operation currently holding `key`, if any
    pub fn holder(&self, key: &DeploymentKey) -> Option<String> {
        let slots = self.slots();
        slots.get(key).map(|s| s.active.lease.operation_id.clone())
    }

    /// Reclaim every lease past its deadline, together with leases reclaimed
    /// lazily by `acquire` since the last call
    pub fn reclaim_expired(&self) -> Vec<ReclaimedLease> {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut slots = self.slots();
            let keys: Vec<DeploymentKey> = slots
                .iter()
                .filter(|(_, slot)| slot.active.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();

            for key in keys {
                let Some(slot) = slots.get_mut(&key) else {
                    continue;
                };
                let lease = slot.active.lease.clone();
                warn!(
                    "Lease on {} held by {} expired, reclaiming",
                    key, lease.operation_id
                );
                expired.push(ReclaimedLease {
                    key: lease.key,
                    operation_id: lease.operation_id,
                    acquired_at: lease.acquired_at,
                });
                if !self.hand_off(slot) {
                    slots.remove(&key);
                }
            }
        }

        let mut reclaimed = self.reclaimed.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ReclaimedLease> = reclaimed.drain(..).collect();
        all.extend(expired);
        all
    }

    fn push_reclaimed(&self, lease: Lease) {
        let mut reclaimed = self.reclaimed.lock().unwrap_or_else(|e| e.into_inner());
        reclaimed.push(ReclaimedLease {
            key: lease.key,
            operation_id: lease.operation_id,
            acquired_at: lease.acquired_at,
        });
    }

    /// Give the slot to the next live waiter; false when nobody is waiting
    fn hand_off(&self, slot: &mut Slot) -> bool {
        while let Some(waiter) = slot.waiters.pop_front() {
            let next = self.grant(&slot.active.lease.key, &waiter.operation_id);
            let lease = next.lease.clone();
            slot.active = next;
            if waiter.tx.send(lease).is_ok() {
                debug!(
                    "Lease on {} handed to queued operation {}",
                    slot.active.lease.key, waiter.operation_id
                );
                return true;
            }
        }
        false
    }
}

/// Releases its lease when dropped, on every exit path
#[derive(Debug)]
pub struct LeaseGuard {
    serializer: Arc<OperationSerializer>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    /// Extend the lease; false if it was reclaimed
    pub fn heartbeat(&self) -> bool {
        match &self.lease {
            Some(lease) => self.serializer.heartbeat(lease),
            None => false,
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.serializer.release(&lease);
        }
    }
}
