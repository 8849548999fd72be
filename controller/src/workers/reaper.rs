//! Lease reaper worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::reconcile::engine::ReconciliationEngine;

/// Reaper worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Interval between expired lease sweeps
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }
}

/// Run the lease reaper worker
pub async fn run<S, F>(
    options: &Options,
    engine: &ReconciliationEngine,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Lease reaper worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Lease reaper worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let failed = engine.reap_expired().await;
        if failed.is_empty() {
            debug!("No expired leases");
        } else {
            warn!("Reclaimed {} expired leases", failed.len());
        }
    }
}
