//! Registry status watcher
//!
//! Follows the registry's status stream of every deployment key the engine
//! has declared and feeds each report to [`ReconciliationEngine::apply_status`].

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::models::deployment::DeploymentKey;
use crate::reconcile::engine::ReconciliationEngine;

/// Run the status watcher until shutdown
pub async fn run(
    engine: Arc<ReconciliationEngine>,
    mut declared_rx: mpsc::UnboundedReceiver<DeploymentKey>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Status watcher worker starting...");

    let mut watched: HashSet<DeploymentKey> = HashSet::new();
    let mut watchers = JoinSet::new();

    // Deployments declared before this process started
    for record in engine.records() {
        if record.application_ref.is_some() && watched.insert(record.key.clone()) {
            watchers.spawn(watch(engine.clone(), record.key));
        }
    }

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Status watcher worker shutting down...");
                watchers.abort_all();
                return;
            }
            key = declared_rx.recv() => {
                let Some(key) = key else {
                    info!("Engine dropped the declared key channel, status watcher stopping");
                    watchers.abort_all();
                    return;
                };
                if watched.insert(key.clone()) {
                    watchers.spawn(watch(engine.clone(), key));
                }
            }
            Some(done) = watchers.join_next(), if !watchers.is_empty() => {
                if let Ok(key) = done {
                    debug!("Status stream for {} ended", key);
                    watched.remove(&key);
                }
            }
        }
    }
}

async fn watch(engine: Arc<ReconciliationEngine>, key: DeploymentKey) -> DeploymentKey {
    debug!("Watching registry status of {}", key);
    let mut reports = engine.collaborators().registry.on_status_change(&key);
    while let Some(report) = reports.next().await {
        engine.apply_status(&key, report).await;
    }
    key
}
