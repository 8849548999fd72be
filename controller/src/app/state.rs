//! Application state management

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::app::options::AppOptions;
use crate::errors::ControllerError;
use crate::ledger::journal::LedgerJournal;
use crate::ledger::Ledger;
use crate::models::deployment::DeploymentKey;
use crate::reconcile::engine::ReconciliationEngine;
use crate::serializer::OperationSerializer;
use crate::stores::Collaborators;

/// Main application state
pub struct AppState {
    /// Deployment records
    pub ledger: Arc<Ledger>,

    /// Per-key leases
    pub serializer: Arc<OperationSerializer>,

    /// Reconciliation engine
    pub engine: Arc<ReconciliationEngine>,
}

impl AppState {
    /// Initialize application state.
    ///
    /// Also returns the channel on which the engine announces declared keys.
    pub async fn init(
        options: &AppOptions,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DeploymentKey>), ControllerError> {
        info!("Initializing application state...");

        let ledger = if options.storage.persist_ledger {
            let journal = LedgerJournal::new(options.storage.layout.ledger_file());
            Arc::new(Ledger::load(journal).await?)
        } else {
            Arc::new(Ledger::new())
        };
        info!("Ledger holds {} deployment records", ledger.len());

        let serializer = Arc::new(OperationSerializer::new(options.serializer.clone()));

        let (declared_tx, declared_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(
            ReconciliationEngine::new(
                ledger.clone(),
                serializer.clone(),
                collaborators,
                options.engine.clone(),
            )
            .with_declared_keys(declared_tx),
        );

        let state = Self {
            ledger,
            serializer,
            engine,
        };
        Ok((state, declared_rx))
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        info!("Shutting down application state...");
        self.ledger.persist().await
    }
}
