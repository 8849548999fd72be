//! Server state

use std::sync::Arc;

use crate::reconcile::engine::ReconciliationEngine;

/// Server state shared across handlers
pub struct ServerState {
    pub engine: Arc<ReconciliationEngine>,
}

impl ServerState {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }
}
