//! Ledger snapshot file

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::ControllerError;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentRecord;

const SNAPSHOT_FORMAT: u32 = 1;

/// On-disk layout of a ledger snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub format: u32,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<DeploymentRecord>,
}

/// Durable home of the ledger
#[derive(Debug)]
pub struct LedgerJournal {
    file: File,
    write_lock: Mutex<()>,
}

impl LedgerJournal {
    pub fn new(file: File) -> Self {
        Self {
            file,
            write_lock: Mutex::new(()),
        }
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Read the records of the last snapshot; an absent file is an empty ledger
    pub async fn read(&self) -> Result<Vec<DeploymentRecord>, ControllerError> {
        if !self.file.exists().await {
            info!("No ledger snapshot at {:?}, starting empty", self.file.path());
            return Ok(Vec::new());
        }

        let snapshot: LedgerSnapshot = self.file.read_json().await?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(ControllerError::StorageError(format!(
                "unsupported ledger snapshot format {} in {:?}",
                snapshot.format,
                self.file.path()
            )));
        }
        Ok(snapshot.records)
    }

    /// Write a snapshot taken by `records` while holding the write lock, so
    /// concurrent writers cannot land an older snapshot over a newer one
    pub async fn write_with<F>(&self, records: F) -> Result<(), ControllerError>
    where
        F: FnOnce() -> Vec<DeploymentRecord>,
    {
        let _guard = self.write_lock.lock().await;
        let snapshot = LedgerSnapshot {
            format: SNAPSHOT_FORMAT,
            saved_at: Utc::now(),
            records: records(),
        };
        let contents = serde_json::to_vec_pretty(&snapshot)?;
        self.file.write_atomic(&contents).await?;
        debug!(
            "Persisted {} deployment records to {:?}",
            snapshot.records.len(),
            self.file.path()
        );
        Ok(())
    }
}
