//! Request-facing facade over the backup engine.
//!
//! [`BackupApi`] gates every call on [`StorageSession`] readiness and runs the
//! merge and reassembly engines on the session's store thread.

mod connector;
mod executor;
mod session;

use std::sync::Arc;

use proforma_backup_core::{list_all, merge_batch, BackupError, Batch, MergeSummary, ProformaView};
use serde::{Deserialize, Serialize};
use tracing::info;

pub use connector::{Connector, MemoryConnector, SqliteConnector};
pub use executor::StoreExecutor;
pub use session::{RetryPolicy, StorageSession};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub storage_connected: bool,
    pub connections: u64,
}

pub struct BackupApi<C: Connector> {
    session: Arc<StorageSession<C>>,
}

impl<C: Connector> Clone for BackupApi<C> {
    fn clone(&self) -> Self {
        Self { session: Arc::clone(&self.session) }
    }
}

impl<C: Connector> BackupApi<C> {
    #[must_use]
    pub fn new(session: Arc<StorageSession<C>>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<StorageSession<C>> {
        &self.session
    }

    /// Readiness gate. Rejects immediately when storage is unusable and asks
    /// the session to reconnect in the background.
    ///
    /// # Errors
    /// Returns [`BackupError::NotReady`] when the session has no usable handle.
    pub fn check_ready(&self) -> Result<(), BackupError> {
        if self.session.is_ready() {
            return Ok(());
        }
        self.session.spawn_reconnect();
        Err(BackupError::NotReady)
    }

    /// # Errors
    /// Returns [`BackupError::NotReady`] when storage is unusable.
    pub fn health(&self) -> Result<HealthStatus, BackupError> {
        self.check_ready()?;
        Ok(HealthStatus { storage_connected: true, connections: self.session.connection_count() })
    }

    /// Merge one client batch into storage.
    ///
    /// # Errors
    /// Returns [`BackupError::NotReady`] before any validation or storage
    /// access when storage is unusable, [`BackupError::Validation`] for an
    /// empty batch, and [`BackupError::Storage`] for the first failed upsert.
    pub async fn merge_batch(&self, batch: Batch) -> Result<MergeSummary, BackupError> {
        self.check_ready()?;
        info!(
            proformas = batch.proformas.len(),
            items = batch.items.len(),
            "received backup batch"
        );

        let summary = self.session.run(move |store| merge_batch(store, &batch)).await?;
        info!(proformas = summary.proformas, items = summary.items, "backup batch merged");
        Ok(summary)
    }

    /// Rebuild the full dataset, newest proforma first.
    ///
    /// # Errors
    /// Returns [`BackupError::NotReady`] when storage is unusable and
    /// [`BackupError::Storage`] when a read fails.
    pub async fn list_all(&self) -> Result<Vec<ProformaView>, BackupError> {
        self.check_ready()?;
        self.session.run(|store| list_all(&*store)).await
    }
}
