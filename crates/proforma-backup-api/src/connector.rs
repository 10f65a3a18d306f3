use std::path::PathBuf;

use proforma_backup_core::{MemoryStore, RecordStore, StoreError};
use proforma_backup_store_sqlite::{store_error, SqliteStore};

/// Establishes a fresh store handle. Called by the storage session on
/// startup and on every reconnect; may block, so it runs off the runtime.
pub trait Connector: Send + Sync + 'static {
    type Store: RecordStore + Send + 'static;

    /// Human-readable target for logs.
    fn target(&self) -> String;

    /// # Errors
    /// Returns a [`StoreError`] when the store cannot be reached.
    fn connect(&self) -> Result<Self::Store, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Connector for SqliteConnector {
    type Store = SqliteStore;

    fn target(&self) -> String {
        self.path.display().to_string()
    }

    fn connect(&self) -> Result<SqliteStore, StoreError> {
        let mut store = SqliteStore::open(&self.path).map_err(store_error)?;
        store.migrate().map_err(store_error)?;
        store.ping().map_err(store_error)?;
        Ok(store)
    }
}

/// Hands out handles onto one shared [`MemoryStore`], so records survive reconnects.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    store: MemoryStore,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

impl Connector for MemoryConnector {
    type Store = MemoryStore;

    fn target(&self) -> String {
        "memory".to_string()
    }

    fn connect(&self) -> Result<MemoryStore, StoreError> {
        Ok(self.store.clone())
    }
}
