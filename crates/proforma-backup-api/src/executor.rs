//! Store executor for non-blocking storage access.
//!
//! The store handle lives on a dedicated thread; async callers send it
//! closures over a channel and await the result on a oneshot, so no request
//! task blocks a runtime worker while storage I/O is in flight.

use std::sync::mpsc;
use std::thread;

use proforma_backup_core::{BackupError, StoreError};
use tokio::sync::oneshot;

type StoreOperation<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

pub struct StoreExecutor<S> {
    sender: mpsc::Sender<StoreOperation<S>>,
    _handle: thread::JoinHandle<()>,
}

impl<S> StoreExecutor<S>
where
    S: Send + 'static,
{
    /// Move `store` onto a new executor thread.
    ///
    /// # Errors
    /// Returns [`StoreError::Operation`] when the thread cannot be spawned.
    pub fn spawn(store: S) -> Result<Self, StoreError> {
        let (sender, receiver) = mpsc::channel::<StoreOperation<S>>();

        let handle = thread::Builder::new()
            .name("proforma-store".to_string())
            .spawn(move || {
                let mut store = store;
                while let Ok(operation) = receiver.recv() {
                    operation(&mut store);
                }
            })
            .map_err(|err| StoreError::Operation(format!("failed to start store thread: {err}")))?;

        Ok(Self { sender, _handle: handle })
    }

    /// Run `op` against the store and await its result.
    ///
    /// # Errors
    /// Returns whatever `op` returns, or [`StoreError::Disconnected`] when the
    /// store thread has stopped (for example after a panic inside an operation).
    pub async fn run<F, T>(&self, op: F) -> Result<T, BackupError>
    where
        F: FnOnce(&mut S) -> Result<T, BackupError> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();

        let operation: StoreOperation<S> = Box::new(move |store| {
            let _ = response_tx.send(op(store));
        });

        self.sender.send(operation).map_err(|_| executor_stopped())?;
        response_rx.await.map_err(|_| executor_stopped())?
    }
}

fn executor_stopped() -> BackupError {
    BackupError::Storage(StoreError::Disconnected("store executor stopped".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proforma_backup_core::{MemoryStore, Proforma, RecordStore};

    #[tokio::test]
    async fn runs_operations_on_the_owned_store() -> Result<(), BackupError> {
        let observer = MemoryStore::new();
        let executor = StoreExecutor::spawn(observer.clone())?;

        executor.run(|store| Ok(store.upsert_proforma(&Proforma::new(1))?)).await?;
        let found = executor.run(|store| Ok(store.find_all_proformas()?)).await?;

        assert_eq!(found.len(), 1);
        assert_eq!(observer.proforma_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn panicking_operation_reports_disconnect() -> Result<(), BackupError> {
        let executor = StoreExecutor::spawn(MemoryStore::new())?;

        let first: Result<(), BackupError> =
            executor.run(|_store| panic!("operation blew up")).await;
        let second = executor.run(|store| Ok(store.proforma_count())).await;

        assert!(matches!(first, Err(BackupError::Storage(StoreError::Disconnected(_)))));
        assert!(matches!(second, Err(BackupError::Storage(StoreError::Disconnected(_)))));
        Ok(())
    }
}
