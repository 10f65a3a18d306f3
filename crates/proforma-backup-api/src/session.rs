use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use proforma_backup_core::{BackupError, StoreError};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::connector::Connector;
use crate::executor::StoreExecutor;

/// Bounded, fixed-delay retry policy for establishing the store handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Owns the lifecycle of the process-wide store handle.
///
/// Request tasks only read the readiness flag and issue operations through
/// [`StorageSession::run`]; connecting and reconnecting happen here, either
/// awaited at startup or on a background supervisor task.
pub struct StorageSession<C: Connector> {
    connector: Arc<C>,
    policy: RetryPolicy,
    ready: AtomicBool,
    reconnecting: AtomicBool,
    connections: AtomicU64,
    handle: RwLock<Option<Arc<StoreExecutor<C::Store>>>>,
    connect_lock: Mutex<()>,
}

impl<C: Connector> StorageSession<C> {
    #[must_use]
    pub fn new(connector: C, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            connector: Arc::new(connector),
            policy,
            ready: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            handle: RwLock::new(None),
            connect_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Number of handles established since the session was created.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Acquire)
    }

    /// Establish the store handle unless one is already usable.
    ///
    /// Makes up to `max_attempts` attempts with `delay` between them. Only
    /// one attempt sequence runs at a time; concurrent callers wait for it
    /// and return early if it succeeded.
    ///
    /// # Errors
    /// Returns [`BackupError::Storage`] carrying the last connection error
    /// when every attempt failed.
    pub async fn ensure_connected(&self) -> Result<(), BackupError> {
        if self.is_ready() {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let endpoint = self.connector.target();
        let mut last_error =
            StoreError::Operation("no connection attempts configured".to_string());

        for attempt in 1..=self.policy.max_attempts {
            match self.connect_once().await {
                Ok(executor) => {
                    *self.handle.write() = Some(Arc::new(executor));
                    self.connections.fetch_add(1, Ordering::AcqRel);
                    self.ready.store(true, Ordering::Release);
                    info!(%endpoint, attempt, "connected to store");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        %endpoint,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        error = %err,
                        "store connection attempt failed"
                    );
                    last_error = err;
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        Err(BackupError::Storage(last_error))
    }

    /// Initial connection; exhaustion here is fatal to the process.
    ///
    /// # Errors
    /// Returns [`BackupError::StartupFatal`] when every attempt failed.
    pub async fn connect_at_startup(&self) -> Result<(), BackupError> {
        self.ensure_connected().await.map_err(|err| {
            let message = match err {
                BackupError::Storage(store_err) => store_err.to_string(),
                other => other.to_string(),
            };
            error!(attempts = self.policy.max_attempts, %message, "store unavailable at startup");
            BackupError::StartupFatal { attempts: self.policy.max_attempts, message }
        })
    }

    /// Start a background reconnect unless one is already running.
    pub fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = session.ensure_connected().await {
                error!(
                    endpoint = %session.connector.target(),
                    error = %err,
                    "background reconnect exhausted its attempts; storage stays unavailable"
                );
            }
            session.reconnecting.store(false, Ordering::Release);
        });
    }

    /// Record that the current handle is unusable and reconnect in the background.
    pub fn on_disconnect(self: &Arc<Self>, reason: &StoreError) {
        self.ready.store(false, Ordering::Release);
        self.handle.write().take();
        warn!(error = %reason, "store disconnected; reconnecting in background");
        self.spawn_reconnect();
    }

    /// Run one store operation on the live handle.
    ///
    /// # Errors
    /// Returns [`BackupError::NotReady`] without touching storage when no
    /// usable handle exists (and schedules a reconnect), otherwise whatever
    /// the operation returns. A disconnect reported by the operation drops
    /// the handle and schedules a reconnect.
    pub async fn run<F, T>(self: &Arc<Self>, op: F) -> Result<T, BackupError>
    where
        F: FnOnce(&mut C::Store) -> Result<T, BackupError> + Send + 'static,
        T: Send + 'static,
    {
        let Some(executor) = self.current() else {
            self.spawn_reconnect();
            return Err(BackupError::NotReady);
        };

        let result = executor.run(op).await;
        if let Err(BackupError::Storage(err)) = &result {
            if err.is_disconnect() {
                self.disconnect_if_current(&executor, err);
            }
        }
        result
    }

    fn current(&self) -> Option<Arc<StoreExecutor<C::Store>>> {
        if !self.is_ready() {
            return None;
        }
        self.handle.read().clone()
    }

    // A stale executor failing after a reconnect must not tear down the new handle.
    fn disconnect_if_current(
        self: &Arc<Self>,
        executor: &Arc<StoreExecutor<C::Store>>,
        reason: &StoreError,
    ) {
        let is_current = self
            .handle
            .read()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, executor));
        if is_current {
            self.on_disconnect(reason);
        }
    }

    async fn connect_once(&self) -> Result<StoreExecutor<C::Store>, StoreError> {
        let connector = Arc::clone(&self.connector);
        let store = tokio::task::spawn_blocking(move || connector.connect())
            .await
            .map_err(|err| StoreError::Operation(format!("connection task failed: {err}")))??;
        StoreExecutor::spawn(store)
    }
}
