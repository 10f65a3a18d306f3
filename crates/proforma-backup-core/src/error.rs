#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// The store handle is no longer usable and must be re-established.
    #[error("store connection lost: {0}")]
    Disconnected(String),
    #[error("store operation failed: {0}")]
    Operation(String),
}

impl StoreError {
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BackupError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage not ready")]
    NotReady,
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("storage unavailable after {attempts} connection attempts: {message}")]
    StartupFatal { attempts: u32, message: String },
}

impl BackupError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
