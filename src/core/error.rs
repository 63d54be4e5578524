use crate::remote::{RemoteError, RemoteErrorKind};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Retry budget exhausted after {attempts} requests: {last_error}")]
    RetryBudgetExhausted { attempts: u32, last_error: String },

    #[error("Session for '{key}' is locked by another owner ({holder})")]
    SessionLocked { key: String, holder: String },

    #[error("Session for '{0}' was taken over by another owner")]
    SessionLost(String),

    #[error("Profile '{0}' is not active")]
    ProfileNotActive(String),

    #[error("Store '{0}' is unavailable: {1}")]
    StoreUnavailable(String, String),

    #[error("Non-retryable store error: {0}")]
    NonRetryable(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Store '{0}' is shutting down")]
    ShuttingDown(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Returns true for failures the adapter absorbs by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns true when the failure means a session is owned elsewhere.
    pub fn is_session_error(&self) -> bool {
        matches!(self, Self::SessionLocked { .. } | Self::SessionLost(_))
    }
}

/// Classifies a failed request that the operation could not treat as a
/// normal outcome. Conflicts count as transient: the caller re-runs.
impl From<RemoteError> for StoreError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::Transient | RemoteErrorKind::Conflict => Self::Transient(err.message),
            RemoteErrorKind::Permanent | RemoteErrorKind::NotFound => {
                Self::NonRetryable(err.message)
            }
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
