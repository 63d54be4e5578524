use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub mod adapter;
pub mod mock;

pub use adapter::{RetryPolicy, StoreAdapter, UpdateContext, UpdateDecision, UpdateOutcome};
pub use mock::MockRemoteStore;

/// Error classes the backing key-value service distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network failure, throttling or service unavailable. Safe to retry.
    Transient,
    /// The record changed since it was read. Re-run the transform.
    Conflict,
    /// Permission, quota or malformed input. Never retried.
    Permanent,
    /// The record does not exist (or the requested version is gone).
    NotFound,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Conflict => "conflict",
            Self::Permanent => "permanent",
            Self::NotFound => "not_found",
        };
        write!(f, "{label}")
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Conflict, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Permanent, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }
}

/// A read-only view of one stored version of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub key: String,
    pub value: Value,
    /// Monotonically increasing per key; used as the compare-and-set token.
    pub version: u64,
    /// Service-side time at which this snapshot was observed.
    pub observed_at: DateTime<Utc>,
}

/// Contract of the remote key-value service.
///
/// Implementations perform exactly one request per call. Retry, backoff and
/// conflict re-runs are the caller's job (see [`StoreAdapter`]).
#[async_trait]
pub trait RemoteKeyValue: Send + Sync {
    /// Reads the latest value, or a specific past `version`.
    ///
    /// A missing key or version yields `RemoteErrorKind::NotFound`.
    async fn get(&self, key: &str, version: Option<u64>) -> Result<RecordSnapshot, RemoteError>;

    /// Writes `value` only if the stored version still equals
    /// `expected_version` (`None` meaning "absent"). A mismatch yields
    /// `RemoteErrorKind::Conflict`.
    async fn put_if_version(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<RecordSnapshot, RemoteError>;

    async fn remove(&self, key: &str) -> Result<(), RemoteError>;

    /// Current service-side time.
    ///
    /// Services without a clock endpoint fall back to the local clock.
    async fn server_time(&self) -> Result<DateTime<Utc>, RemoteError> {
        Ok(Utc::now())
    }
}
