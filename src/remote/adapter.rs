use super::{RecordSnapshot, RemoteError, RemoteErrorKind, RemoteKeyValue};
use crate::core::{Result, StoreError};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::{Level, event};

/// Longest key the backing service accepts.
pub const MAX_KEY_LEN: usize = 50;

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of transient failures tolerated per operation.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
    /// Total remote requests one operation may issue, conflict re-runs included.
    pub request_budget: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            request_budget: 16,
        }
    }
}

impl RetryPolicy {
    /// Calculates the exponential backoff duration for a retry attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Per-operation accounting of requests and transient failures.
struct RequestBudget<'a> {
    policy: &'a RetryPolicy,
    requests: u32,
    transient_failures: u32,
    last_error: Option<String>,
}

impl<'a> RequestBudget<'a> {
    fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            requests: 0,
            transient_failures: 0,
            last_error: None,
        }
    }

    fn consume(&mut self) -> Result<()> {
        if self.requests >= self.policy.request_budget.max(1) {
            return Err(self.exhausted());
        }
        self.requests += 1;
        Ok(())
    }

    fn exhausted(&self) -> StoreError {
        StoreError::RetryBudgetExhausted {
            attempts: self.requests,
            last_error: self
                .last_error
                .clone()
                .unwrap_or_else(|| "request budget exhausted".to_string()),
        }
    }
}

/// What an updater wants done with the record it was shown.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDecision {
    Write(Value),
    Abort,
}

/// The state an updater sees on each run.
#[derive(Debug, Clone, Copy)]
pub struct UpdateContext<'a> {
    pub current: Option<&'a Value>,
    pub version: Option<u64>,
    /// Service-side time of the read backing this run.
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Written(RecordSnapshot),
    /// The updater declined to write; carries the snapshot it inspected.
    Aborted(Option<RecordSnapshot>),
}

impl UpdateOutcome {
    pub fn snapshot(&self) -> Option<&RecordSnapshot> {
        match self {
            Self::Written(snapshot) => Some(snapshot),
            Self::Aborted(snapshot) => snapshot.as_ref(),
        }
    }
}

/// Retrying front of a [`RemoteKeyValue`] service.
///
/// Transient failures are retried with exponential backoff, conflicts re-run
/// the updater against a fresh read, and permanent failures surface at once.
/// Every operation is bounded by [`RetryPolicy::request_budget`].
#[derive(Clone)]
pub struct StoreAdapter {
    remote: Arc<dyn RemoteKeyValue>,
    retry: RetryPolicy,
}

impl StoreAdapter {
    pub fn new(remote: Arc<dyn RemoteKeyValue>, retry: RetryPolicy) -> Self {
        Self { remote, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Compare-and-set update of `key`.
    ///
    /// `updater` may run several times; it must be a pure function of the
    /// context it receives. An `Err` from the updater aborts the operation and
    /// is returned as-is.
    pub async fn transactional_update<F>(&self, key: &str, mut updater: F) -> Result<UpdateOutcome>
    where
        F: FnMut(UpdateContext<'_>) -> Result<UpdateDecision> + Send,
    {
        ensure_key(key)?;
        let mut budget = RequestBudget::new(&self.retry);

        loop {
            budget.consume()?;
            let current = match self.remote.get(key, None).await {
                Ok(snapshot) => Some(snapshot),
                Err(err) if err.kind == RemoteErrorKind::NotFound => None,
                Err(err) => {
                    self.absorb_failure("update.read", key, err, &mut budget).await?;
                    continue;
                }
            };

            let now = match &current {
                Some(snapshot) => snapshot.observed_at,
                None => {
                    budget.consume()?;
                    match self.remote.server_time().await {
                        Ok(now) => now,
                        Err(err) => {
                            self.absorb_failure("update.clock", key, err, &mut budget).await?;
                            continue;
                        }
                    }
                }
            };

            let decision = updater(UpdateContext {
                current: current.as_ref().map(|snapshot| &snapshot.value),
                version: current.as_ref().map(|snapshot| snapshot.version),
                now,
            })?;
            let value = match decision {
                UpdateDecision::Write(value) => value,
                UpdateDecision::Abort => return Ok(UpdateOutcome::Aborted(current)),
            };

            budget.consume()?;
            let expected_version = current.as_ref().map(|snapshot| snapshot.version);
            match self.remote.put_if_version(key, expected_version, value).await {
                Ok(snapshot) => return Ok(UpdateOutcome::Written(snapshot)),
                Err(err) if err.kind == RemoteErrorKind::Conflict => {
                    event!(Level::DEBUG, key, error = %err, "version conflict, re-running updater");
                    budget.last_error = Some(err.to_string());
                }
                Err(err) => {
                    self.absorb_failure("update.write", key, err, &mut budget).await?;
                }
            }
        }
    }

    /// Reads the latest value or a specific version. Missing records are `None`.
    pub async fn get(&self, key: &str, version: Option<u64>) -> Result<Option<RecordSnapshot>> {
        ensure_key(key)?;
        let mut budget = RequestBudget::new(&self.retry);
        loop {
            budget.consume()?;
            match self.remote.get(key, version).await {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(err) if err.kind == RemoteErrorKind::NotFound => return Ok(None),
                Err(err) => self.absorb_failure("get", key, err, &mut budget).await?,
            }
        }
    }

    /// Deletes `key`. Removing a missing record succeeds.
    pub async fn remove(&self, key: &str) -> Result<()> {
        ensure_key(key)?;
        let mut budget = RequestBudget::new(&self.retry);
        loop {
            budget.consume()?;
            match self.remote.remove(key).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind == RemoteErrorKind::NotFound => return Ok(()),
                Err(err) => self.absorb_failure("remove", key, err, &mut budget).await?,
            }
        }
    }

    /// Sleeps through a transient failure or converts it into a terminal error.
    async fn absorb_failure(
        &self,
        operation: &str,
        key: &str,
        err: RemoteError,
        budget: &mut RequestBudget<'_>,
    ) -> Result<()> {
        budget.last_error = Some(err.to_string());
        if err.kind == RemoteErrorKind::Conflict {
            return Ok(());
        }
        let classified = StoreError::from(err);
        if !classified.is_retryable() {
            event!(Level::ERROR, key, operation, error = %classified, "non-retryable store error");
            return Err(classified);
        }

        budget.transient_failures += 1;
        let max_attempts = self.retry.max_attempts.max(1);
        if budget.transient_failures > max_attempts {
            return Err(budget.exhausted());
        }

        let backoff_ms = self.retry.backoff_ms(budget.transient_failures);
        warn!(
            "StoreAdapter.{} retry for '{}' (attempt {} of {}): {} (backoff={}ms)",
            operation, key, budget.transient_failures, max_attempts, classified, backoff_ms
        );
        sleep(Duration::from_millis(backoff_ms)).await;
        Ok(())
    }
}

fn ensure_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("remote key must not be empty".to_string()));
    }
    Ok(())
}

/// Validates a caller-supplied profile key or store name.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key '{}' exceeds {} bytes",
            key, MAX_KEY_LEN
        )));
    }
    Ok(())
}
