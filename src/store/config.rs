use crate::core::{Result, StoreError};
use crate::remote::RetryPolicy;
use std::time::Duration;

/// Minimum ratio between staleness threshold and heartbeat interval.
pub const MIN_STALE_TO_HEARTBEAT_RATIO: u32 = 3;

/// Store configuration
///
/// Timings for the session lock protocol, save behaviour and shutdown
/// draining. `stale_after` must be at least three heartbeat intervals.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How often a held session renews its lock
    pub heartbeat_interval: Duration,

    /// Age after which an unrenewed lock may be taken over
    pub stale_after: Duration,

    /// Persist `Data` on every heartbeat instead of only renewing the lock
    pub auto_save: bool,

    /// Merge the store template into `Data` right after every load
    pub reconcile_on_load: bool,

    /// Overall bound on draining active profiles at shutdown
    pub drain_timeout: Duration,

    /// Retry behaviour for remote requests
    pub retry: RetryPolicy,

    /// Name recorded in lock records to identify this process
    pub holder: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(90),
            auto_save: true,
            reconcile_on_load: false,
            drain_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            holder: format!("pid-{}", std::process::id()),
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set staleness threshold
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Enable or disable saving on every heartbeat
    pub fn auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    /// Enable or disable template reconciliation at load
    pub fn reconcile_on_load(mut self, enabled: bool) -> Self {
        self.reconcile_on_load = enabled;
        self
    }

    /// Set shutdown drain timeout
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the holder name written into lock records
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.stale_after < self.heartbeat_interval * MIN_STALE_TO_HEARTBEAT_RATIO {
            return Err(StoreError::InvalidConfig(format!(
                "stale_after ({:?}) must be at least {}x heartbeat_interval ({:?})",
                self.stale_after, MIN_STALE_TO_HEARTBEAT_RATIO, self.heartbeat_interval
            )));
        }
        if self.retry.request_budget == 0 {
            return Err(StoreError::InvalidConfig(
                "retry.request_budget must be at least 1".to_string(),
            ));
        }
        if self.holder.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "holder must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_respect_ratio() {
        let config = StoreConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(90));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_tight_staleness() {
        let config = StoreConfig::new()
            .heartbeat_interval(Duration::from_secs(30))
            .stale_after(Duration::from_secs(60));
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}
