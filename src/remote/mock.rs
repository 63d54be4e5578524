use super::{RecordSnapshot, RemoteError, RemoteKeyValue};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_HISTORY_LIMIT: usize = 16;

/// Request kinds a mock failure can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOperation {
    Any,
    Get,
    Put,
    Remove,
}

impl MockOperation {
    fn matches(self, other: MockOperation) -> bool {
        self == MockOperation::Any || self == other
    }
}

struct InjectedFailure {
    operation: MockOperation,
    error: RemoteError,
}

struct MockState {
    records: HashMap<String, VecDeque<RecordSnapshot>>,
    versions: HashMap<String, u64>,
    failures: VecDeque<InjectedFailure>,
    clock_offset: chrono::Duration,
    requests: u64,
    offline: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            versions: HashMap::new(),
            failures: VecDeque::new(),
            clock_offset: chrono::Duration::zero(),
            requests: 0,
            offline: false,
        }
    }
}

/// In-process substitute for the remote key-value service.
///
/// Same contract as a real backend with no network underneath: versions,
/// compare-and-set conflicts and bounded history are all simulated. Test hooks
/// inject failures, skew the service clock and tamper with stored records.
#[derive(Clone)]
pub struct MockRemoteStore {
    state: Arc<Mutex<MockState>>,
    latency: Duration,
    history_limit: usize,
}

impl Default for MockRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            latency: Duration::ZERO,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Delays every request by `latency` to widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Fails the next `count` requests matching `operation` with `error`.
    pub fn inject_failure(&self, operation: MockOperation, count: usize, error: RemoteError) {
        let mut state = self.lock();
        for _ in 0..count {
            state.failures.push_back(InjectedFailure {
                operation,
                error: error.clone(),
            });
        }
    }

    /// While offline every request fails with a transient error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Moves the service clock forward.
    pub fn advance_clock(&self, by: Duration) {
        let mut state = self.lock();
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        state.clock_offset = state.clock_offset + by;
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.lock().clock_offset
    }

    /// Number of requests served so far, failed ones and clock reads included.
    pub fn request_count(&self) -> u64 {
        self.lock().requests
    }

    /// Latest raw value stored under `key`.
    pub fn raw(&self, key: &str) -> Option<Value> {
        self.lock()
            .records
            .get(key)
            .and_then(|history| history.back())
            .map(|snapshot| snapshot.value.clone())
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        self.lock()
            .records
            .get(key)
            .and_then(|history| history.back())
            .map(|snapshot| snapshot.version)
    }

    /// Writes `value` unconditionally, as another process would.
    pub fn set_raw(&self, key: &str, value: Value) -> RecordSnapshot {
        let now = self.now();
        let mut state = self.lock();
        self.write_locked(&mut state, key, value, now)
    }

    /// Replaces the session owner token of `key`, simulating a takeover by
    /// another process. Returns false if the record has no session.
    pub fn overwrite_session_owner(&self, key: &str, owner_token: &str) -> bool {
        let Some(mut value) = self.raw(key) else {
            return false;
        };
        let Some(session) = value
            .get_mut("meta")
            .and_then(|meta| meta.get_mut("session"))
            .and_then(Value::as_object_mut)
        else {
            return false;
        };
        session.insert("owner_token".to_string(), Value::String(owner_token.to_string()));
        self.set_raw(key, value);
        true
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_locked(
        &self,
        state: &mut MockState,
        key: &str,
        value: Value,
        now: DateTime<Utc>,
    ) -> RecordSnapshot {
        let version = state.versions.entry(key.to_string()).or_insert(0);
        *version += 1;
        let snapshot = RecordSnapshot {
            key: key.to_string(),
            value,
            version: *version,
            observed_at: now,
        };
        let history = state.records.entry(key.to_string()).or_default();
        history.push_back(snapshot.clone());
        while history.len() > self.history_limit {
            history.pop_front();
        }
        snapshot
    }

    /// Simulates latency, counts the request and applies injected faults.
    async fn begin_request(&self, operation: MockOperation) -> Result<(), RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        state.requests += 1;
        if state.offline {
            return Err(RemoteError::transient("service unavailable"));
        }
        if let Some(position) = state
            .failures
            .iter()
            .position(|failure| failure.operation.matches(operation))
        {
            if let Some(failure) = state.failures.remove(position) {
                return Err(failure.error);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteKeyValue for MockRemoteStore {
    async fn get(&self, key: &str, version: Option<u64>) -> Result<RecordSnapshot, RemoteError> {
        self.begin_request(MockOperation::Get).await?;
        let now = self.now();
        let state = self.lock();
        let history = state
            .records
            .get(key)
            .ok_or_else(|| RemoteError::not_found(format!("key '{}'", key)))?;
        let found = match version {
            Some(version) => history.iter().find(|snapshot| snapshot.version == version),
            None => history.back(),
        };
        let mut snapshot = found.cloned().ok_or_else(|| {
            RemoteError::not_found(format!("key '{}' version {:?}", key, version))
        })?;
        snapshot.observed_at = now;
        Ok(snapshot)
    }

    async fn put_if_version(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> Result<RecordSnapshot, RemoteError> {
        self.begin_request(MockOperation::Put).await?;
        let now = self.now();
        let mut state = self.lock();
        let current = state
            .records
            .get(key)
            .and_then(|history| history.back())
            .map(|snapshot| snapshot.version);
        if current != expected_version {
            return Err(RemoteError::conflict(format!(
                "key '{}' is at version {:?}, expected {:?}",
                key, current, expected_version
            )));
        }
        Ok(self.write_locked(&mut state, key, value, now))
    }

    async fn remove(&self, key: &str) -> Result<(), RemoteError> {
        self.begin_request(MockOperation::Remove).await?;
        let mut state = self.lock();
        if state.records.remove(key).is_none() {
            return Err(RemoteError::not_found(format!("key '{}'", key)));
        }
        Ok(())
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        {
            let mut state = self.lock();
            state.requests += 1;
            if state.offline {
                return Err(RemoteError::transient("service unavailable"));
            }
        }
        Ok(self.now())
    }
}
