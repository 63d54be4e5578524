use crate::core::{ProfileData, ProfileRecord, Result, SessionLockRecord, StoreError};
use crate::remote::{StoreAdapter, UpdateDecision, UpdateOutcome};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Level, event};
use uuid::Uuid;

/// Per-key lock state as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Acquiring,
    Held,
    Releasing,
    /// Another owner took the lock over. Absorbing.
    Lost,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unlocked => "unlocked",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Releasing => "releasing",
            Self::Lost => "lost",
        };
        write!(f, "{label}")
    }
}

/// This process's claim on one remote record.
#[derive(Debug, Clone)]
pub struct SessionLease {
    key: String,
    token: String,
    state: Arc<Mutex<LockState>>,
}

impl SessionLease {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
            state: Arc::new(Mutex::new(LockState::Unlocked)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> LockState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    fn set_state(&self, next: LockState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    /// Moves from `from` to `to` atomically; returns false if the lease was
    /// not in `from`.
    fn transition(&self, from: LockState, to: LockState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

/// A record as persisted under a held lease.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedRecord {
    pub record: ProfileRecord,
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenewOutcome {
    Renewed(CommittedRecord),
    /// The stored owner token no longer matches; nothing was written.
    Lost,
}

/// Whether a commit keeps the lock or gives it up in the same write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Keep,
    Release,
}

/// Distributed mutual exclusion over records in the remote store.
///
/// Liveness is defined purely by recent renewal: a lock whose `renewed_at` is
/// older than `stale_after` (by the service's clock) may be taken over.
pub struct SessionLockManager {
    adapter: StoreAdapter,
    stale_after: chrono::Duration,
    holder: String,
}

impl SessionLockManager {
    pub fn new(adapter: StoreAdapter, stale_after: Duration, holder: impl Into<String>) -> Self {
        Self {
            adapter,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or(chrono::Duration::MAX),
            holder: holder.into(),
        }
    }

    pub fn adapter(&self) -> &StoreAdapter {
        &self.adapter
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Takes the lock on `key`, creating the record from `template` if absent.
    ///
    /// Fails with `SessionLocked` while another owner holds a non-stale lock.
    /// The caller decides whether to poll; nothing is retried here.
    pub async fn acquire(
        &self,
        key: &str,
        template: &ProfileData,
    ) -> Result<(SessionLease, CommittedRecord)> {
        let lease = SessionLease::new(key);
        lease.set_state(LockState::Acquiring);

        let outcome = self
            .adapter
            .transactional_update(key, |ctx| {
                let mut record = match ctx.current {
                    Some(value) => ProfileRecord::from_value(value)?,
                    None => ProfileRecord::from_template(template, ctx.now),
                };
                if let Some(existing) = record.session() {
                    if !existing.is_owned_by(lease.token())
                        && !existing.is_stale(ctx.now, self.stale_after)
                    {
                        return Err(StoreError::SessionLocked {
                            key: key.to_string(),
                            holder: existing.holder.clone(),
                        });
                    }
                    if !existing.is_owned_by(lease.token()) {
                        event!(
                            Level::INFO,
                            key,
                            previous = %existing.holder,
                            "taking over stale session"
                        );
                    }
                }
                if record.meta.created_at.is_none() {
                    record.meta.created_at = Some(ctx.now);
                }
                record.meta.load_count += 1;
                record.meta.session = Some(SessionLockRecord::new(
                    lease.token(),
                    self.holder.as_str(),
                    ctx.now,
                ));
                Ok(UpdateDecision::Write(record.to_value()?))
            })
            .await;

        match outcome {
            Ok(UpdateOutcome::Written(snapshot)) => {
                let record = ProfileRecord::from_value(&snapshot.value)?;
                lease.set_state(LockState::Held);
                event!(Level::INFO, key, version = snapshot.version, "session acquired");
                Ok((
                    lease,
                    CommittedRecord {
                        record,
                        version: snapshot.version,
                        committed_at: snapshot.observed_at,
                    },
                ))
            }
            Ok(UpdateOutcome::Aborted(_)) => {
                lease.set_state(LockState::Unlocked);
                Err(StoreError::NonRetryable(format!(
                    "acquisition of '{}' was aborted",
                    key
                )))
            }
            Err(err) => {
                lease.set_state(LockState::Unlocked);
                Err(err)
            }
        }
    }

    /// Heartbeat: re-stamps the lock iff the stored owner is still this lease.
    ///
    /// A mismatch moves the lease to `Lost` and reports it; it is not an error.
    pub async fn renew(&self, lease: &SessionLease) -> Result<RenewOutcome> {
        self.commit(lease, CommitMode::Keep, |_, _| {}).await
    }

    /// Writes `mutate`'s changes together with a renewed lock stamp, or with
    /// the lock cleared under `CommitMode::Release`. Runs only while the
    /// stored owner token still equals the lease's token. `mutate` receives
    /// the service time of the write.
    pub async fn commit<F>(
        &self,
        lease: &SessionLease,
        mode: CommitMode,
        mut mutate: F,
    ) -> Result<RenewOutcome>
    where
        F: FnMut(&mut ProfileRecord, DateTime<Utc>) + Send,
    {
        match lease.state() {
            LockState::Held => {}
            LockState::Lost => return Ok(RenewOutcome::Lost),
            other => {
                return Err(StoreError::ProfileNotActive(format!(
                    "{} (lock is {})",
                    lease.key(),
                    other
                )));
            }
        }

        let outcome = self
            .adapter
            .transactional_update(lease.key(), |ctx| {
                let Some(value) = ctx.current else {
                    return Ok(UpdateDecision::Abort);
                };
                let mut record = ProfileRecord::from_value(value)?;
                if !record
                    .session()
                    .is_some_and(|session| session.is_owned_by(lease.token()))
                {
                    return Ok(UpdateDecision::Abort);
                }
                mutate(&mut record, ctx.now);
                record.meta.session = match mode {
                    CommitMode::Keep => Some(SessionLockRecord::new(
                        lease.token(),
                        self.holder.as_str(),
                        ctx.now,
                    )),
                    CommitMode::Release => None,
                };
                Ok(UpdateDecision::Write(record.to_value()?))
            })
            .await?;

        match outcome {
            UpdateOutcome::Written(snapshot) => {
                if mode == CommitMode::Release {
                    lease.set_state(LockState::Unlocked);
                }
                Ok(RenewOutcome::Renewed(CommittedRecord {
                    record: ProfileRecord::from_value(&snapshot.value)?,
                    version: snapshot.version,
                    committed_at: snapshot.observed_at,
                }))
            }
            UpdateOutcome::Aborted(_) => {
                lease.set_state(LockState::Lost);
                event!(Level::WARN, key = lease.key(), "session lock lost to another owner");
                Ok(RenewOutcome::Lost)
            }
        }
    }

    /// Clears the lock if this lease still owns it.
    ///
    /// Idempotent: releasing an unlocked or lost lease does nothing.
    pub async fn release(&self, lease: &SessionLease) -> Result<()> {
        if !lease.transition(LockState::Held, LockState::Releasing) {
            return Ok(());
        }

        let outcome = self
            .adapter
            .transactional_update(lease.key(), |ctx| {
                let Some(value) = ctx.current else {
                    return Ok(UpdateDecision::Abort);
                };
                let mut record = ProfileRecord::from_value(value)?;
                if !record
                    .session()
                    .is_some_and(|session| session.is_owned_by(lease.token()))
                {
                    return Ok(UpdateDecision::Abort);
                }
                record.meta.session = None;
                Ok(UpdateDecision::Write(record.to_value()?))
            })
            .await;

        match outcome {
            Ok(UpdateOutcome::Written(_)) => {
                lease.set_state(LockState::Unlocked);
                event!(Level::INFO, key = lease.key(), "session released");
                Ok(())
            }
            Ok(UpdateOutcome::Aborted(_)) => {
                lease.set_state(LockState::Lost);
                Ok(())
            }
            Err(err) => {
                lease.set_state(LockState::Held);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockRemoteStore, RetryPolicy};
    use serde_json::json;

    fn manager(remote: &MockRemoteStore, holder: &str) -> SessionLockManager {
        SessionLockManager::new(
            StoreAdapter::new(Arc::new(remote.clone()), RetryPolicy::default()),
            Duration::from_secs(90),
            holder,
        )
    }

    fn template() -> ProfileData {
        json!({"coins": 0}).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn second_owner_is_locked_out_until_stale() {
        let remote = MockRemoteStore::new();
        let first = manager(&remote, "server-a");
        let second = manager(&remote, "server-b");

        let (lease, committed) = first.acquire("A", &template()).await.unwrap();
        assert_eq!(lease.state(), LockState::Held);
        assert_eq!(committed.record.meta.load_count, 1);

        let err = second.acquire("A", &template()).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::SessionLocked {
                key: "A".into(),
                holder: "server-a".into()
            }
        );

        remote.advance_clock(Duration::from_secs(91));
        let (stolen, committed) = second.acquire("A", &template()).await.unwrap();
        assert_eq!(committed.record.meta.load_count, 2);
        assert_eq!(first.renew(&lease).await.unwrap(), RenewOutcome::Lost);
        assert_eq!(lease.state(), LockState::Lost);
        assert!(stolen.is_held());
    }

    #[tokio::test]
    async fn renew_succeeds_only_with_matching_token() {
        let remote = MockRemoteStore::new();
        let locks = manager(&remote, "server-a");
        let (lease, _) = locks.acquire("A", &template()).await.unwrap();

        assert!(matches!(
            locks.renew(&lease).await.unwrap(),
            RenewOutcome::Renewed(_)
        ));

        assert!(remote.overwrite_session_owner("A", "someone-else"));
        let before = remote.raw("A");
        assert_eq!(locks.renew(&lease).await.unwrap(), RenewOutcome::Lost);
        assert_eq!(remote.raw("A"), before);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let remote = MockRemoteStore::new();
        let locks = manager(&remote, "server-a");
        let (lease, _) = locks.acquire("A", &template()).await.unwrap();

        locks.release(&lease).await.unwrap();
        let version = remote.version("A");
        locks.release(&lease).await.unwrap();

        assert_eq!(lease.state(), LockState::Unlocked);
        assert_eq!(remote.version("A"), version);
        assert_eq!(remote.raw("A").unwrap()["meta"]["session"], json!(null));
    }
}
