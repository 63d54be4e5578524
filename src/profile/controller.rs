use super::{ProfileState, SessionEndReason};
use crate::core::{ProfileData, ProfileMetaData, Result, StoreError, reconcile_template};
use crate::session::{
    CommitMode, CommittedRecord, HeartbeatWorker, RenewOutcome, SessionLease, SessionLockManager,
    TickControl, spawn_heartbeat,
};
use crate::task::{Signal, Task, join_error};
use futures::FutureExt;
use log::warn;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

struct ProfileShared {
    state: ProfileState,
    data: ProfileData,
    meta: ProfileMetaData,
    version: u64,
}

struct ProfileInner {
    key: String,
    store_name: String,
    lease: SessionLease,
    locks: Arc<SessionLockManager>,
    template: Arc<ProfileData>,
    auto_save: bool,
    shared: Mutex<ProfileShared>,
    // Serializes saves, heartbeats and end-session on this profile.
    save_gate: tokio::sync::Mutex<()>,
    ended: Signal<SessionEndReason>,
    heartbeat: Mutex<Option<HeartbeatWorker>>,
}

/// One loaded record under an exclusive session.
///
/// `Data` belongs to the caller while the session is active. The profile
/// renews its lock in the background and, once the session ends for any
/// reason, fires its end signal exactly once.
#[derive(Clone)]
pub struct Profile {
    inner: Arc<ProfileInner>,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("store", &self.inner.store_name)
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct ActivateArgs {
    pub store_name: String,
    pub key: String,
    pub lease: SessionLease,
    pub committed: CommittedRecord,
    pub locks: Arc<SessionLockManager>,
    pub template: Arc<ProfileData>,
    pub heartbeat_interval: Duration,
    pub auto_save: bool,
}

impl Profile {
    /// Wraps a freshly acquired session and starts its heartbeat.
    pub(crate) fn activate(args: ActivateArgs) -> Self {
        let record = args.committed.record;
        let inner = Arc::new(ProfileInner {
            key: args.key,
            store_name: args.store_name,
            lease: args.lease,
            locks: args.locks,
            template: args.template,
            auto_save: args.auto_save,
            shared: Mutex::new(ProfileShared {
                state: ProfileState::Active,
                data: record.data,
                meta: record.meta,
                version: args.committed.version,
            }),
            save_gate: tokio::sync::Mutex::new(()),
            ended: Signal::new(),
            heartbeat: Mutex::new(None),
        });

        let weak: Weak<ProfileInner> = Arc::downgrade(&inner);
        let worker = spawn_heartbeat(args.heartbeat_interval, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return TickControl::Stop;
                };
                let profile = Profile { inner };
                profile.heartbeat_tick().await
            }
            .boxed()
        });
        *lock(&inner.heartbeat) = Some(worker);

        Self { inner }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn store_name(&self) -> &str {
        &self.inner.store_name
    }

    pub fn state(&self) -> ProfileState {
        self.shared().state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), ProfileState::Active | ProfileState::Saving)
    }

    /// Version of the record as last written by this session.
    pub fn last_saved_version(&self) -> u64 {
        self.shared().version
    }

    /// Snapshot of the cached `Data`.
    pub fn data(&self) -> ProfileData {
        self.shared().data.clone()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.shared().data.get(field).cloned()
    }

    pub fn with_data<R>(&self, read: impl FnOnce(&ProfileData) -> R) -> R {
        read(&self.shared().data)
    }

    /// Mutates `Data` in place. Rejected once the session has ended.
    pub fn with_data_mut<R>(&self, write: impl FnOnce(&mut ProfileData) -> R) -> Result<R> {
        let mut shared = self.shared();
        self.ensure_active(&shared)?;
        Ok(write(&mut shared.data))
    }

    pub fn set(&self, field: impl Into<String>, value: Value) -> Result<()> {
        self.with_data_mut(|data| {
            data.insert(field.into(), value);
        })
    }

    pub fn meta(&self) -> ProfileMetaData {
        self.shared().meta.clone()
    }

    pub fn user_ids(&self) -> Vec<i64> {
        self.shared().meta.user_ids.clone()
    }

    pub fn add_user_id(&self, user_id: i64) -> Result<()> {
        let mut shared = self.shared();
        self.ensure_active(&shared)?;
        if !shared.meta.user_ids.contains(&user_id) {
            shared.meta.user_ids.push(user_id);
        }
        Ok(())
    }

    pub fn remove_user_id(&self, user_id: i64) -> Result<()> {
        let mut shared = self.shared();
        self.ensure_active(&shared)?;
        shared.meta.user_ids.retain(|id| *id != user_id);
        Ok(())
    }

    pub fn tag(&self, name: &str) -> Option<Value> {
        self.shared().meta.tags.get(name).cloned()
    }

    pub fn set_tag(&self, name: impl Into<String>, value: Value) -> Result<()> {
        let mut shared = self.shared();
        self.ensure_active(&shared)?;
        shared.meta.tags.insert(name.into(), value);
        Ok(())
    }

    /// Fills fields missing from `Data` with the store template's defaults.
    ///
    /// Present values are never overwritten. Returns true if anything changed.
    pub fn reconcile(&self) -> Result<bool> {
        let mut shared = self.shared();
        self.ensure_active(&shared)?;
        Ok(reconcile_template(&mut shared.data, &self.inner.template))
    }

    /// Persists `Data` now.
    ///
    /// Rejects with `ProfileNotActive` after the session ended, and with
    /// `SessionLost` if the save finds the lock owned elsewhere (the profile
    /// ends instead of returning to `Active`). Cancelling the returned task
    /// only detaches the caller; the write itself runs to completion.
    pub fn save(&self) -> Task<()> {
        let profile = self.clone();
        let work = tokio::spawn(async move {
            let _gate = profile.inner.save_gate.lock().await;
            profile.persist(CommitMode::Keep).await
        });
        Task::spawn(async move { work.await.map_err(join_error)? })
    }

    /// Saves one last time and releases the lock.
    ///
    /// Idempotent: once ended, further calls resolve immediately without
    /// writing or notifying again.
    pub fn end_session(&self) -> Task<()> {
        let work = self.end_detached(SessionEndReason::Released);
        Task::spawn(async move { work.await.map_err(join_error)? })
    }

    /// Runs the final save and release on its own task, so dropping the
    /// handle never leaves the profile half-saved.
    pub(crate) fn end_detached(&self, reason: SessionEndReason) -> JoinHandle<Result<()>> {
        let profile = self.clone();
        tokio::spawn(async move { profile.end_with(reason).await })
    }

    /// Ends the session without waiting for an in-flight final save.
    pub(crate) fn abandon(&self) {
        self.finish(SessionEndReason::Abandoned);
    }

    async fn end_with(&self, reason: SessionEndReason) -> Result<()> {
        let _gate = self.inner.save_gate.lock().await;
        if self.state() == ProfileState::Ended {
            return Ok(());
        }

        match self.persist(CommitMode::Release).await {
            Ok(()) => {
                self.finish(reason);
                Ok(())
            }
            Err(StoreError::SessionLost(_)) => Ok(()),
            Err(err) => {
                if let Err(release_err) = self.inner.locks.release(&self.inner.lease).await {
                    warn!(
                        "Profile '{}' could not release lock after failed final save: {}",
                        self.inner.key, release_err
                    );
                }
                self.finish(SessionEndReason::Failed(err.clone()));
                Err(err)
            }
        }
    }

    /// Attaches a listener for the end of this session. Listeners attached
    /// after the session ended run immediately.
    pub fn listen_to_release<F>(&self, listener: F) -> bool
    where
        F: FnOnce(SessionEndReason) + Send + 'static,
    {
        self.inner.ended.connect(listener)
    }

    /// Resolves once the session has ended.
    pub fn session_ended(&self) -> impl Future<Output = SessionEndReason> + Send + 'static {
        let signal = self.inner.ended.clone();
        async move { signal.wait().await }
    }

    pub fn end_reason(&self) -> Option<SessionEndReason> {
        self.inner.ended.fired_payload()
    }

    pub fn ptr_eq(&self, other: &Profile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Writes the cached state under the lease. Caller holds the save gate.
    async fn persist(&self, mode: CommitMode) -> Result<()> {
        let (data, user_ids, tags) = {
            let mut shared = self.shared();
            self.ensure_active(&shared)?;
            shared.state = ProfileState::Saving;
            (
                shared.data.clone(),
                shared.meta.user_ids.clone(),
                shared.meta.tags.clone(),
            )
        };

        let mut saving = SavingGuard {
            shared: &self.inner.shared,
            armed: true,
        };

        let span = info_span!(
            "profile.save",
            store = %self.inner.store_name,
            key = %self.inner.key,
            release = mode == CommitMode::Release
        );
        let outcome = self
            .inner
            .locks
            .commit(&self.inner.lease, mode, |record, now| {
                record.data = data.clone();
                record.meta.user_ids = user_ids.clone();
                record.meta.tags = tags.clone();
                record.meta.last_saved_at = Some(now);
            })
            .instrument(span)
            .await;
        saving.armed = false;

        match outcome {
            Ok(RenewOutcome::Renewed(committed)) => {
                let mut shared = self.shared();
                shared.version = committed.version;
                shared.meta.last_saved_at = committed.record.meta.last_saved_at;
                if mode == CommitMode::Keep && shared.state == ProfileState::Saving {
                    shared.state = ProfileState::Active;
                }
                Ok(())
            }
            Ok(RenewOutcome::Lost) => {
                self.finish(SessionEndReason::Lost);
                Err(StoreError::SessionLost(self.inner.key.clone()))
            }
            Err(err) => {
                let mut shared = self.shared();
                if shared.state == ProfileState::Saving {
                    shared.state = ProfileState::Active;
                }
                Err(err)
            }
        }
    }

    async fn heartbeat_tick(&self) -> TickControl {
        let _gate = self.inner.save_gate.lock().await;
        if self.state() == ProfileState::Ended {
            return TickControl::Stop;
        }

        let result = if self.inner.auto_save {
            self.persist(CommitMode::Keep).await
        } else {
            self.renew_lock().await
        };

        match result {
            Ok(()) => TickControl::Continue,
            Err(err) if err.is_session_error() => TickControl::Stop,
            Err(StoreError::ProfileNotActive(_)) => TickControl::Stop,
            Err(err) => {
                warn!(
                    "Profile '{}' heartbeat failed, will retry next tick: {}",
                    self.inner.key, err
                );
                TickControl::Continue
            }
        }
    }

    async fn renew_lock(&self) -> Result<()> {
        match self.inner.locks.renew(&self.inner.lease).await? {
            RenewOutcome::Renewed(committed) => {
                self.shared().version = committed.version;
                Ok(())
            }
            RenewOutcome::Lost => {
                self.finish(SessionEndReason::Lost);
                Err(StoreError::SessionLost(self.inner.key.clone()))
            }
        }
    }

    /// Moves to `Ended`, stops the heartbeat and notifies listeners once.
    fn finish(&self, reason: SessionEndReason) {
        {
            let mut shared = self.shared();
            if shared.state == ProfileState::Ended {
                return;
            }
            shared.state = ProfileState::Ended;
        }

        if let Some(mut worker) = lock(&self.inner.heartbeat).take() {
            worker.request_stop();
        }

        if reason == SessionEndReason::Lost {
            warn!(
                "Profile '{}' in store '{}' lost its session to another owner",
                self.inner.key, self.inner.store_name
            );
        }
        event!(
            Level::INFO,
            store = %self.inner.store_name,
            key = %self.inner.key,
            reason = %reason,
            "profile session ended"
        );
        self.inner.ended.fire(reason);
    }

    fn ensure_active(&self, shared: &ProfileShared) -> Result<()> {
        match shared.state {
            ProfileState::Active | ProfileState::Saving => Ok(()),
            _ => Err(StoreError::ProfileNotActive(self.inner.key.clone())),
        }
    }

    fn shared(&self) -> MutexGuard<'_, ProfileShared> {
        lock(&self.inner.shared)
    }
}

/// Puts a profile back to `Active` if a save is dropped before its commit
/// settles.
struct SavingGuard<'a> {
    shared: &'a Mutex<ProfileShared>,
    armed: bool,
}

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut shared = lock(self.shared);
            if shared.state == ProfileState::Saving {
                shared.state = ProfileState::Active;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockRemoteStore, RetryPolicy, StoreAdapter};
    use serde_json::json;

    async fn activate(remote: &MockRemoteStore, heartbeat: Duration, auto_save: bool) -> Profile {
        let locks = Arc::new(SessionLockManager::new(
            StoreAdapter::new(Arc::new(remote.clone()), RetryPolicy::default()),
            heartbeat * 3,
            "test-host",
        ));
        let template = json!({"coins": 0, "inventory": {}}).as_object().cloned().unwrap();
        let (lease, committed) = locks.acquire("A", &template).await.unwrap();
        Profile::activate(ActivateArgs {
            store_name: "Players".into(),
            key: "A".into(),
            lease,
            committed,
            locks,
            template: Arc::new(template),
            heartbeat_interval: heartbeat,
            auto_save,
        })
    }

    #[tokio::test]
    async fn save_writes_data_and_returns_to_active() {
        let remote = MockRemoteStore::new();
        let profile = activate(&remote, Duration::from_secs(30), false).await;

        profile.set("coins", json!(25)).unwrap();
        profile.add_user_id(42).unwrap();
        profile.save().await.unwrap();

        assert_eq!(profile.state(), ProfileState::Active);
        let stored = remote.raw("A").unwrap();
        assert_eq!(stored["data"]["coins"], json!(25));
        assert_eq!(stored["meta"]["user_ids"], json!([42]));
        assert_eq!(profile.last_saved_version(), remote.version("A").unwrap());
    }

    #[tokio::test]
    async fn ended_profile_rejects_mutation_and_save() {
        let remote = MockRemoteStore::new();
        let profile = activate(&remote, Duration::from_secs(30), false).await;
        profile.end_session().await.unwrap();
        let stored = remote.raw("A");

        assert!(matches!(
            profile.set("coins", json!(1)),
            Err(StoreError::ProfileNotActive(_))
        ));
        assert!(matches!(
            profile.save().await,
            Err(StoreError::ProfileNotActive(_))
        ));
        assert_eq!(remote.raw("A"), stored);
    }

    #[tokio::test]
    async fn auto_save_heartbeat_persists_data() {
        let remote = MockRemoteStore::new();
        let profile = activate(&remote, Duration::from_millis(10), true).await;
        profile.set("coins", json!(7)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while remote.raw("A").unwrap()["data"]["coins"] != json!(7) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        profile.end_session().await.unwrap();
    }
}
