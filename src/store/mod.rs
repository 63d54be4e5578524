use crate::core::{ProfileData, Result, StoreError};
use crate::profile::controller::ActivateArgs;
use crate::profile::{LoadParams, Profile, ProfileView, SessionEndReason};
use crate::remote::adapter::validate_key;
use crate::remote::{RemoteKeyValue, StoreAdapter};
use crate::session::SessionLockManager;
use crate::task::{Task, TaskCanceller, join_error};
use futures::stream::{FuturesUnordered, StreamExt};
use log::warn;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{Instant, timeout_at};
use tracing::{Instrument, Level, event, info_span};

pub mod config;
pub mod manager;

pub use config::StoreConfig;
pub use manager::StoreManager;

/// Key read once at store creation to prove the service is reachable.
const CONNECTIVITY_PROBE_KEY: &str = "__profilestore_probe";

/// Outcome of draining one store at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub store: String,
    /// Profiles saved and released.
    pub released: Vec<String>,
    /// Profiles whose final save failed.
    pub failed: Vec<(String, StoreError)>,
    /// Profiles still pending when the drain timeout elapsed.
    pub abandoned: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.abandoned.is_empty()
    }
}

struct StoreInner {
    name: String,
    template: Arc<ProfileData>,
    config: StoreConfig,
    adapter: StoreAdapter,
    locks: Arc<SessionLockManager>,
    inflight: Mutex<HashMap<String, Task<Profile>>>,
    active: Mutex<HashMap<String, Profile>>,
    shutting_down: AtomicBool,
}

/// A named collection of profiles sharing one template.
///
/// Loads of the same key from within this process are de-duplicated: while
/// one is in flight, later callers receive the same pending task.
#[derive(Clone)]
pub struct ProfileStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl ProfileStore {
    /// Opens a store after one connectivity round-trip.
    ///
    /// Fails with `StoreUnavailable` if the service cannot be reached; the
    /// caller must not rely on the store in that case.
    pub async fn open(
        name: &str,
        template: ProfileData,
        remote: Arc<dyn RemoteKeyValue>,
        config: StoreConfig,
    ) -> Result<Self> {
        validate_key(name)?;
        config.validate()?;

        let adapter = StoreAdapter::new(remote, config.retry.clone());
        let probe_key = format!("{}/{}", name, CONNECTIVITY_PROBE_KEY);
        adapter
            .get(&probe_key, None)
            .await
            .map_err(|err| StoreError::StoreUnavailable(name.to_string(), err.to_string()))?;

        let locks = Arc::new(SessionLockManager::new(
            adapter.clone(),
            config.stale_after,
            config.holder.clone(),
        ));
        event!(Level::INFO, store = name, "profile store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                name: name.to_string(),
                template: Arc::new(template),
                config,
                adapter,
                locks,
                inflight: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn template(&self) -> &ProfileData {
        &self.inner.template
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Key under which `key` is stored in the remote service.
    pub fn remote_key(&self, key: &str) -> String {
        format!("{}/{}", self.inner.name, key)
    }

    /// Profiles currently active in this process.
    pub fn active_profiles(&self) -> Vec<Profile> {
        lock(&self.inner.active).values().cloned().collect()
    }

    pub fn active_profile(&self, key: &str) -> Option<Profile> {
        lock(&self.inner.active).get(key).cloned()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Starts (or joins) a load of `key` under an exclusive session.
    ///
    /// Rejects with `SessionLocked` when another owner holds a live lock;
    /// load failures are never retried here.
    pub fn load_profile_async(&self, key: &str, params: LoadParams) -> Task<Profile> {
        if self.is_shutting_down() {
            return Task::rejected(StoreError::ShuttingDown(self.inner.name.clone()));
        }
        if let Err(err) = validate_key(key) {
            return Task::rejected(err);
        }

        let mut inflight = lock(&self.inner.inflight);
        if let Some(pending) = inflight.get(key) {
            event!(Level::DEBUG, store = %self.inner.name, key, "joining in-flight load");
            return pending.clone();
        }
        if lock(&self.inner.active).contains_key(key) {
            return Task::rejected(StoreError::SessionLocked {
                key: key.to_string(),
                holder: self.inner.config.holder.clone(),
            });
        }

        let store = self.clone();
        let owned_key = key.to_string();
        let task = Task::spawn_with(move |canceller| {
            // The load itself runs detached so a cancelled caller never
            // leaves an acquired lock behind.
            let flow = tokio::spawn(async move {
                let result = store.run_load(&owned_key, params, canceller).await;
                lock(&store.inner.inflight).remove(&owned_key);
                result
            });
            async move { flow.await.map_err(join_error)? }
        });
        inflight.insert(key.to_string(), task.clone());
        task
    }

    async fn run_load(
        &self,
        key: &str,
        params: LoadParams,
        canceller: TaskCanceller,
    ) -> Result<Profile> {
        let span = info_span!("store.load", store = %self.inner.name, key);
        async {
            let remote_key = self.remote_key(key);
            let (lease, committed) = self
                .inner
                .locks
                .acquire(&remote_key, &self.inner.template)
                .await
                .map_err(|err| match err {
                    StoreError::SessionLocked { holder, .. } => StoreError::SessionLocked {
                        key: key.to_string(),
                        holder,
                    },
                    other => other,
                })?;

            if self.is_shutting_down() {
                event!(Level::INFO, "store draining after acquisition, releasing");
                self.inner.locks.release(&lease).await?;
                return Err(StoreError::ShuttingDown(self.inner.name.clone()));
            }
            if canceller.is_cancelled() || !params.requester_alive() {
                event!(Level::INFO, "requester gone after acquisition, releasing");
                self.inner.locks.release(&lease).await?;
                return Err(StoreError::Cancelled(format!(
                    "load of '{}' abandoned by requester",
                    key
                )));
            }

            let profile = Profile::activate(ActivateArgs {
                store_name: self.inner.name.clone(),
                key: key.to_string(),
                lease,
                committed,
                locks: self.inner.locks.clone(),
                template: self.inner.template.clone(),
                heartbeat_interval: self.inner.config.heartbeat_interval,
                auto_save: self.inner.config.auto_save,
            });
            if params.reconcile || self.inner.config.reconcile_on_load {
                profile.reconcile()?;
            }

            lock(&self.inner.active).insert(key.to_string(), profile.clone());
            let store = Arc::downgrade(&self.inner);
            let owned_key = key.to_string();
            profile.listen_to_release(move |_| {
                if let Some(store) = store.upgrade() {
                    let mut active = lock(&store.active);
                    if active.get(&owned_key).is_some_and(|p| !p.is_active()) {
                        active.remove(&owned_key);
                    }
                }
            });

            Ok::<_, StoreError>(profile)
        }
        .instrument(span)
        .await
    }

    /// Reads a record without taking its session lock.
    pub async fn view_profile(&self, key: &str) -> Result<Option<ProfileView>> {
        self.view_profile_version(key, None).await
    }

    /// Reads a specific stored version of a record, or the latest if `None`.
    pub async fn view_profile_version(
        &self,
        key: &str,
        version: Option<u64>,
    ) -> Result<Option<ProfileView>> {
        validate_key(key)?;
        let snapshot = self.inner.adapter.get(&self.remote_key(key), version).await?;
        snapshot
            .map(|snapshot| ProfileView::from_snapshot(key, &snapshot))
            .transpose()
    }

    /// Deletes a record remotely, e.g. for a compliance erasure request.
    ///
    /// Refuses while the profile is loading or active in this process.
    pub async fn wipe_profile(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let loading = lock(&self.inner.inflight).contains_key(key);
        if loading || lock(&self.inner.active).contains_key(key) {
            return Err(StoreError::SessionLocked {
                key: key.to_string(),
                holder: self.inner.config.holder.clone(),
            });
        }
        self.inner.adapter.remove(&self.remote_key(key)).await?;
        event!(Level::INFO, store = %self.inner.name, key, "profile wiped");
        Ok(())
    }

    /// Ends every active profile, waiting at most until `deadline`.
    ///
    /// New loads are refused from the moment draining starts, and loads
    /// already in flight release their lock instead of activating. Profiles
    /// whose final save outlives the deadline end as `Abandoned`; their save
    /// and release continue in the background.
    pub async fn drain(&self, deadline: Instant) -> DrainReport {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let mut report = DrainReport {
            store: self.inner.name.clone(),
            ..DrainReport::default()
        };

        let pending_loads: Vec<Task<Profile>> =
            lock(&self.inner.inflight).values().cloned().collect();
        let mut loads = pending_loads.into_iter().collect::<FuturesUnordered<_>>();
        while let Ok(Some(_)) = timeout_at(deadline, loads.next()).await {}

        let profiles = self.active_profiles();
        let mut endings = profiles
            .iter()
            .map(|profile| {
                let ending = profile.end_detached(SessionEndReason::Shutdown);
                let key = profile.key().to_string();
                async move { (key, ending.await.map_err(join_error).and_then(|result| result)) }
            })
            .collect::<FuturesUnordered<_>>();

        let mut pending: Vec<String> = profiles.iter().map(|p| p.key().to_string()).collect();
        while let Ok(Some((key, result))) = timeout_at(deadline, endings.next()).await {
            pending.retain(|k| k != &key);
            match result {
                Ok(()) => report.released.push(key),
                Err(err) => report.failed.push((key, err)),
            }
        }

        for profile in profiles.iter().filter(|p| pending.iter().any(|k| k == p.key())) {
            profile.abandon();
        }

        // Keys still loading when the deadline hit are abandoned too.
        for key in lock(&self.inner.inflight).keys() {
            if !pending.contains(key) {
                pending.push(key.clone());
            }
        }
        if !pending.is_empty() {
            warn!(
                "Store '{}' drain timed out; abandoned {} profile(s): {:?}",
                self.inner.name,
                pending.len(),
                pending
            );
        }
        report.abandoned = pending;
        event!(
            Level::INFO,
            store = %self.inner.name,
            released = report.released.len(),
            failed = report.failed.len(),
            abandoned = report.abandoned.len(),
            "store drained"
        );
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
