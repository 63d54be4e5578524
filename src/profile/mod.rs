use crate::core::{
    ProfileData, ProfileMetaData, ProfileRecord, Result, StoreError, reconcile_template,
};
use crate::remote::RecordSnapshot;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

pub mod controller;

pub use controller::Profile;

/// Lifecycle state of a loaded profile.
///
/// A load in progress is the pending `Task<Profile>` returned by
/// `ProfileStore::load_profile_async`; a `Profile` exists only once its
/// session is held, so it starts out `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    Active,
    Saving,
    /// Terminal.
    Ended,
}

impl fmt::Display for ProfileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Saving => "saving",
            Self::Ended => "ended",
        };
        write!(f, "{label}")
    }
}

/// Why a session ended. Delivered once through the profile's end signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndReason {
    /// `end_session` saved and released the lock.
    Released,
    /// Drained by the store during process shutdown.
    Shutdown,
    /// Another owner took the lock over.
    Lost,
    /// Shutdown drain timed out before the final save finished. The save
    /// and release keep running in the background.
    Abandoned,
    /// The final save failed; the lock was released on a best-effort basis.
    Failed(StoreError),
}

impl fmt::Display for SessionEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Released => write!(f, "released"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Lost => write!(f, "lost"),
            Self::Abandoned => write!(f, "abandoned"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Reports whether whoever requested a load is still around to receive it.
pub type RequesterCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Options for a single profile load.
#[derive(Clone, Default)]
pub struct LoadParams {
    /// Reconcile the template into `Data` once loaded.
    pub reconcile: bool,
    requester: Option<RequesterCheck>,
}

impl LoadParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(mut self, reconcile: bool) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Ends the session right after acquisition if `check` reports the
    /// requester is gone.
    pub fn with_requester<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.requester = Some(Arc::new(check));
        self
    }

    pub fn requester_alive(&self) -> bool {
        self.requester.as_ref().is_none_or(|check| check())
    }
}

impl fmt::Debug for LoadParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadParams")
            .field("reconcile", &self.reconcile)
            .field("requester", &self.requester.is_some())
            .finish()
    }
}

/// Read-only snapshot of a record, loaded without taking the session lock.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileView {
    key: String,
    data: ProfileData,
    meta: ProfileMetaData,
    version: u64,
    read_at: DateTime<Utc>,
}

impl ProfileView {
    pub(crate) fn from_snapshot(key: &str, snapshot: &RecordSnapshot) -> Result<Self> {
        let record = ProfileRecord::from_value(&snapshot.value)?;
        Ok(Self {
            key: key.to_string(),
            data: record.data,
            meta: record.meta,
            version: snapshot.version,
            read_at: snapshot.observed_at,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> &ProfileData {
        &self.data
    }

    pub fn meta(&self) -> &ProfileMetaData {
        &self.meta
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn read_at(&self) -> DateTime<Utc> {
        self.read_at
    }

    /// True if some process held the session when this view was read.
    pub fn has_session(&self) -> bool {
        self.meta.session.is_some()
    }

    /// A copy of `Data` with missing template fields filled in.
    pub fn reconciled_data(&self, template: &ProfileData) -> ProfileData {
        let mut data = self.data.clone();
        reconcile_template(&mut data, template);
        data
    }
}
