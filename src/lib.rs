// ============================================================================
// ProfileStore Library
// ============================================================================

pub mod core;
pub mod profile;
pub mod remote;
pub mod session;
pub mod store;
pub mod task;

// Re-export main types for convenience
pub use crate::core::{
    ProfileData, ProfileMetaData, ProfileRecord, Result, SessionLockRecord, StoreError,
    reconcile_template,
};
pub use profile::{LoadParams, Profile, ProfileState, ProfileView, SessionEndReason};
pub use remote::mock::MockOperation;
pub use remote::{
    MockRemoteStore, RecordSnapshot, RemoteError, RemoteErrorKind, RemoteKeyValue, RetryPolicy,
    StoreAdapter,
};
pub use session::{LockState, RenewOutcome, SessionLease, SessionLockManager};
pub use store::{DrainReport, ProfileStore, StoreConfig, StoreManager};
pub use task::{Signal, Task, TaskCanceller};
