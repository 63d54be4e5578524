pub mod heartbeat;
pub mod lock;

pub use heartbeat::{HeartbeatWorker, TickControl, spawn_heartbeat};
pub use lock::{
    CommitMode, CommittedRecord, LockState, RenewOutcome, SessionLease, SessionLockManager,
};
