pub mod error;
pub mod reconcile;
pub mod record;

pub use error::{Result, StoreError};
pub use reconcile::reconcile_template;
pub use record::{ProfileData, ProfileMetaData, ProfileRecord, SessionLockRecord};
