pub mod deferred;
pub mod signal;

pub use deferred::{Task, TaskCanceller, join_error};
pub use signal::Signal;
