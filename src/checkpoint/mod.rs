//! Checkpoint store for resumable runs.
//!
//! - [`record`]: result records and the failure classification
//! - [`store`]: the sorted on-disk checkpoint and its concurrent wrapper

pub mod record;
pub mod store;

pub use record::{Failure, FailureKind, Outcome, ResultRecord, ERROR_FIELD, ERROR_KIND_FIELD};
pub use store::{load, save, CheckpointSet, CheckpointStore};
