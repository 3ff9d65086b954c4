//! State management module for stackwright.
//!
//! This module provides persistent state storage for tracking provisioned
//! resources, their published attributes, and pass history.

mod store;
mod local;
mod s3;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LockInfo, generate_holder_id};
pub use types::{
    HistoryEntry, ResourceRecord, ResourceStatus, STATE_VERSION, StackOperation, StackState,
};
