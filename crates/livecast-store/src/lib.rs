//! Durable storage collaborators for the broadcast core.
//!
//! Rows are versioned so writers can do optimistic read-modify-write,
//! every change is published on a feed, and JSON documents are updated
//! by merge patch rather than wholesale replacement. Object storage
//! uploads go through a presigned URL and report byte progress.

use std::time::Duration;

mod error;
mod merge;
mod object;
mod table;

pub use error::StoreError;
pub use merge::{merge_json, update_with};
pub use object::{upload, MemoryObjectStorage, ObjectStorage, PresignedUpload, ProgressFn};
pub use table::{Change, ChangeKind, MemoryTable, Record, Table, Versioned};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Capacity of each table's change feed.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// How long a presigned upload URL stays valid.
pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(15 * 60);

/// Default attempts for an optimistic update before giving up.
pub const DEFAULT_MERGE_RETRIES: u32 = 5;
