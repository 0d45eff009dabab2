//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row with the given id.
    #[error("{table} row {id} not found")]
    NotFound { table: &'static str, id: String },

    /// A row with the given id already exists.
    #[error("{table} row {id} already exists")]
    AlreadyExists { table: &'static str, id: String },

    /// Another writer updated the row first.
    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    /// Optimistic update kept conflicting.
    #[error("Update of {id} gave up after {attempts} conflicting attempts")]
    RetriesExhausted { id: String, attempts: u32 },

    /// Backend unreachable or refused the request.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Object key is malformed.
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// Presigned upload is unknown or was already used.
    #[error("Upload not authorized for {0}")]
    Unauthorized(String),

    /// Object upload failed.
    #[error("Upload failed: {0}")]
    Upload(String),

    /// Record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
