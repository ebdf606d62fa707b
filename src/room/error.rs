//! Error types for room storage, locking and registry operations.

use std::time::Duration;

use thiserror::Error;

/// Failures of the room store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend failed: {0}")]
    Backend(String),

    #[error("Stored room could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Failures of the distributed lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {key} not acquired within {waited:?}")]
    Timeout { key: String, waited: Duration },

    #[error("Lock backend failed: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(e: redis::RedisError) -> Self {
        LockError::Backend(e.to_string())
    }
}

/// Failures surfaced by the room registry.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("{field}: passwords do not match")]
    PasswordMismatch { field: &'static str },

    #[error("Room not found: {room}")]
    RoomNotFound { room: String },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RoomError {
    pub(crate) fn password_mismatch() -> Self {
        RoomError::PasswordMismatch { field: "password" }
    }

    /// Wire code used when the error is reported on a socket.
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::PasswordMismatch { .. } => "password_mismatch",
            RoomError::RoomNotFound { .. } => "room_not_found",
            RoomError::Lock(LockError::Timeout { .. }) => "lock_timeout",
            RoomError::Lock(LockError::Backend(_)) | RoomError::Store(_) => "storage_unavailable",
        }
    }
}
