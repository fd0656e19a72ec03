use thiserror::Error;
use uuid::Uuid;

use crate::lock::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
    /// Another worker claimed the row after this worker's lease ran out.
    #[error("lease on event {id} is no longer held by this worker")]
    LeaseLost { id: Uuid },
    #[error("timed out waiting for row lock {0}")]
    LockTimeout(String),
    #[error("event {0} not found")]
    EventNotFound(Uuid),
    #[error("event {id} cannot be {action} in its current state")]
    InvalidTransition { id: Uuid, action: &'static str },
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl StoreError {
    /// Contention rather than failure; worth retrying right away.
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::LeaseLost { .. } | StoreError::LockTimeout(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
