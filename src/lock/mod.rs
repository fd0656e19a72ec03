//! Row-lock primitives.
//!
//! The in-memory database uses these to emulate the row-level locks a
//! relational store takes on a unique key: a second transaction inserting
//! the same processed-event key waits until the first commits or rolls back.

mod error;
mod in_memory;

use std::sync::Arc;
use std::time::Duration;

pub use error::LockError;
pub use in_memory::{InMemoryLock, InMemoryLockManager};

/// An exclusive lock on one row key.
///
/// A relational store maps this onto `SELECT ... FOR UPDATE` on the key.
pub trait Lock: Send + Sync {
    /// Take the lock, waiting at most `timeout` for the current holder.
    /// `Ok(false)` means the holder kept it for the whole wait.
    fn acquire(&self, timeout: Duration) -> Result<bool, LockError>;

    fn release(&self) -> Result<(), LockError>;
}

/// Hands out one lock per key.
pub trait LockManager: Send + Sync {
    type Lock: Lock;

    /// The lock for `key`, created on first use.
    fn get_lock(&self, key: &str) -> Result<Arc<Self::Lock>, LockError>;

    /// Drop the bookkeeping for `key` once nobody holds or waits on it.
    fn forget(&self, key: &str) -> Result<(), LockError>;
}
