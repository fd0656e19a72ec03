//! Transactional storage: the outbox ledger, the processed-event ledger and
//! the service's own records, behind traits a relational store can implement.
//!
//! ## Two sides of the outbox
//!
//! 1. **Write side** (`Database` / `Transaction`) - a domain mutation and its
//!    outbox row commit together or not at all.
//! 2. **Relay side** (`OutboxStore`) - claim, confirm, release or fail rows,
//!    touching only dispatch bookkeeping.

mod error;
mod in_memory;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{DomainEvent, EventStatus};

pub use error::StoreError;
pub use in_memory::{InMemoryDatabase, InMemoryTransaction};

/// Marker that a consumer has applied an event. Its presence is the only
/// authority for "already applied".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    pub consumer_name: String,
    pub event_id: Uuid,
    pub processed_at: DateTime<Utc>,
}

/// Result of inserting a processed-event marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyProcessed,
}

/// A unit of work against the service's store.
///
/// Nothing is visible to other transactions before `commit`. Dropping a
/// transaction without committing rolls it back.
pub trait Transaction {
    /// Allocate the next identifier for `table`. Identifiers are never
    /// reused, even when the transaction rolls back.
    fn next_id(&mut self, table: &str) -> Result<u64, StoreError>;

    /// Read a record, seeing this transaction's own uncommitted writes.
    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace a record.
    fn put(&mut self, table: &str, key: &str, value: Value) -> Result<(), StoreError>;

    /// Append a PENDING row to the outbox.
    fn insert_outbox(&mut self, event: DomainEvent) -> Result<(), StoreError>;

    /// Insert the `(consumer, event_id)` marker.
    ///
    /// Holds the key's row lock until the transaction ends, so a concurrent
    /// delivery of the same event waits and then observes the outcome.
    fn insert_processed(&mut self, consumer: &str, event_id: Uuid)
        -> Result<InsertOutcome, StoreError>;

    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self);

    fn get_as<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>, StoreError>
    where
        Self: Sized,
    {
        match self.get(table, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn put_as<T: Serialize>(&mut self, table: &str, key: &str, value: &T) -> Result<(), StoreError>
    where
        Self: Sized,
    {
        self.put(table, key, serde_json::to_value(value)?)
    }
}

/// A store that hands out transactions.
pub trait Database: Send + Sync {
    type Tx: Transaction;

    fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Run `work` in a transaction: commit on `Ok`, roll back on `Err`.
    fn transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Tx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin()?;
        match work(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

/// Row counts per status, for operators and metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub dispatched: usize,
    pub failed: usize,
    /// PENDING rows held back by a FAILED row earlier in their aggregate.
    /// Included in `pending`.
    pub blocked: usize,
}

/// Relay-side view of the outbox.
///
/// Every mutation is guarded by the lease token handed out by
/// `fetch_batch`, so a worker whose lease expired cannot overwrite the
/// bookkeeping of the worker that took over.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `limit` rows for `worker_id`.
    ///
    /// Rows are considered in creation order. Only the oldest undispatched
    /// row of each aggregate is eligible, and only if it is PENDING, unleased
    /// (or its lease expired), past its backoff and created at or before
    /// `older_than`. A FAILED row therefore holds back the rest of its
    /// aggregate until it is requeued.
    /// Two workers never receive the same row while a lease is live.
    fn fetch_batch(
        &self,
        worker_id: &str,
        limit: usize,
        older_than: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<DomainEvent>, StoreError>;

    /// PENDING -> DISPATCHED, setting `dispatched_at` exactly once.
    fn mark_dispatched(&self, id: Uuid, lease_token: Uuid) -> Result<(), StoreError>;

    /// Give the row back for another attempt no earlier than `retry_at`.
    fn release(
        &self,
        id: Uuid,
        lease_token: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// PENDING -> FAILED. Excluded from automatic retry from now on.
    fn mark_failed(&self, id: Uuid, lease_token: Uuid, error: &str) -> Result<(), StoreError>;

    /// Operator recovery: FAILED -> PENDING with a fresh attempt budget.
    /// `attempts` keeps counting; the budget restarts from its current value.
    fn requeue_failed(&self, id: Uuid) -> Result<(), StoreError>;

    fn get_event(&self, id: Uuid) -> Result<Option<DomainEvent>, StoreError>;

    fn events_by_status(&self, status: EventStatus) -> Result<Vec<DomainEvent>, StoreError>;

    fn status_counts(&self) -> Result<StatusCounts, StoreError>;
}

/// Read access to the processed-event ledger.
pub trait ProcessedLedger: Send + Sync {
    fn is_processed(&self, consumer: &str, event_id: Uuid) -> Result<bool, StoreError>;

    fn processed_by(&self, consumer: &str) -> Result<Vec<ProcessedEventRecord>, StoreError>;
}

pub(crate) type Table = HashMap<String, Value>;
