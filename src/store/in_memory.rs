use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{add_std, Clock, SystemClock};
use crate::event::{DomainEvent, EventStatus, Lease};
use crate::lock::{InMemoryLock, InMemoryLockManager, Lock, LockManager};

use super::{
    Database, InsertOutcome, OutboxStore, ProcessedEventRecord, ProcessedLedger, StatusCounts,
    StoreError, Table, Transaction,
};

#[derive(Default)]
struct State {
    tables: HashMap<String, Table>,
    outbox: Vec<DomainEvent>,
    outbox_index: HashMap<Uuid, usize>,
    processed: HashMap<(String, Uuid), ProcessedEventRecord>,
    next_sequence: u64,
}

#[derive(Default)]
struct Shared {
    state: RwLock<State>,
    sequences: Mutex<HashMap<String, u64>>,
    row_locks: InMemoryLockManager,
}

/// In-process transactional store holding a service's records, its outbox
/// and its processed-event ledger.
///
/// Cloning creates another handle to the same storage, so one clone can go
/// to the request path, one to the relay and one to each consumer.
///
/// ```
/// use outbox_relay::{Database, InMemoryDatabase, Transaction};
/// use serde_json::json;
///
/// let db = InMemoryDatabase::new();
/// db.transaction(|tx| tx.put("invoices", "1", json!({"amount": 10})))
///     .unwrap();
/// assert!(db.record("invoices", "1").unwrap().is_some());
/// ```
#[derive(Clone)]
pub struct InMemoryDatabase {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            clock,
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// How long `insert_processed` waits for a concurrent holder of the same key.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Committed record, if any.
    pub fn record(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let state = self.read("record")?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    /// Number of committed records in `table`.
    pub fn record_count(&self, table: &str) -> Result<usize, StoreError> {
        let state = self.read("record count")?;
        Ok(state.tables.get(table).map_or(0, |rows| rows.len()))
    }

    /// Every outbox row in creation order.
    pub fn outbox_events(&self) -> Result<Vec<DomainEvent>, StoreError> {
        Ok(self.read("outbox read")?.outbox.clone())
    }

    fn read(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.shared
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    fn write(&self, operation: &'static str) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.shared
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }

    /// Apply `change` to the row if `lease_token` still owns it.
    fn with_leased_row<F>(
        &self,
        id: Uuid,
        lease_token: Uuid,
        action: &'static str,
        change: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&mut DomainEvent, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut state = self.write(action)?;
        let event = find_mut(&mut state, id)?;

        if event.lease_token() != Some(lease_token) {
            return Err(StoreError::LeaseLost { id });
        }
        if !event.is_pending() {
            return Err(StoreError::InvalidTransition { id, action });
        }

        change(event, now);
        event.lease = None;
        Ok(())
    }
}

fn find_mut(state: &mut State, id: Uuid) -> Result<&mut DomainEvent, StoreError> {
    let index = *state
        .outbox_index
        .get(&id)
        .ok_or(StoreError::EventNotFound(id))?;
    state
        .outbox
        .get_mut(index)
        .ok_or(StoreError::EventNotFound(id))
}

impl Database for InMemoryDatabase {
    type Tx = InMemoryTransaction;

    fn begin(&self) -> Result<InMemoryTransaction, StoreError> {
        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
            lock_timeout: self.lock_timeout,
            writes: HashMap::new(),
            outbox: Vec::new(),
            processed: Vec::new(),
            row_locks: Vec::new(),
        })
    }
}

impl OutboxStore for InMemoryDatabase {
    fn fetch_batch(
        &self,
        worker_id: &str,
        limit: usize,
        older_than: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<DomainEvent>, StoreError> {
        let now = self.clock.now();
        let expires_at = add_std(now, lease);
        let mut state = self.write("claim")?;

        let mut heads: HashSet<(String, String)> = HashSet::new();
        let mut claimed = Vec::new();

        for event in state.outbox.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if event.is_dispatched() {
                continue;
            }
            // Anything behind the aggregate's oldest undispatched row waits its
            // turn. A FAILED head holds its successors until it is requeued.
            let head = (event.aggregate_type.clone(), event.aggregate_id.clone());
            if !heads.insert(head) {
                continue;
            }
            if !event.is_claimable(now, older_than) {
                continue;
            }

            event.attempts = event.attempts.saturating_add(1);
            event.lease = Some(Lease {
                worker_id: worker_id.to_string(),
                token: Uuid::new_v4(),
                expires_at,
            });
            claimed.push(event.clone());
        }

        if !claimed.is_empty() {
            debug!(worker_id, claimed = claimed.len(), "claimed outbox rows");
        }
        Ok(claimed)
    }

    fn mark_dispatched(&self, id: Uuid, lease_token: Uuid) -> Result<(), StoreError> {
        self.with_leased_row(id, lease_token, "dispatched", |event, now| {
            event.status = EventStatus::Dispatched;
            event.dispatched_at = Some(now);
            event.next_attempt_at = None;
            event.last_error = None;
        })
    }

    fn release(
        &self,
        id: Uuid,
        lease_token: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_leased_row(id, lease_token, "released", |event, _| {
            event.next_attempt_at = Some(retry_at);
            event.last_error = Some(error.to_string());
        })
    }

    fn mark_failed(&self, id: Uuid, lease_token: Uuid, error: &str) -> Result<(), StoreError> {
        self.with_leased_row(id, lease_token, "failed", |event, now| {
            event.status = EventStatus::Failed;
            event.failed_at = Some(now);
            event.next_attempt_at = None;
            event.last_error = Some(error.to_string());
        })
    }

    fn requeue_failed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut state = self.write("requeue")?;
        let event = find_mut(&mut state, id)?;
        if !event.is_failed() {
            return Err(StoreError::InvalidTransition {
                id,
                action: "requeued",
            });
        }

        // last_error and attempts stay for the audit trail
        event.status = EventStatus::Pending;
        event.requeued_at_attempts = event.attempts;
        event.failed_at = None;
        event.next_attempt_at = None;
        event.lease = None;
        Ok(())
    }

    fn get_event(&self, id: Uuid) -> Result<Option<DomainEvent>, StoreError> {
        let state = self.read("get event")?;
        Ok(state
            .outbox_index
            .get(&id)
            .and_then(|index| state.outbox.get(*index))
            .cloned())
    }

    fn events_by_status(&self, status: EventStatus) -> Result<Vec<DomainEvent>, StoreError> {
        let state = self.read("events by status")?;
        Ok(state
            .outbox
            .iter()
            .filter(|event| event.status == status)
            .cloned()
            .collect())
    }

    fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let state = self.read("status counts")?;
        let mut counts = StatusCounts::default();
        let mut failed_heads: HashSet<(&str, &str)> = HashSet::new();
        for event in &state.outbox {
            match event.status {
                EventStatus::Pending => {
                    counts.pending += 1;
                    if failed_heads.contains(&event.aggregate_key()) {
                        counts.blocked += 1;
                    }
                }
                EventStatus::Dispatched => counts.dispatched += 1,
                EventStatus::Failed => {
                    counts.failed += 1;
                    failed_heads.insert(event.aggregate_key());
                }
            }
        }
        Ok(counts)
    }
}

impl ProcessedLedger for InMemoryDatabase {
    fn is_processed(&self, consumer: &str, event_id: Uuid) -> Result<bool, StoreError> {
        let state = self.read("processed lookup")?;
        Ok(state
            .processed
            .contains_key(&(consumer.to_string(), event_id)))
    }

    fn processed_by(&self, consumer: &str) -> Result<Vec<ProcessedEventRecord>, StoreError> {
        let state = self.read("processed list")?;
        let mut records: Vec<_> = state
            .processed
            .values()
            .filter(|record| record.consumer_name == consumer)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.processed_at);
        Ok(records)
    }
}

struct RowLock {
    key: String,
    lock: Arc<InMemoryLock>,
}

/// Staged writes against an [`InMemoryDatabase`], applied in one step on commit.
pub struct InMemoryTransaction {
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
    writes: HashMap<(String, String), Value>,
    outbox: Vec<DomainEvent>,
    processed: Vec<(String, Uuid)>,
    row_locks: Vec<RowLock>,
}

impl InMemoryTransaction {
    fn apply(&mut self) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self
            .shared
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("commit"))?;

        // Validate before touching anything so a failed commit leaves no trace.
        for (consumer, event_id) in &self.processed {
            if state.processed.contains_key(&(consumer.clone(), *event_id)) {
                return Err(StoreError::Conflict(format!(
                    "{} already processed {}",
                    consumer, event_id
                )));
            }
        }
        for event in &self.outbox {
            if state.outbox_index.contains_key(&event.id) {
                return Err(StoreError::Conflict(format!("outbox row {}", event.id)));
            }
        }

        for ((table, key), value) in self.writes.drain() {
            state.tables.entry(table).or_default().insert(key, value);
        }

        for mut event in self.outbox.drain(..) {
            state.next_sequence += 1;
            event.sequence = state.next_sequence;
            let index = state.outbox.len();
            state.outbox_index.insert(event.id, index);
            state.outbox.push(event);
        }

        for (consumer, event_id) in self.processed.drain(..) {
            state.processed.insert(
                (consumer.clone(), event_id),
                ProcessedEventRecord {
                    consumer_name: consumer,
                    event_id,
                    processed_at: now,
                },
            );
        }

        Ok(())
    }

    fn release_row_locks(&mut self) {
        for row in self.row_locks.drain(..) {
            if let Err(err) = row.lock.release() {
                debug!(key = %row.key, error = %err, "row lock release failed");
            }
            drop(row.lock);
            let _ = self.shared.row_locks.forget(&row.key);
        }
    }

    fn discard(&mut self) {
        self.writes.clear();
        self.outbox.clear();
        self.processed.clear();
        self.release_row_locks();
    }
}

impl Transaction for InMemoryTransaction {
    fn next_id(&mut self, table: &str) -> Result<u64, StoreError> {
        let mut sequences = self
            .shared
            .sequences
            .lock()
            .map_err(|_| StoreError::LockPoisoned("next id"))?;
        let next = sequences.entry(table.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }

    fn get(&self, table: &str, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(value) = self.writes.get(&(table.to_string(), key.to_string())) {
            return Ok(Some(value.clone()));
        }
        let state = self
            .shared
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn put(&mut self, table: &str, key: &str, value: Value) -> Result<(), StoreError> {
        self.writes
            .insert((table.to_string(), key.to_string()), value);
        Ok(())
    }

    fn insert_outbox(&mut self, event: DomainEvent) -> Result<(), StoreError> {
        if self.outbox.iter().any(|staged| staged.id == event.id) {
            return Err(StoreError::Conflict(format!("outbox row {}", event.id)));
        }
        self.outbox.push(event);
        Ok(())
    }

    fn insert_processed(
        &mut self,
        consumer: &str,
        event_id: Uuid,
    ) -> Result<InsertOutcome, StoreError> {
        let staged = self
            .processed
            .iter()
            .any(|(name, id)| name == consumer && *id == event_id);
        if staged {
            return Ok(InsertOutcome::AlreadyProcessed);
        }

        let key = format!("processed:{}:{}", consumer, event_id);
        let lock = self.shared.row_locks.get_lock(&key)?;
        if !lock.acquire(self.lock_timeout)? {
            drop(lock);
            let _ = self.shared.row_locks.forget(&key);
            return Err(StoreError::LockTimeout(key));
        }
        self.row_locks.push(RowLock { key, lock });

        let state = self
            .shared
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("processed lookup"))?;
        if state
            .processed
            .contains_key(&(consumer.to_string(), event_id))
        {
            return Ok(InsertOutcome::AlreadyProcessed);
        }
        drop(state);

        self.processed.push((consumer.to_string(), event_id));
        Ok(InsertOutcome::Inserted)
    }

    fn commit(mut self) -> Result<(), StoreError> {
        let result = self.apply();
        self.discard();
        result
    }

    fn rollback(mut self) {
        self.discard();
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        let abandoned = !self.writes.is_empty() || !self.outbox.is_empty() || !self.processed.is_empty();
        if abandoned {
            debug!("transaction dropped without commit, rolling back");
        }
        self.discard();
    }
}
