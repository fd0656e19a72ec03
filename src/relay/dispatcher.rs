use std::sync::Arc;
use std::thread;

use tracing::{debug, error, warn};

use crate::bus::Publisher;
use crate::clock::{add_std, sub_std, Clock, SystemClock};
use crate::config::RelayConfig;
use crate::event::{DomainEvent, EventEnvelope};
use crate::store::{OutboxStore, StoreError};

/// Result of one poll cycle (or the sum of several).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// Rows claimed from the store.
    pub claimed: usize,
    /// Rows published and marked DISPATCHED.
    pub dispatched: usize,
    /// Rows released for another attempt after a transient error.
    pub retried: usize,
    /// Rows marked FAILED.
    pub failed: usize,
    /// Rows whose lease was taken over by another worker, or was too close to
    /// expiry to start a publish.
    pub lease_conflicts: usize,
    /// Rows whose bookkeeping update failed; their lease will expire.
    pub store_errors: usize,
}

impl DrainResult {
    pub fn merge(&mut self, other: DrainResult) {
        self.claimed += other.claimed;
        self.dispatched += other.dispatched;
        self.retried += other.retried;
        self.failed += other.failed;
        self.lease_conflicts += other.lease_conflicts;
        self.store_errors += other.store_errors;
    }

    fn record(&mut self, outcome: Dispatch) {
        match outcome {
            Dispatch::Dispatched => self.dispatched += 1,
            Dispatch::Retried => self.retried += 1,
            Dispatch::Failed => self.failed += 1,
            Dispatch::LeaseLost => self.lease_conflicts += 1,
            Dispatch::StoreError => self.store_errors += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Dispatch {
    Dispatched,
    Retried,
    Failed,
    LeaseLost,
    StoreError,
}

/// Moves outbox rows from an [`OutboxStore`] to a [`Publisher`].
///
/// ## Example
///
/// ```
/// use outbox_relay::bus::InMemoryBus;
/// use outbox_relay::{InMemoryDatabase, Relay, RelayConfig};
///
/// let db = InMemoryDatabase::new();
/// let bus = InMemoryBus::new().with_topic("events");
/// let relay = Relay::new(db, bus, RelayConfig::new("relay-1").with_topic("events"));
///
/// let result = relay.drain().unwrap();
/// assert_eq!(result.claimed, 0);
/// ```
pub struct Relay<S, P> {
    store: S,
    publisher: P,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl<S: OutboxStore, P: Publisher> Relay<S, P> {
    pub fn new(store: S, publisher: P, config: RelayConfig) -> Self {
        if let Err(err) = config.validate() {
            warn!(
                worker_id = %config.worker_id,
                error = %err,
                "relay lease is too short, rows near the end of a batch will be skipped"
            );
        }
        Self {
            store,
            publisher,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Claim one batch and dispatch it.
    ///
    /// Only the claim itself can fail the cycle; per-row bookkeeping errors
    /// are counted in the result and left for lease expiry to recover.
    pub fn poll_once(&self) -> Result<DrainResult, StoreError> {
        let now = self.clock.now();
        let older_than = sub_std(now, self.config.settle_delay());
        let batch = self.store.fetch_batch(
            &self.config.worker_id,
            self.config.batch_size,
            older_than,
            self.config.lease(),
        )?;

        let mut result = DrainResult {
            claimed: batch.len(),
            ..DrainResult::default()
        };

        // Every claimed row heads a different aggregate, so they can go out together.
        for chunk in batch.chunks(self.config.max_in_flight.max(1)) {
            if let [event] = chunk {
                result.record(self.dispatch(event));
                continue;
            }

            let outcomes: Vec<Dispatch> = thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|event| scope.spawn(move || self.dispatch(event)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or(Dispatch::StoreError))
                    .collect()
            });
            for outcome in outcomes {
                result.record(outcome);
            }
        }

        Ok(result)
    }

    /// Poll until a cycle claims nothing. Rows still backing off or leased
    /// elsewhere are left for later.
    pub fn drain(&self) -> Result<DrainResult, StoreError> {
        let mut total = DrainResult::default();
        loop {
            let cycle = self.poll_once()?;
            total.merge(cycle);
            if cycle.claimed == 0 {
                return Ok(total);
            }
        }
    }

    fn dispatch(&self, event: &DomainEvent) -> Dispatch {
        let Some(lease) = event.lease.as_ref() else {
            error!(event_id = %event.id, "claimed row carries no lease");
            return Dispatch::StoreError;
        };
        let token = lease.token;

        // The publish has to finish inside the lease; otherwise another worker
        // may reclaim the row and publish it too.
        let must_finish_by = add_std(self.clock.now(), self.config.publish_timeout());
        if lease.expires_at <= must_finish_by {
            debug!(
                event_id = %event.id,
                aggregate_id = %event.aggregate_id,
                lease_expires_at = %lease.expires_at,
                "lease too short to publish, leaving row for the next claim"
            );
            return Dispatch::LeaseLost;
        }

        let envelope = EventEnvelope::from_domain_event(event);
        let published = self.publisher.publish(
            &self.config.topic,
            &envelope,
            self.config.publish_timeout(),
        );

        match published {
            Ok(ack) => match self.store.mark_dispatched(event.id, token) {
                Ok(()) => {
                    debug!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        aggregate_id = %event.aggregate_id,
                        attempts = event.attempts,
                        message_id = %ack.message_id,
                        "event dispatched"
                    );
                    Dispatch::Dispatched
                }
                Err(err) => self.bookkeeping_failed(event, err),
            },
            Err(err)
                if err.is_transient()
                    && event.attempts_since_requeue() < self.config.max_attempts =>
            {
                let delay = self.config.backoff.delay(event.attempts_since_requeue());
                let retry_at = add_std(self.clock.now(), delay);
                warn!(
                    event_id = %event.id,
                    aggregate_id = %event.aggregate_id,
                    attempts = event.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "publish failed, will retry"
                );
                match self.store.release(event.id, token, &err.to_string(), retry_at) {
                    Ok(()) => Dispatch::Retried,
                    Err(store_err) => self.bookkeeping_failed(event, store_err),
                }
            }
            Err(err) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    aggregate_id = %event.aggregate_id,
                    attempts = event.attempts,
                    error = %err,
                    "publish abandoned, event marked FAILED"
                );
                match self.store.mark_failed(event.id, token, &err.to_string()) {
                    Ok(()) => Dispatch::Failed,
                    Err(store_err) => self.bookkeeping_failed(event, store_err),
                }
            }
        }
    }

    fn bookkeeping_failed(&self, event: &DomainEvent, err: StoreError) -> Dispatch {
        if err.is_contention() {
            debug!(event_id = %event.id, error = %err, "lease taken over by another worker");
            return Dispatch::LeaseLost;
        }
        error!(event_id = %event.id, error = %err, "outbox bookkeeping failed");
        Dispatch::StoreError
    }
}
