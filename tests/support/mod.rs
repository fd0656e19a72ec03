//! Fault injection shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use outbox_relay::bus::{Ack, PublishError, Publisher};
use outbox_relay::{
    DomainEvent, EventEnvelope, EventStatus, OutboxStore, StatusCounts, StoreError,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Route `tracing` output through the test harness. `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

/// Fails the first `failures` publishes with a transient error, then delegates.
pub struct FlakyPublisher<P> {
    inner: P,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl<P: Publisher> FlakyPublisher<P> {
    pub fn new(inner: P, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<P: Publisher> Publisher for FlakyPublisher<P> {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Result<Ack, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take(&self.failures) {
            return Err(PublishError::Transient("bus throttled".into()));
        }
        self.inner.publish(topic, envelope, timeout)
    }
}

/// Rejects every envelope as if the bus refused its schema.
#[derive(Default)]
pub struct RejectingPublisher {
    calls: AtomicUsize,
}

impl RejectingPublisher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Publisher for RejectingPublisher {
    fn publish(
        &self,
        _topic: &str,
        envelope: &EventEnvelope,
        _timeout: Duration,
    ) -> Result<Ack, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PublishError::Permanent(format!(
            "schema rejected for {}",
            envelope.detail_type
        )))
    }
}

/// Publishes every envelope twice, the way an at-least-once bus may.
pub struct DuplicatingPublisher<P> {
    inner: P,
}

impl<P: Publisher> DuplicatingPublisher<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Publisher> Publisher for DuplicatingPublisher<P> {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Result<Ack, PublishError> {
        self.inner.publish(topic, envelope, timeout)?;
        self.inner.publish(topic, envelope, timeout)
    }
}

/// Loses the first `crashes` `mark_dispatched` calls, as if the worker died
/// after the bus accepted the message. The row keeps its lease until it
/// expires.
pub struct CrashAfterPublish<S> {
    inner: S,
    crashes: AtomicUsize,
}

impl<S: OutboxStore> CrashAfterPublish<S> {
    pub fn new(inner: S, crashes: usize) -> Self {
        Self {
            inner,
            crashes: AtomicUsize::new(crashes),
        }
    }
}

impl<S: OutboxStore> OutboxStore for CrashAfterPublish<S> {
    fn fetch_batch(
        &self,
        worker_id: &str,
        limit: usize,
        older_than: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<DomainEvent>, StoreError> {
        self.inner.fetch_batch(worker_id, limit, older_than, lease)
    }

    fn mark_dispatched(&self, id: Uuid, lease_token: Uuid) -> Result<(), StoreError> {
        if take(&self.crashes) {
            return Err(StoreError::LockPoisoned("worker crashed"));
        }
        self.inner.mark_dispatched(id, lease_token)
    }

    fn release(
        &self,
        id: Uuid,
        lease_token: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.release(id, lease_token, error, retry_at)
    }

    fn mark_failed(&self, id: Uuid, lease_token: Uuid, error: &str) -> Result<(), StoreError> {
        self.inner.mark_failed(id, lease_token, error)
    }

    fn requeue_failed(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.requeue_failed(id)
    }

    fn get_event(&self, id: Uuid) -> Result<Option<DomainEvent>, StoreError> {
        self.inner.get_event(id)
    }

    fn events_by_status(&self, status: EventStatus) -> Result<Vec<DomainEvent>, StoreError> {
        self.inner.events_by_status(status)
    }

    fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        self.inner.status_counts()
    }
}
