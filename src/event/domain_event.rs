use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::EventPayload;

/// Dispatch status of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Dispatched,
    Failed,
}

/// Temporary exclusive ownership of a row by one relay worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    /// Fresh per claim; `mark_dispatched` must present it.
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A pending domain event, stored in the outbox next to the state change it
/// announces.
///
/// `id`, aggregate linkage and `payload` are fixed at creation. Only the
/// dispatch bookkeeping fields change afterwards, and only through the
/// outbox store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    /// Service-qualified name of the producer.
    pub source: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Insertion order assigned by the store.
    pub sequence: u64,
    pub status: EventStatus,
    pub attempts: u32,
    /// `attempts` when an operator last requeued the row. The retry budget
    /// counts from here; `attempts` itself only ever grows.
    #[serde(default)]
    pub requeued_at_attempts: u32,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease: Option<Lease>,
}

impl DomainEvent {
    /// Build a new PENDING event from a typed payload.
    ///
    /// `created_at` and `sequence` are provisional until the store inserts the row.
    pub fn from_payload<P: EventPayload>(
        source: impl Into<String>,
        payload: &P,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_value(payload)?;
        Ok(Self::new(
            source,
            P::AGGREGATE_TYPE,
            payload.aggregate_id(),
            P::EVENT_TYPE,
            P::SCHEMA_VERSION,
            body,
            now,
        ))
    }

    pub fn new(
        source: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        schema_version: u32,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            schema_version,
            payload,
            created_at: now,
            sequence: 0,
            status: EventStatus::Pending,
            attempts: 0,
            requeued_at_attempts: 0,
            dispatched_at: None,
            failed_at: None,
            next_attempt_at: None,
            last_error: None,
            lease: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == EventStatus::Pending
    }

    pub fn is_dispatched(&self) -> bool {
        self.status == EventStatus::Dispatched
    }

    pub fn is_failed(&self) -> bool {
        self.status == EventStatus::Failed
    }

    /// Publish attempts since the row was created or last requeued.
    pub fn attempts_since_requeue(&self) -> u32 {
        self.attempts.saturating_sub(self.requeued_at_attempts)
    }

    /// Key used to serialize dispatch per aggregate.
    pub fn aggregate_key(&self) -> (&str, &str) {
        (&self.aggregate_type, &self.aggregate_id)
    }

    /// Token of the current lease, if the row is claimed.
    pub fn lease_token(&self) -> Option<Uuid> {
        self.lease.as_ref().map(|lease| lease.token)
    }

    /// Whether a relay worker may claim this row at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>, older_than: DateTime<Utc>) -> bool {
        self.is_pending()
            && self.created_at <= older_than
            && !self.lease.as_ref().is_some_and(|lease| lease.is_live(now))
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}
