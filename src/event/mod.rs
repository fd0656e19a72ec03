//! Events: the outbox row, the JSON wire envelope and typed payloads.

mod domain_event;
mod envelope;
mod payload;

pub use domain_event::{DomainEvent, EventStatus, Lease};
pub use envelope::{EnvelopeError, EventEnvelope, SCHEMA_VERSION_FIELD};
pub use payload::EventPayload;
