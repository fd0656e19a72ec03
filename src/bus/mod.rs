//! Event bus boundary.
//!
//! The outbox core talks to the bus through two narrow traits:
//!
//! ```text
//! ┌──────────────┐  publish(topic, envelope, timeout)  ┌──────────────┐
//! │    Relay     │ ──────────────────────────────────▶ │              │
//! └──────────────┘          Ack | PublishError          │   Event Bus  │
//! ┌──────────────┐  poll(timeout) / ack / nack          │              │
//! │   Consumer   │ ◀────────────────────────────────── │              │
//! └──────────────┘                                      └──────────────┘
//! ```
//!
//! Publish errors are classified: transient failures are retried by the
//! relay with backoff, permanent ones escalate the outbox row to `FAILED`.
//! [`InMemoryBus`] implements both sides for tests and single-process use.

mod in_memory;
mod publisher;
mod subscriber;

pub use in_memory::{DeadLetter, InMemoryBus, InMemorySubscription};
pub use publisher::{Ack, PublishError, Publisher};
pub use subscriber::{BusError, Delivery, Subscriber};
