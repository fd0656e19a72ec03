use std::time::Duration;

use thiserror::Error;

use crate::event::{EnvelopeError, EventEnvelope};

/// One delivery of a message to a subscription.
///
/// A nacked message comes back with the same `delivery_id` and a higher
/// `attempt`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_id: u64,
    pub attempt: u32,
    /// The JSON wire document.
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        EventEnvelope::from_slice(&self.body)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("topic {0} does not exist")]
    TopicNotFound(String),
    #[error("subscription {0} does not exist")]
    UnknownSubscription(String),
    #[error("subscription {name} is already bound to topic {topic}")]
    SubscriptionConflict { name: String, topic: String },
    #[error("delivery {0} is not in flight")]
    UnknownDelivery(u64),
    #[error("bus state poisoned")]
    Poisoned,
    #[error("bus unavailable: {0}")]
    Unavailable(String),
}

/// Pull-based subscription to a topic.
pub trait Subscriber: Send + Sync {
    /// Wait up to `timeout` for the next delivery.
    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BusError>;

    /// The delivery was handled; do not redeliver.
    fn ack(&self, delivery_id: u64) -> Result<(), BusError>;

    /// Handling failed; redeliver (or dead-letter once attempts run out).
    fn nack(&self, delivery_id: u64, reason: &str) -> Result<(), BusError>;
}
