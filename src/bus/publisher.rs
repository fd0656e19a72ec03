use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::event::EventEnvelope;

/// Broker acknowledgement of an accepted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub message_id: String,
}

/// Error type for publish operations.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PublishError {
    /// Network failure or throttling. Worth retrying.
    #[error("transient publish failure: {0}")]
    Transient(String),
    /// No acknowledgement within the publish timeout. Treated as transient.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    /// Malformed payload, unknown topic, schema rejected. Never retried.
    #[error("publish rejected: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, PublishError::Permanent(_))
    }
}

/// Trait for publishing envelopes to a message bus.
///
/// Implementations must return within roughly `timeout`, reporting
/// [`PublishError::Timeout`] when the broker did not acknowledge in time.
pub trait Publisher: Send + Sync {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Result<Ack, PublishError>;
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        timeout: Duration,
    ) -> Result<Ack, PublishError> {
        (**self).publish(topic, envelope, timeout)
    }
}
