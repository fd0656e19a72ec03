use thiserror::Error;

use crate::event::EnvelopeError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Envelope(EnvelopeError),
    #[error("{detail_type} schema version {version} is newer than supported version {supported}")]
    UnsupportedSchema {
        detail_type: String,
        version: u32,
        supported: u32,
    },
    /// The side effect itself failed (storage upload, mail delivery).
    #[error("side effect failed: {0}")]
    Effect(String),
    /// The event is well-formed but cannot be applied, e.g. an unknown client.
    #[error("event rejected: {0}")]
    Rejected(String),
}

impl From<EnvelopeError> for ConsumerError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::UnsupportedSchema {
                detail_type,
                version,
                supported,
            } => ConsumerError::UnsupportedSchema {
                detail_type,
                version,
                supported,
            },
            other => ConsumerError::Envelope(other),
        }
    }
}
