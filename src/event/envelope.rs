use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::{DomainEvent, EventPayload};

/// Name of the version field carried inside every `detail`.
pub const SCHEMA_VERSION_FIELD: &str = "schemaVersion";

/// Errors reading a wire envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("expected detail type {expected}, got {actual}")]
    WrongType {
        expected: &'static str,
        actual: String,
    },
    #[error("{detail_type} schema version {version} is newer than supported version {supported}")]
    UnsupportedSchema {
        detail_type: String,
        version: u32,
        supported: u32,
    },
}

/// The JSON document that travels on the bus. Stable across all producers
/// and consumers:
///
/// ```json
/// {
///   "eventId": "<uuid>",
///   "source": "com.invoicemanagement.invoice",
///   "detailType": "InvoiceCreated",
///   "detail": { "schemaVersion": 1, "invoiceId": 1, "clientId": 7, "amount": 250.0 },
///   "occurredAt": "2024-01-01T00:00:00Z"
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Wrap an outbox row for publication. The row's schema version is
    /// stamped into `detail`.
    pub fn from_domain_event(event: &DomainEvent) -> Self {
        let mut detail = event.payload.clone();
        if let Value::Object(fields) = &mut detail {
            fields.insert(
                SCHEMA_VERSION_FIELD.to_string(),
                Value::from(event.schema_version),
            );
        }

        Self {
            event_id: event.id,
            source: event.source.clone(),
            detail_type: event.event_type.clone(),
            detail,
            occurred_at: event.created_at,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Schema version of `detail`. Events written before versioning are read
    /// as version 1.
    pub fn schema_version(&self) -> u32 {
        self.detail
            .get(SCHEMA_VERSION_FIELD)
            .and_then(Value::as_u64)
            .and_then(|version| u32::try_from(version).ok())
            .unwrap_or(1)
    }

    /// Decode `detail` as a typed payload.
    ///
    /// Any version up to `P::SCHEMA_VERSION` is accepted; newer versions are
    /// refused rather than guessed at.
    pub fn decode<P: EventPayload>(&self) -> Result<P, EnvelopeError> {
        if self.detail_type != P::EVENT_TYPE {
            return Err(EnvelopeError::WrongType {
                expected: P::EVENT_TYPE,
                actual: self.detail_type.clone(),
            });
        }

        let version = self.schema_version();
        if version > P::SCHEMA_VERSION {
            return Err(EnvelopeError::UnsupportedSchema {
                detail_type: self.detail_type.clone(),
                version,
                supported: P::SCHEMA_VERSION,
            });
        }

        Ok(P::deserialize(&self.detail)?)
    }
}
