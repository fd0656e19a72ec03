//! The Domain Writer: the only sanctioned way to produce an outbox row.
//!
//! A state mutation and the event announcing it are staged in one
//! transaction and commit together. The bus is never touched here; the
//! relay picks the row up after commit.

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::event::{DomainEvent, EventPayload};
use crate::store::{Database, StoreError, Transaction};

/// The aggregate mutation and its outbox row were rolled back together.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("event payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid change: {0}")]
    Invalid(String),
}

/// Commits aggregate mutations together with their domain events.
pub struct DomainWriter<D: Database> {
    db: D,
    source: String,
    clock: Arc<dyn Clock>,
}

impl<D: Database> DomainWriter<D> {
    /// `source` is the service-qualified name stamped on every row, e.g.
    /// `com.invoicemanagement.invoice`.
    pub fn new(db: D, source: impl Into<String>) -> Self {
        Self {
            db,
            source: source.into(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Apply `mutation` and append `event` to the outbox atomically.
    ///
    /// Returns the outbox row as inserted. If the mutation fails or the payload cannot
    /// be serialized, nothing is written.
    pub fn record_change<P, F>(&self, mutation: F, event: P) -> Result<DomainEvent, WriteError>
    where
        P: EventPayload,
        F: FnOnce(&mut D::Tx) -> Result<(), WriteError>,
    {
        self.record_with(|tx| {
            mutation(tx)?;
            Ok(((), event))
        })
        .map(|(_, row)| row)
    }

    /// Like [`record_change`](Self::record_change), for mutations whose event
    /// depends on what they wrote (typically an allocated id).
    pub fn record_with<T, P, F>(&self, mutation: F) -> Result<(T, DomainEvent), WriteError>
    where
        P: EventPayload,
        F: FnOnce(&mut D::Tx) -> Result<(T, P), WriteError>,
    {
        let (value, row) = self.db.transaction(|tx| {
            let (value, payload) = mutation(tx)?;
            let row = DomainEvent::from_payload(self.source.as_str(), &payload, self.clock.now())?;
            tx.insert_outbox(row.clone())?;
            Ok::<_, WriteError>((value, row))
        })?;

        debug!(
            event_id = %row.id,
            event_type = %row.event_type,
            aggregate_id = %row.aggregate_id,
            "recorded domain event"
        );
        Ok((value, row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{InvoiceCreated, InvoiceUpdated};
    use crate::store::{InMemoryDatabase, OutboxStore};
    use rust_decimal_macros::dec;
    use serde::ser::Error as _;
    use serde::{Deserialize, Serialize, Serializer};
    use serde_json::json;

    fn writer() -> DomainWriter<InMemoryDatabase> {
        DomainWriter::new(InMemoryDatabase::new(), "com.example.invoice")
    }

    #[test]
    fn writes_state_and_pending_row_together() {
        let writer = writer();

        let row = writer
            .record_change(
                |tx| Ok(tx.put("invoices", "1", json!({"clientId": 7}))?),
                InvoiceCreated {
                    invoice_id: 1,
                    client_id: 7,
                    amount: dec!(250.00),
                },
            )
            .unwrap();

        let db = writer.database();
        assert!(db.record("invoices", "1").unwrap().is_some());
        let stored = db.get_event(row.id).unwrap().unwrap();
        assert!(stored.is_pending());
        assert_eq!(stored.source, "com.example.invoice");
        assert_eq!(stored.aggregate_id, "1");
        assert_eq!(stored.payload["clientId"], json!(7));
    }

    #[test]
    fn failed_mutation_leaves_no_row() {
        let writer = writer();

        let result = writer.record_change(
            |tx| {
                tx.put("invoices", "1", json!({}))?;
                Err(WriteError::Invalid("amount must be positive".into()))
            },
            InvoiceUpdated {
                invoice_id: 1,
                status: "paid".into(),
            },
        );

        assert!(matches!(result, Err(WriteError::Invalid(_))));
        let db = writer.database();
        assert!(db.outbox_events().unwrap().is_empty());
        assert!(db.record("invoices", "1").unwrap().is_none());
    }

    #[derive(Debug, Deserialize)]
    struct Unwritable {
        id: u64,
    }

    impl Serialize for Unwritable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("refusing to serialize"))
        }
    }

    impl EventPayload for Unwritable {
        const EVENT_TYPE: &'static str = "Unwritable";
        const AGGREGATE_TYPE: &'static str = "test";
        const SCHEMA_VERSION: u32 = 1;

        fn aggregate_id(&self) -> String {
            self.id.to_string()
        }
    }

    #[test]
    fn unserializable_event_rolls_back_the_mutation() {
        let writer = writer();

        let result = writer.record_change(
            |tx| tx.put("invoices", "1", json!({})).map_err(Into::into),
            Unwritable { id: 1 },
        );

        assert!(matches!(result, Err(WriteError::Serialization(_))));
        assert_eq!(writer.database().record_count("invoices").unwrap(), 0);
    }

    #[test]
    fn record_with_builds_the_event_from_the_mutation() {
        let writer = writer();

        let (id, row) = writer
            .record_with(|tx| {
                let id = tx.next_id("invoices")?;
                tx.put("invoices", &id.to_string(), json!({"status": "draft"}))?;
                Ok((
                    id,
                    InvoiceUpdated {
                        invoice_id: id,
                        status: "draft".into(),
                    },
                ))
            })
            .unwrap();

        assert_eq!(id, 1);
        assert_eq!(row.event_type, "InvoiceUpdated");
        assert_eq!(row.aggregate_id, "1");
    }
}
