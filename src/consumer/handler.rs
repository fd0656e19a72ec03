use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Admission, ConsumerError, DedupGuard};
use crate::clock::{Clock, SystemClock};
use crate::event::{DomainEvent, EventEnvelope, EventPayload};
use crate::store::{Database, StoreError, Transaction};

type Handler<Tx> =
    Box<dyn Fn(&mut HandlerContext<'_, Tx>) -> Result<(), ConsumerError> + Send + Sync>;

/// What a handler sees while its event is being applied.
pub struct HandlerContext<'a, Tx> {
    envelope: &'a EventEnvelope,
    tx: &'a mut Tx,
    source: &'a str,
    now: DateTime<Utc>,
}

impl<'a, Tx: Transaction> HandlerContext<'a, Tx> {
    pub fn envelope(&self) -> &EventEnvelope {
        self.envelope
    }

    pub fn event_id(&self) -> Uuid {
        self.envelope.event_id
    }

    /// Decode the detail as `P`, checking type and schema version.
    pub fn detail<P: EventPayload>(&self) -> Result<P, ConsumerError> {
        Ok(self.envelope.decode()?)
    }

    /// The transaction holding the processed marker.
    pub fn tx(&mut self) -> &mut Tx {
        self.tx
    }

    /// Append a follow-up event to this service's outbox. It commits (or
    /// rolls back) together with the processed marker.
    pub fn record_event<P: EventPayload>(&mut self, payload: &P) -> Result<DomainEvent, ConsumerError> {
        let row = DomainEvent::from_payload(self.source, payload, self.now).map_err(StoreError::from)?;
        self.tx.insert_outbox(row.clone())?;
        Ok(row)
    }
}

/// What `Consumer::handle` did with an envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Duplicate,
    /// No handler is registered for the detail type.
    Ignored,
}

/// A named consumer: a handler per detail type behind a [`DedupGuard`].
///
/// ```
/// use outbox_relay::{Consumer, InMemoryDatabase, Transaction};
/// use outbox_relay::contracts::InvoiceCreated;
///
/// let consumer = Consumer::new("audit-consumer", InMemoryDatabase::new(), "com.example.audit")
///     .on_payload(|ctx, created: InvoiceCreated| {
///         let key = created.invoice_id.to_string();
///         ctx.tx().put("audit", &key, serde_json::json!({"seen": true}))?;
///         Ok(())
///     });
/// assert!(consumer.handles("InvoiceCreated"));
/// ```
pub struct Consumer<D: Database> {
    name: String,
    source: String,
    guard: DedupGuard<D>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<String, Handler<D::Tx>>,
}

impl<D: Database> Consumer<D> {
    /// `source` stamps any follow-up events the handlers record.
    pub fn new(name: impl Into<String>, db: D, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            guard: DedupGuard::new(db),
            clock: Arc::new(SystemClock),
            handlers: HashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a handler for `detail_type`, replacing any previous one.
    pub fn on<F>(mut self, detail_type: &str, handler: F) -> Self
    where
        F: Fn(&mut HandlerContext<'_, D::Tx>) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        self.handlers
            .insert(detail_type.to_string(), Box::new(handler));
        self
    }

    /// Register a handler that receives the decoded payload.
    pub fn on_payload<P, F>(self, handler: F) -> Self
    where
        P: EventPayload + 'static,
        F: Fn(&mut HandlerContext<'_, D::Tx>, P) -> Result<(), ConsumerError> + Send + Sync + 'static,
    {
        self.on(P::EVENT_TYPE, move |ctx| {
            let payload = ctx.detail::<P>()?;
            handler(ctx, payload)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &D {
        self.guard.database()
    }

    pub fn handles(&self, detail_type: &str) -> bool {
        self.handlers.contains_key(detail_type)
    }

    pub fn detail_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Apply `envelope` at most once for this consumer.
    ///
    /// On error nothing was committed and the envelope should be redelivered.
    pub fn handle(&self, envelope: &EventEnvelope) -> Result<Outcome, ConsumerError> {
        let Some(handler) = self.handlers.get(&envelope.detail_type) else {
            debug!(
                consumer = %self.name,
                event_id = %envelope.event_id,
                detail_type = %envelope.detail_type,
                "no handler registered, ignoring"
            );
            return Ok(Outcome::Ignored);
        };

        let now = self.clock.now();
        let admitted = self.guard.admit(&self.name, envelope.event_id, |tx| {
            let mut ctx = HandlerContext {
                envelope,
                tx,
                source: &self.source,
                now,
            };
            handler(&mut ctx)
        });

        match admitted {
            Ok(Admission::Applied) => {
                debug!(
                    consumer = %self.name,
                    event_id = %envelope.event_id,
                    detail_type = %envelope.detail_type,
                    "event applied"
                );
                Ok(Outcome::Applied)
            }
            Ok(Admission::Duplicate) => {
                info!(
                    consumer = %self.name,
                    event_id = %envelope.event_id,
                    "duplicate delivery suppressed"
                );
                Ok(Outcome::Duplicate)
            }
            Err(err) => {
                warn!(
                    consumer = %self.name,
                    event_id = %envelope.event_id,
                    error = %err,
                    "event not applied"
                );
                Err(err)
            }
        }
    }
}
