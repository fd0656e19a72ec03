//! Transactional outbox, lease-based relay and idempotent consumers.
//!
//! A service records each state change and the event announcing it in one
//! transaction ([`DomainWriter`]). A [`Relay`] drains the outbox to the bus
//! with at-least-once delivery, preserving order per aggregate. Each
//! [`Consumer`] applies an event's side effect at most once, guarded by a
//! processed-event marker committed with the effect.
//!
//! ```
//! use outbox_relay::bus::InMemoryBus;
//! use outbox_relay::services::{InvoiceService, NewInvoice};
//! use outbox_relay::{InMemoryDatabase, OutboxStore, Relay, RelayConfig};
//! use rust_decimal::Decimal;
//!
//! let db = InMemoryDatabase::new();
//! let invoices = InvoiceService::new(db.clone());
//! invoices
//!     .create_invoice(NewInvoice {
//!         client_id: 7,
//!         amount: Decimal::new(25000, 2),
//!         due_date: chrono::NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
//!     })
//!     .unwrap();
//!
//! let bus = InMemoryBus::new().with_topic("InvoiceManagementEventBus");
//! let relay = Relay::new(db.clone(), bus.clone(), RelayConfig::new("relay-1"));
//! assert_eq!(relay.drain().unwrap().dispatched, 1);
//! assert_eq!(db.status_counts().unwrap().dispatched, 1);
//! ```

extern crate self as outbox_relay;

pub mod bus;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod contracts;
pub mod event;
pub mod lock;
pub mod relay;
pub mod services;
pub mod store;
pub mod writer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigSource, ConsumerConfig, EnvSource, RelayConfig, StaticSource};
pub use consumer::{
    Admission, Consumer, ConsumerError, ConsumerStats, ConsumerThread, DedupGuard,
    HandlerContext, Outcome,
};
pub use event::{
    DomainEvent, EnvelopeError, EventEnvelope, EventPayload, EventStatus, Lease,
    SCHEMA_VERSION_FIELD,
};
pub use relay::{BackoffPolicy, DrainResult, Relay, RelayStats, RelayThread};
pub use store::{
    Database, InMemoryDatabase, InMemoryTransaction, InsertOutcome, OutboxStore,
    ProcessedEventRecord, ProcessedLedger, StatusCounts, StoreError, Transaction,
};
pub use writer::{DomainWriter, WriteError};

// Derive macro shares the trait's name, like serde's `Serialize`.
pub use outbox_relay_macros::EventPayload;
