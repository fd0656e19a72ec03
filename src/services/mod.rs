//! Reference wiring of the invoice management services.
//!
//! Each service owns its own [`Database`](crate::store::Database). Writes
//! go through a [`DomainWriter`](crate::writer::DomainWriter); reactions to
//! other services' events run inside a [`Consumer`](crate::consumer::Consumer):
//!
//! ```text
//! InvoiceService ── InvoiceCreated ──▶ pdf-consumer ── PDFGenerated ──▶ notification-consumer ── EmailSent
//! OrderService   ── OrderCreated
//! ```

mod collaborators;
mod invoice;
mod notification;
mod order;
mod pdf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::consumer::ConsumerError;

pub use collaborators::{
    ClientDirectory, DocumentRenderer, InMemoryClientDirectory, InMemoryMailer,
    InMemoryObjectStorage, Mailer, ObjectStorage, OutgoingEmail, StoredObject, TextRenderer,
};
pub use invoice::{Invoice, InvoiceService, NewInvoice};
pub use notification::{notification_consumer, NotificationSettings, NOTIFICATION_CONSUMER};
pub use order::{NewOrder, NewOrderItem, Order, OrderItem, OrderService};
pub use pdf::{pdf_consumer, PdfSettings, PDF_CONSUMER};

pub const INVOICE_SOURCE: &str = "com.invoicemanagement.invoice";
pub const ORDER_SOURCE: &str = "com.invoicemanagement.order";
pub const PDF_SOURCE: &str = "com.invoicemanagement.pdf";
pub const NOTIFICATION_SOURCE: &str = "com.invoicemanagement.notification";

/// Failures of the services' external collaborators.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("object storage failed: {0}")]
    Storage(String),
    #[error("mail delivery failed: {0}")]
    Mail(String),
    #[error("client directory failed: {0}")]
    Directory(String),
}

impl From<ServiceError> for ConsumerError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Config(_) => ConsumerError::Rejected(err.to_string()),
            other => ConsumerError::Effect(other.to_string()),
        }
    }
}
