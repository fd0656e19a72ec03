//! Event payloads shared by every producer and consumer.
//!
//! Field names are camelCase on the wire. Each payload declares its detail
//! type, owning aggregate and schema version through `#[event(...)]`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::EventPayload;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EventPayload)]
#[serde(rename_all = "camelCase")]
#[event(name = "InvoiceCreated", aggregate = "invoice", id = invoice_id)]
pub struct InvoiceCreated {
    pub invoice_id: u64,
    pub client_id: u64,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EventPayload)]
#[serde(rename_all = "camelCase")]
#[event(name = "InvoiceUpdated", aggregate = "invoice", id = invoice_id)]
pub struct InvoiceUpdated {
    pub invoice_id: u64,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EventPayload)]
#[serde(rename_all = "camelCase")]
#[event(name = "OrderCreated", aggregate = "order", id = order_id)]
pub struct OrderCreated {
    pub order_id: u64,
    pub client_id: u64,
    pub amount: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EventPayload)]
#[serde(rename_all = "camelCase")]
#[event(name = "PDFGenerated", aggregate = "invoice", id = invoice_id)]
pub struct PdfGenerated {
    pub invoice_id: u64,
    pub client_id: u64,
    pub pdf_url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, EventPayload)]
#[serde(rename_all = "camelCase")]
#[event(name = "EmailSent", aggregate = "invoice", id = invoice_id)]
pub struct EmailSent {
    pub invoice_id: u64,
    pub recipient_email: String,
    pub message_id: String,
}
