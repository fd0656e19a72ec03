use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::INVOICE_SOURCE;
use crate::clock::Clock;
use crate::contracts::{InvoiceCreated, InvoiceUpdated};
use crate::store::{Database, StoreError, Transaction};
use crate::writer::{DomainWriter, WriteError};

const INVOICES: &str = "invoices";

/// Status of a freshly created invoice.
pub const UNPAID: &str = "unpaid";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: u64,
    pub client_id: u64,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub status: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub client_id: u64,
    pub amount: Decimal,
    pub due_date: NaiveDate,
}

/// Invoice records. Every change is announced through the outbox.
pub struct InvoiceService<D: Database> {
    writer: DomainWriter<D>,
}

impl<D: Database> InvoiceService<D> {
    pub fn new(db: D) -> Self {
        Self {
            writer: DomainWriter::new(db, INVOICE_SOURCE),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer: self.writer.with_clock(clock),
        }
    }

    pub fn database(&self) -> &D {
        self.writer.database()
    }

    /// Store a new invoice and record `InvoiceCreated`.
    pub fn create_invoice(&self, new: NewInvoice) -> Result<Invoice, WriteError> {
        if new.amount <= Decimal::ZERO {
            return Err(WriteError::Invalid(format!(
                "invoice amount must be positive, got {}",
                new.amount
            )));
        }

        let (invoice, _) = self.writer.record_with(|tx| {
            let id = tx.next_id(INVOICES)?;
            let invoice = Invoice {
                id,
                client_id: new.client_id,
                amount: new.amount,
                due_date: new.due_date,
                status: UNPAID.to_string(),
            };
            tx.put_as(INVOICES, &id.to_string(), &invoice)?;

            let event = InvoiceCreated {
                invoice_id: id,
                client_id: invoice.client_id,
                amount: invoice.amount,
            };
            Ok((invoice, event))
        })?;

        Ok(invoice)
    }

    /// Change an invoice's status and record `InvoiceUpdated`.
    ///
    /// Returns `None`, and records nothing, when the invoice does not exist.
    pub fn update_status(&self, id: u64, status: &str) -> Result<Option<Invoice>, WriteError> {
        let updated = self.writer.record_with(|tx| {
            let key = id.to_string();
            let mut invoice: Invoice = tx
                .get_as(INVOICES, &key)?
                .ok_or_else(|| WriteError::NotFound(format!("invoice {}", id)))?;
            invoice.status = status.to_string();
            tx.put_as(INVOICES, &key, &invoice)?;

            let event = InvoiceUpdated {
                invoice_id: id,
                status: invoice.status.clone(),
            };
            Ok((invoice, event))
        });

        match updated {
            Ok((invoice, _)) => Ok(Some(invoice)),
            Err(WriteError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn get(&self, id: u64) -> Result<Option<Invoice>, StoreError> {
        let tx = self.database().begin()?;
        let invoice = tx.get_as(INVOICES, &id.to_string());
        tx.rollback();
        invoice
    }
}
