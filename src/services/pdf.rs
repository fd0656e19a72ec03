use std::sync::Arc;

use serde_json::json;

use super::{DocumentRenderer, ObjectStorage, ServiceError, PDF_SOURCE};
use crate::config::ConfigSource;
use crate::consumer::Consumer;
use crate::contracts::{InvoiceCreated, PdfGenerated};
use crate::store::{Database, Transaction};

pub const PDF_CONSUMER: &str = "pdf-consumer";

const DOCUMENTS: &str = "documents";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PdfSettings {
    pub bucket: String,
}

impl PdfSettings {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ServiceError> {
        Ok(Self {
            bucket: source.require("pdf_bucket_name")?,
        })
    }
}

/// Renders and uploads a document for every new invoice, then announces it
/// with `PDFGenerated`.
///
/// Uploads are keyed by invoice id, so a retried delivery overwrites the
/// same object.
pub fn pdf_consumer<D: Database>(
    db: D,
    storage: Arc<dyn ObjectStorage>,
    renderer: Arc<dyn DocumentRenderer>,
    settings: PdfSettings,
) -> Consumer<D> {
    Consumer::new(PDF_CONSUMER, db, PDF_SOURCE).on_payload(move |ctx, invoice: InvoiceCreated| {
        let key = format!("invoice_{}.pdf", invoice.invoice_id);
        let body = renderer.render_invoice(&invoice);
        let pdf_url = storage.put_object(&settings.bucket, &key, body, "application/pdf")?;

        ctx.tx().put(
            DOCUMENTS,
            &key,
            json!({"invoiceId": invoice.invoice_id, "pdfUrl": pdf_url}),
        )?;
        ctx.record_event(&PdfGenerated {
            invoice_id: invoice.invoice_id,
            client_id: invoice.client_id,
            pdf_url,
        })?;
        Ok(())
    })
}
