use std::sync::Arc;

use serde_json::json;

use super::{ClientDirectory, Mailer, OutgoingEmail, ServiceError, NOTIFICATION_SOURCE};
use crate::config::ConfigSource;
use crate::consumer::{Consumer, ConsumerError};
use crate::contracts::{EmailSent, PdfGenerated};
use crate::store::{Database, Transaction};

pub const NOTIFICATION_CONSUMER: &str = "notification-consumer";

const NOTIFICATIONS: &str = "notifications";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotificationSettings {
    pub sender_email: String,
}

impl NotificationSettings {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ServiceError> {
        Ok(Self {
            sender_email: source.require("sender_email")?,
        })
    }
}

/// Emails the client a link to each generated invoice document, then
/// records `EmailSent`.
pub fn notification_consumer<D: Database>(
    db: D,
    directory: Arc<dyn ClientDirectory>,
    mailer: Arc<dyn Mailer>,
    settings: NotificationSettings,
) -> Consumer<D> {
    Consumer::new(NOTIFICATION_CONSUMER, db, NOTIFICATION_SOURCE).on_payload(
        move |ctx, pdf: PdfGenerated| {
            let recipient = directory.email_for(pdf.client_id)?.ok_or_else(|| {
                ConsumerError::Rejected(format!("client {} has no email address", pdf.client_id))
            })?;

            let email = OutgoingEmail {
                from: settings.sender_email.clone(),
                to: recipient.clone(),
                subject: format!("Invoice #{}", pdf.invoice_id),
                html_body: format!(
                    "Your invoice #{} is ready. You can download it here: {}",
                    pdf.invoice_id, pdf.pdf_url
                ),
            };
            let message_id = mailer.send(&email)?;

            ctx.tx().put(
                NOTIFICATIONS,
                &message_id,
                json!({"invoiceId": pdf.invoice_id, "recipientEmail": recipient}),
            )?;
            ctx.record_event(&EmailSent {
                invoice_id: pdf.invoice_id,
                recipient_email: recipient,
                message_id,
            })?;
            Ok(())
        },
    )
}
