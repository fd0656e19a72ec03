//! Storage, mail, client lookup and rendering behind narrow traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::ServiceError;
use crate::contracts::InvoiceCreated;

pub trait ObjectStorage: Send + Sync {
    /// Store `body` under `bucket`/`key`, replacing any existing object.
    /// Returns the object URL.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

pub trait Mailer: Send + Sync {
    /// Hand the message to the mail provider. Returns its message id.
    fn send(&self, email: &OutgoingEmail) -> Result<String, ServiceError>;
}

pub trait ClientDirectory: Send + Sync {
    fn email_for(&self, client_id: u64) -> Result<Option<String>, ServiceError>;
}

pub trait DocumentRenderer: Send + Sync {
    fn render_invoice(&self, invoice: &InvoiceCreated) -> Vec<u8>;
}

/// Plain-text invoice documents.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextRenderer;

impl DocumentRenderer for TextRenderer {
    fn render_invoice(&self, invoice: &InvoiceCreated) -> Vec<u8> {
        format!(
            "Invoice #{}\nClient: {}\nAmount: {}\n",
            invoice.invoice_id, invoice.client_id, invoice.amount
        )
        .into_bytes()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

#[derive(Clone, Default)]
pub struct InMemoryObjectStorage {
    objects: Arc<Mutex<HashMap<(String, String), StoredObject>>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` uploads fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStorage for InMemoryObjectStorage {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<String, ServiceError> {
        if take_failure(&self.failures) {
            return Err(ServiceError::Storage(format!("upload of {} refused", key)));
        }
        self.objects
            .lock()
            .map_err(|_| ServiceError::Storage("storage poisoned".into()))?
            .insert(
                (bucket.to_string(), key.to_string()),
                StoredObject {
                    body,
                    content_type: content_type.to_string(),
                },
            );
        Ok(format!("https://{}.s3.amazonaws.com/{}", bucket, key))
    }
}

/// Records sent mail instead of delivering it.
#[derive(Clone, Default)]
pub struct InMemoryMailer {
    sent: Arc<Mutex<Vec<(String, OutgoingEmail)>>>,
    failures: Arc<AtomicUsize>,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, email)| email.clone())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Mailer for InMemoryMailer {
    fn send(&self, email: &OutgoingEmail) -> Result<String, ServiceError> {
        if take_failure(&self.failures) {
            return Err(ServiceError::Mail(format!("delivery to {} failed", email.to)));
        }
        let mut sent = self
            .sent
            .lock()
            .map_err(|_| ServiceError::Mail("mailer poisoned".into()))?;
        let message_id = format!("mail-{}", sent.len() + 1);
        sent.push((message_id.clone(), email.clone()));
        Ok(message_id)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryClientDirectory {
    emails: Arc<Mutex<HashMap<u64, String>>>,
}

impl InMemoryClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(self, client_id: u64, email: impl Into<String>) -> Self {
        self.emails
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id, email.into());
        self
    }
}

impl ClientDirectory for InMemoryClientDirectory {
    fn email_for(&self, client_id: u64) -> Result<Option<String>, ServiceError> {
        let emails = self
            .emails
            .lock()
            .map_err(|_| ServiceError::Directory("directory poisoned".into()))?;
        Ok(emails.get(&client_id).cloned())
    }
}

fn take_failure(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}
