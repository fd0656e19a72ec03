mod support;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use outbox_relay::bus::{InMemoryBus, Subscriber};
use outbox_relay::contracts::{InvoiceCreated, PdfGenerated};
use outbox_relay::services::{
    notification_consumer, InMemoryClientDirectory, InMemoryMailer, InvoiceService, NewInvoice,
    NotificationSettings, NOTIFICATION_CONSUMER,
};
use outbox_relay::{
    BackoffPolicy, Consumer, DomainWriter, EventStatus, InMemoryDatabase, ManualClock,
    OutboxStore, Outcome, ProcessedLedger, Relay, RelayConfig, StaticSource, Transaction,
    WriteError,
};
use rust_decimal_macros::dec;
use serde_json::json;
use support::{init_tracing, CrashAfterPublish, FlakyPublisher, RejectingPublisher};

const TOPIC: &str = "InvoiceManagementEventBus";

fn relay_config(worker_id: &str) -> RelayConfig {
    RelayConfig::new(worker_id)
        .with_topic(TOPIC)
        .with_lease(Duration::from_secs(30))
        .with_max_attempts(3)
        .with_backoff(BackoffPolicy::new(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(30),
        ))
}

fn new_invoice(client_id: u64) -> NewInvoice {
    NewInvoice {
        client_id,
        amount: dec!(250.00),
        due_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
    }
}

#[test]
fn successful_write_leaves_exactly_one_pending_row() {
    init_tracing();
    let db = InMemoryDatabase::new();
    let writer = DomainWriter::new(db.clone(), "com.invoicemanagement.invoice");

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

    let pending = db.events_by_status(EventStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, row.id);
    assert!(pending[0].dispatched_at.is_none());
    assert_eq!(pending[0].attempts, 0);
}

#[test]
fn failed_write_leaves_no_row() {
    init_tracing();
    let db = InMemoryDatabase::new();
    let writer = DomainWriter::new(db.clone(), "com.invoicemanagement.invoice");

    let result = writer.record_change(
        |tx| {
            tx.put("invoices", "1", json!({"clientId": 7}))?;
            Err(WriteError::Invalid("client 7 is suspended".into()))
        },
        InvoiceCreated {
            invoice_id: 1,
            client_id: 7,
            amount: dec!(250.00),
        },
    );

    assert!(result.is_err());
    assert!(db.outbox_events().unwrap().is_empty());
    assert!(db.record("invoices", "1").unwrap().is_none());
}

#[test]
fn invoice_is_dispatched_and_applied_once() {
    init_tracing();
    let invoice_db = InMemoryDatabase::new();
    let invoices = InvoiceService::new(invoice_db.clone());
    let bus = InMemoryBus::new().with_topic(TOPIC);
    let subscription = bus.subscribe(TOPIC, NOTIFICATION_CONSUMER).unwrap();

    let invoice = invoices.create_invoice(new_invoice(7)).unwrap();

    let pending = invoice_db.events_by_status(EventStatus::Pending).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_type, "InvoiceCreated");
    assert_eq!(
        pending[0].payload,
        json!({"invoiceId": invoice.id, "clientId": 7, "amount": 250.0})
    );
    let event_id = pending[0].id;

    let relay = Relay::new(invoice_db.clone(), bus.clone(), relay_config("relay-1"));
    assert_eq!(relay.drain().unwrap().dispatched, 1);
    let dispatched = invoice_db.get_event(event_id).unwrap().unwrap();
    assert_eq!(dispatched.status, EventStatus::Dispatched);
    assert!(dispatched.dispatched_at.is_some());

    let consumer_db = InMemoryDatabase::new();
    let consumer = Consumer::new(
        NOTIFICATION_CONSUMER,
        consumer_db.clone(),
        "com.invoicemanagement.notification",
    )
    .on_payload(|ctx, created: InvoiceCreated| {
        ctx.tx().put(
            "notices",
            &created.invoice_id.to_string(),
            json!({"clientId": created.client_id}),
        )?;
        Ok(())
    });

    let delivery = subscription.poll(Duration::from_millis(50)).unwrap().unwrap();
    let envelope = delivery.envelope().unwrap();
    assert_eq!(envelope.event_id, event_id);
    assert_eq!(envelope.source, "com.invoicemanagement.invoice");
    assert_eq!(envelope.detail["schemaVersion"], json!(1));

    assert_eq!(consumer.handle(&envelope).unwrap(), Outcome::Applied);
    assert_eq!(consumer.handle(&envelope).unwrap(), Outcome::Duplicate);
    assert_eq!(consumer.handle(&envelope).unwrap(), Outcome::Duplicate);
    subscription.ack(delivery.delivery_id).unwrap();

    let records = consumer_db.processed_by(NOTIFICATION_CONSUMER).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].event_id, event_id);
    assert_eq!(consumer_db.record_count("notices").unwrap(), 1);
}

#[test]
fn crash_after_publish_redelivers_without_a_second_email() {
    init_tracing();
    let clock = ManualClock::default();
    let pdf_db = InMemoryDatabase::with_clock(Arc::new(clock.clone()));
    let bus = InMemoryBus::new().with_topic(TOPIC);
    let subscription = bus.subscribe(TOPIC, NOTIFICATION_CONSUMER).unwrap();

    let writer = DomainWriter::new(pdf_db.clone(), "com.invoicemanagement.pdf")
        .with_clock(Arc::new(clock.clone()));
    let row = writer
        .record_change(
            |_| Ok(()),
            PdfGenerated {
                invoice_id: 1,
                client_id: 7,
                pdf_url: "https://invoice-pdfs.s3.amazonaws.com/invoice_1.pdf".into(),
            },
        )
        .unwrap();

    // First worker publishes, then dies before recording the dispatch.
    let crashing = Relay::new(
        CrashAfterPublish::new(pdf_db.clone(), 1),
        bus.clone(),
        relay_config("relay-crashing"),
    )
    .with_clock(Arc::new(clock.clone()));
    let first = crashing.poll_once().unwrap();
    assert_eq!(first.store_errors, 1);
    assert_eq!(bus.publish_count(TOPIC, row.id), 1);

    // A replacement worker cannot take the row while the lease is live.
    let replacement = Relay::new(pdf_db.clone(), bus.clone(), relay_config("relay-replacement"))
        .with_clock(Arc::new(clock.clone()));
    assert_eq!(replacement.poll_once().unwrap().claimed, 0);

    clock.advance(Duration::from_secs(31));
    assert_eq!(replacement.poll_once().unwrap().dispatched, 1);
    assert_eq!(bus.publish_count(TOPIC, row.id), 2);

    let stored = pdf_db.get_event(row.id).unwrap().unwrap();
    assert!(stored.is_dispatched());
    assert_eq!(stored.attempts, 2);

    let notification_db = InMemoryDatabase::new();
    let mailer = InMemoryMailer::new();
    let consumer = notification_consumer(
        notification_db.clone(),
        Arc::new(InMemoryClientDirectory::new().with_client(7, "client7@example.com")),
        Arc::new(mailer.clone()),
        NotificationSettings::from_source(
            &StaticSource::new().with("sender_email", "billing@example.com"),
        )
        .unwrap(),
    );

    let mut outcomes = Vec::new();
    while let Some(delivery) = subscription.poll(Duration::from_millis(20)).unwrap() {
        outcomes.push(consumer.handle(&delivery.envelope().unwrap()).unwrap());
        subscription.ack(delivery.delivery_id).unwrap();
    }

    assert_eq!(outcomes, vec![Outcome::Applied, Outcome::Duplicate]);
    assert_eq!(mailer.sent_count(), 1);
    assert_eq!(
        notification_db.processed_by(NOTIFICATION_CONSUMER).unwrap().len(),
        1
    );
}

#[test]
fn permanent_rejection_marks_failed_and_stops_retrying() {
    init_tracing();
    let clock = ManualClock::default();
    let db = InMemoryDatabase::with_clock(Arc::new(clock.clone()));
    let invoices = InvoiceService::new(db.clone()).with_clock(Arc::new(clock.clone()));
    let invoice = invoices.create_invoice(new_invoice(7)).unwrap();
    invoices.update_status(invoice.id, "paid").unwrap();

    let rejecting = Arc::new(RejectingPublisher::default());
    let relay = Relay::new(db.clone(), Arc::clone(&rejecting), relay_config("relay-1"))
        .with_clock(Arc::new(clock.clone()));

    let result = relay.drain().unwrap();
    assert_eq!(result.failed, 1);

    clock.advance(Duration::from_secs(3600));
    assert_eq!(relay.drain().unwrap().claimed, 0);
    assert_eq!(rejecting.calls(), 1);
    // InvoiceUpdated waits behind the FAILED InvoiceCreated.
    let counts = db.status_counts().unwrap();
    assert_eq!((counts.pending, counts.failed, counts.blocked), (1, 1, 1));

    let failed = db.events_by_status(EventStatus::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].failed_at.is_some());
    assert!(failed[0].dispatched_at.is_none());
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("schema rejected"));

    // Operator recovery after the bus-side fix.
    db.requeue_failed(failed[0].id).unwrap();
    let bus = InMemoryBus::new().with_topic(TOPIC);
    let fixed = Relay::new(db.clone(), bus.clone(), relay_config("relay-2"))
        .with_clock(Arc::new(clock.clone()));
    assert_eq!(fixed.drain().unwrap().dispatched, 2);
    let published: Vec<String> = bus
        .published(TOPIC)
        .into_iter()
        .map(|envelope| envelope.detail_type)
        .collect();
    assert_eq!(published, vec!["InvoiceCreated", "InvoiceUpdated"]);

    let recovered = db.get_event(failed[0].id).unwrap().unwrap();
    assert_eq!(recovered.attempts, 2);
}

#[test]
fn transient_failures_back_off_then_escalate() {
    init_tracing();
    let clock = ManualClock::default();
    let db = InMemoryDatabase::with_clock(Arc::new(clock.clone()));
    let invoices = InvoiceService::new(db.clone()).with_clock(Arc::new(clock.clone()));
    invoices.create_invoice(new_invoice(7)).unwrap();

    let bus = InMemoryBus::new().with_topic(TOPIC);
    let flaky = Arc::new(FlakyPublisher::new(bus.clone(), 10));
    let relay = Relay::new(db.clone(), Arc::clone(&flaky), relay_config("relay-1"))
        .with_clock(Arc::new(clock.clone()));

    assert_eq!(relay.poll_once().unwrap().retried, 1);
    assert_eq!(relay.poll_once().unwrap().claimed, 0);

    let row = &db.outbox_events().unwrap()[0];
    assert_eq!(row.attempts, 1);
    assert!(row.next_attempt_at.is_some());

    clock.advance(Duration::from_secs(1));
    assert_eq!(relay.poll_once().unwrap().retried, 1);
    clock.advance(Duration::from_secs(2));
    assert_eq!(relay.poll_once().unwrap().failed, 1);

    assert_eq!(flaky.calls(), 3);
    assert!(bus.published(TOPIC).is_empty());
    assert_eq!(db.status_counts().unwrap().failed, 1);
}

#[test]
fn concurrent_relays_preserve_per_aggregate_order() {
    init_tracing();
    let db = InMemoryDatabase::new();
    let invoices = InvoiceService::new(db.clone());
    let bus = InMemoryBus::new().with_topic(TOPIC);

    let mut ids = Vec::new();
    for client_id in 1..=4 {
        ids.push(invoices.create_invoice(new_invoice(client_id)).unwrap().id);
    }
    for status in ["sent", "viewed", "paid"] {
        for id in &ids {
            invoices.update_status(*id, status).unwrap();
        }
    }

    let workers: Vec<_> = (0..3)
        .map(|n| {
            let relay = Relay::new(
                db.clone(),
                bus.clone(),
                relay_config(&format!("relay-{}", n)).with_batch_size(2),
            );
            thread::spawn(move || relay.drain().unwrap())
        })
        .collect();
    let dispatched: usize = workers
        .into_iter()
        .map(|worker| worker.join().unwrap().dispatched)
        .sum();

    // A worker may stop early while another holds the last heads; finish up.
    let tail = Relay::new(db.clone(), bus.clone(), relay_config("relay-tail"))
        .drain()
        .unwrap()
        .dispatched;
    assert_eq!(dispatched + tail, 16);

    let published = bus.published(TOPIC);
    for id in &ids {
        let history: Vec<String> = published
            .iter()
            .filter(|envelope| envelope.detail["invoiceId"] == json!(id))
            .map(|envelope| match envelope.detail.get("status") {
                Some(status) => status.as_str().unwrap_or_default().to_string(),
                None => envelope.detail_type.clone(),
            })
            .collect();
        assert_eq!(history, vec!["InvoiceCreated", "sent", "viewed", "paid"]);
    }

    let created_order: Vec<u64> = db
        .outbox_events()
        .unwrap()
        .iter()
        .map(|row| row.sequence)
        .collect();
    assert!(created_order.windows(2).all(|pair| pair[0] < pair[1]));
}
