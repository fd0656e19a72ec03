//! In-memory event bus for tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use uuid::Uuid;

use super::{Ack, BusError, Delivery, PublishError, Publisher, Subscriber};
use crate::event::EventEnvelope;

const DEFAULT_MAX_DELIVERIES: u32 = 5;

/// A message that exhausted its deliveries on one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub subscription: String,
    pub event_id: Uuid,
    pub detail_type: String,
    pub attempts: u32,
    pub reason: String,
}

struct Message {
    delivery_id: u64,
    attempt: u32,
    event_id: Uuid,
    detail_type: String,
    body: Vec<u8>,
}

struct Subscription {
    topic: String,
    filter: Option<HashSet<String>>,
    ready: VecDeque<Message>,
    in_flight: HashMap<u64, Message>,
}

impl Subscription {
    fn accepts(&self, detail_type: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |types| types.contains(detail_type))
    }
}

struct BusState {
    topics: HashMap<String, Vec<EventEnvelope>>,
    subscriptions: HashMap<String, Subscription>,
    dead_letters: Vec<DeadLetter>,
    next_delivery_id: u64,
    next_message_id: u64,
    max_deliveries: u32,
}

struct Inner {
    state: Mutex<BusState>,
    arrived: Condvar,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, BusState>, BusError> {
        self.state.lock().map_err(|_| BusError::Poisoned)
    }

    fn peek(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Topic-based pub/sub with named subscriptions.
///
/// - Publishing to a topic that was never declared is a permanent error.
/// - A subscription only sees messages published after it was created.
/// - Handles sharing a subscription name compete for its messages.
/// - A nacked message is redelivered until it has been delivered
///   `max_deliveries` times, then moved to the dead-letter list.
///
/// ```
/// use std::time::Duration;
/// use outbox_relay::bus::{InMemoryBus, Subscriber};
///
/// let bus = InMemoryBus::new().with_topic("events");
/// let sub = bus.subscribe("events", "mailer").unwrap();
/// assert!(sub.poll(Duration::from_millis(1)).unwrap().is_none());
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BusState {
                    topics: HashMap::new(),
                    subscriptions: HashMap::new(),
                    dead_letters: Vec::new(),
                    next_delivery_id: 0,
                    next_message_id: 0,
                    max_deliveries: DEFAULT_MAX_DELIVERIES,
                }),
                arrived: Condvar::new(),
            }),
        }
    }

    pub fn with_topic(self, topic: &str) -> Self {
        self.declare_topic(topic);
        self
    }

    pub fn with_max_deliveries(self, max_deliveries: u32) -> Self {
        self.inner.peek().max_deliveries = max_deliveries.max(1);
        self
    }

    pub fn declare_topic(&self, topic: &str) {
        self.inner
            .peek()
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    /// Subscribe to every message on `topic`.
    pub fn subscribe(&self, topic: &str, name: &str) -> Result<InMemorySubscription, BusError> {
        self.bind(topic, name, None)
    }

    /// Subscribe to messages on `topic` whose detail type is in `detail_types`.
    pub fn subscribe_filtered(
        &self,
        topic: &str,
        name: &str,
        detail_types: &[&str],
    ) -> Result<InMemorySubscription, BusError> {
        let filter = detail_types.iter().map(|t| t.to_string()).collect();
        self.bind(topic, name, Some(filter))
    }

    fn bind(
        &self,
        topic: &str,
        name: &str,
        filter: Option<HashSet<String>>,
    ) -> Result<InMemorySubscription, BusError> {
        let mut state = self.inner.lock()?;
        if !state.topics.contains_key(topic) {
            return Err(BusError::TopicNotFound(topic.to_string()));
        }

        match state.subscriptions.get(name) {
            Some(existing) if existing.topic != topic => {
                return Err(BusError::SubscriptionConflict {
                    name: name.to_string(),
                    topic: existing.topic.clone(),
                });
            }
            Some(_) => {}
            None => {
                state.subscriptions.insert(
                    name.to_string(),
                    Subscription {
                        topic: topic.to_string(),
                        filter,
                        ready: VecDeque::new(),
                        in_flight: HashMap::new(),
                    },
                );
            }
        }

        Ok(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        })
    }

    /// Every envelope accepted on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<EventEnvelope> {
        self.inner
            .peek()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// How many times `event_id` was accepted on `topic`.
    pub fn publish_count(&self, topic: &str, event_id: Uuid) -> usize {
        self.inner
            .peek()
            .topics
            .get(topic)
            .map_or(0, |log| log.iter().filter(|e| e.event_id == event_id).count())
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.peek().dead_letters.clone()
    }

    /// Messages waiting on or held by subscription `name`.
    pub fn pending(&self, name: &str) -> usize {
        self.inner
            .peek()
            .subscriptions
            .get(name)
            .map_or(0, |sub| sub.ready.len() + sub.in_flight.len())
    }
}

impl Publisher for InMemoryBus {
    /// Accepts immediately; `timeout` never elapses in memory.
    fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        _timeout: Duration,
    ) -> Result<Ack, PublishError> {
        if !envelope.detail.is_object() {
            return Err(PublishError::Permanent(format!(
                "detail of {} must be a JSON object",
                envelope.event_id
            )));
        }
        let body = envelope
            .to_bytes()
            .map_err(|err| PublishError::Permanent(err.to_string()))?;

        let mut state = self
            .inner
            .lock()
            .map_err(|err| PublishError::Transient(err.to_string()))?;

        match state.topics.get_mut(topic) {
            Some(log) => log.push(envelope.clone()),
            None => {
                return Err(PublishError::Permanent(format!(
                    "topic {} does not exist",
                    topic
                )))
            }
        }

        state.next_message_id += 1;
        let message_id = format!("msg-{}", state.next_message_id);

        let mut next_delivery_id = state.next_delivery_id;
        for sub in state.subscriptions.values_mut() {
            if sub.topic != topic || !sub.accepts(&envelope.detail_type) {
                continue;
            }
            next_delivery_id += 1;
            sub.ready.push_back(Message {
                delivery_id: next_delivery_id,
                attempt: 0,
                event_id: envelope.event_id,
                detail_type: envelope.detail_type.clone(),
                body: body.clone(),
            });
        }
        state.next_delivery_id = next_delivery_id;
        drop(state);

        self.inner.arrived.notify_all();
        debug!(topic, event_id = %envelope.event_id, %message_id, "message accepted");
        Ok(Ack { message_id })
    }
}

/// Handle on a named subscription of an [`InMemoryBus`].
#[derive(Clone)]
pub struct InMemorySubscription {
    inner: Arc<Inner>,
    name: String,
}

impl InMemorySubscription {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Subscriber for InMemorySubscription {
    fn poll(&self, timeout: Duration) -> Result<Option<Delivery>, BusError> {
        // Too far out to represent means wait until something arrives.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.lock()?;

        loop {
            let sub = state
                .subscriptions
                .get_mut(&self.name)
                .ok_or_else(|| BusError::UnknownSubscription(self.name.clone()))?;

            if let Some(mut message) = sub.ready.pop_front() {
                message.attempt += 1;
                let delivery = Delivery {
                    delivery_id: message.delivery_id,
                    attempt: message.attempt,
                    body: message.body.clone(),
                };
                sub.in_flight.insert(message.delivery_id, message);
                return Ok(Some(delivery));
            }

            state = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    self.inner
                        .arrived
                        .wait_timeout(state, remaining)
                        .map_err(|_| BusError::Poisoned)?
                        .0
                }
                None => self
                    .inner
                    .arrived
                    .wait(state)
                    .map_err(|_| BusError::Poisoned)?,
            };
        }
    }

    fn ack(&self, delivery_id: u64) -> Result<(), BusError> {
        let mut state = self.inner.lock()?;
        let sub = state
            .subscriptions
            .get_mut(&self.name)
            .ok_or_else(|| BusError::UnknownSubscription(self.name.clone()))?;
        sub.in_flight
            .remove(&delivery_id)
            .map(|_| ())
            .ok_or(BusError::UnknownDelivery(delivery_id))
    }

    fn nack(&self, delivery_id: u64, reason: &str) -> Result<(), BusError> {
        let mut state = self.inner.lock()?;
        let max_deliveries = state.max_deliveries;
        let sub = state
            .subscriptions
            .get_mut(&self.name)
            .ok_or_else(|| BusError::UnknownSubscription(self.name.clone()))?;
        let message = sub
            .in_flight
            .remove(&delivery_id)
            .ok_or(BusError::UnknownDelivery(delivery_id))?;

        if message.attempt < max_deliveries {
            sub.ready.push_back(message);
            drop(state);
            self.inner.arrived.notify_all();
            return Ok(());
        }

        warn!(
            subscription = %self.name,
            event_id = %message.event_id,
            attempts = message.attempt,
            reason,
            "message dead-lettered"
        );
        state.dead_letters.push(DeadLetter {
            subscription: self.name.clone(),
            event_id: message.event_id,
            detail_type: message.detail_type,
            attempts: message.attempt,
            reason: reason.to_string(),
        });
        Ok(())
    }
}
