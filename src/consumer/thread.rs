//! Background consumer worker.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use super::{Consumer, ConsumerError, Outcome};
use crate::bus::{Delivery, Subscriber};
use crate::config::ConsumerConfig;
use crate::store::Database;

/// Statistics from a consumer thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsumerStats {
    pub polls: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub ignored: usize,
    /// Deliveries nacked because handling failed.
    pub failed: usize,
    pub bus_errors: usize,
}

/// Feeds deliveries from a [`Subscriber`] to a [`Consumer`].
///
/// Successful outcomes (including duplicates and ignored types) are acked;
/// errors are nacked so the bus redelivers.
pub struct ConsumerThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<ConsumerStats>>,
}

impl ConsumerThread {
    pub fn spawn<D, S>(consumer: Consumer<D>, subscriber: S, config: ConsumerConfig) -> Self
    where
        D: Database + 'static,
        S: Subscriber + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = ConsumerStats::default();
            info!(consumer = %consumer.name(), "consumer started");

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                stats.polls += 1;

                match subscriber.poll(config.poll_timeout()) {
                    Ok(Some(delivery)) => process(&consumer, &subscriber, delivery, &mut stats),
                    Ok(None) => {}
                    Err(err) => {
                        stats.bus_errors += 1;
                        warn!(consumer = %consumer.name(), error = %err, "poll failed");
                        match stop_rx.recv_timeout(config.idle_backoff()) {
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                            Err(RecvTimeoutError::Timeout) => {}
                        }
                    }
                }
            }

            info!(
                consumer = %consumer.name(),
                applied = stats.applied,
                duplicates = stats.duplicates,
                "consumer stopped"
            );
            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(mut self) -> ConsumerStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => ConsumerStats::default(),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for ConsumerThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

fn process<D, S>(consumer: &Consumer<D>, subscriber: &S, delivery: Delivery, stats: &mut ConsumerStats)
where
    D: Database,
    S: Subscriber,
{
    let outcome = delivery
        .envelope()
        .map_err(ConsumerError::from)
        .and_then(|envelope| consumer.handle(&envelope));

    let settled = match outcome {
        Ok(outcome) => {
            match outcome {
                Outcome::Applied => stats.applied += 1,
                Outcome::Duplicate => stats.duplicates += 1,
                Outcome::Ignored => stats.ignored += 1,
            }
            subscriber.ack(delivery.delivery_id)
        }
        Err(err) => {
            stats.failed += 1;
            subscriber.nack(delivery.delivery_id, &err.to_string())
        }
    };

    if let Err(err) = settled {
        stats.bus_errors += 1;
        warn!(
            consumer = %consumer.name(),
            delivery_id = delivery.delivery_id,
            error = %err,
            "could not settle delivery"
        );
    }
}
