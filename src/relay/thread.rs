//! Background relay worker.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use super::{DrainResult, Relay};
use crate::bus::Publisher;
use crate::store::OutboxStore;

/// Statistics from a relay thread.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelayStats {
    pub polls: usize,
    pub claimed: usize,
    pub dispatched: usize,
    pub retried: usize,
    pub failed: usize,
    pub lease_conflicts: usize,
    /// Failed claims plus failed per-row bookkeeping updates.
    pub store_errors: usize,
}

impl RelayStats {
    fn record(&mut self, cycle: &DrainResult) {
        self.claimed += cycle.claimed;
        self.dispatched += cycle.dispatched;
        self.retried += cycle.retried;
        self.failed += cycle.failed;
        self.lease_conflicts += cycle.lease_conflicts;
        self.store_errors += cycle.store_errors;
    }
}

/// Runs a [`Relay`] poll loop on its own thread.
///
/// Shutdown is cooperative: the stop signal is checked between cycles, so
/// an in-flight batch finishes (or its publishes time out) first.
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use outbox_relay::bus::InMemoryBus;
/// use outbox_relay::{InMemoryDatabase, Relay, RelayConfig, RelayThread};
///
/// let db = InMemoryDatabase::new();
/// let bus = InMemoryBus::new().with_topic("events");
/// let config = RelayConfig::new("relay-1")
///     .with_topic("events")
///     .with_poll_interval(Duration::from_millis(10));
///
/// let worker = RelayThread::spawn(Relay::new(db.clone(), bus, config));
/// // ... write domain events through a DomainWriter on `db` ...
/// let stats = worker.stop();
/// assert!(stats.polls >= 1);
/// ```
pub struct RelayThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<RelayStats>>,
}

impl RelayThread {
    pub fn spawn<S, P>(relay: Relay<S, P>) -> Self
    where
        S: OutboxStore + 'static,
        P: Publisher + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = RelayStats::default();
            let config = relay.config().clone();
            info!(worker_id = %config.worker_id, topic = %config.topic, "relay started");

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                stats.polls += 1;

                // Contention or a full batch means there is more to do right now.
                let pause = match relay.poll_once() {
                    Ok(cycle) => {
                        stats.record(&cycle);
                        if cycle.lease_conflicts > 0 || cycle.claimed >= config.batch_size {
                            Duration::ZERO
                        } else {
                            config.poll_interval()
                        }
                    }
                    Err(err) if err.is_contention() => Duration::ZERO,
                    Err(err) => {
                        stats.store_errors += 1;
                        error!(worker_id = %config.worker_id, error = %err, "outbox claim failed");
                        config.poll_interval()
                    }
                };

                if pause.is_zero() {
                    continue;
                }
                match stop_rx.recv_timeout(pause) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }

            info!(
                worker_id = %config.worker_id,
                dispatched = stats.dispatched,
                failed = stats.failed,
                "relay stopped"
            );
            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(mut self) -> RelayStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => RelayStats::default(),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for RelayThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
