//! Relay - drains the outbox to the event bus.
//!
//! ## Loop
//!
//! 1. Claim a batch of rows (`OutboxStore::fetch_batch`). At most one row per
//!    aggregate is claimable at a time, so an aggregate's history is never
//!    published out of order.
//! 2. Publish the batch in parallel, bounded by `max_in_flight`.
//! 3. Per row: success marks it DISPATCHED; a transient error releases it
//!    with exponential backoff until `max_attempts`, then marks it FAILED;
//!    a permanent error marks it FAILED straight away.
//!
//! A crash between publish and `mark_dispatched` leaves the row leased. Once
//! the lease expires another worker republishes it, and the consumers'
//! dedup guard absorbs the duplicate.

mod backoff;
mod dispatcher;
mod thread;

pub use backoff::BackoffPolicy;
pub use dispatcher::{DrainResult, Relay};
pub use thread::{RelayStats, RelayThread};
