//! Idempotent consumption.
//!
//! The bus delivers at least once. A consumer turns that into "applied
//! once" by inserting a `(consumer, event_id)` marker in the same
//! transaction as the side effect:
//!
//! - marker already present: the event is a duplicate, nothing runs;
//! - marker inserted, effect succeeds: both commit;
//! - marker inserted, effect fails: both roll back and the redelivery
//!   gets a clean retry.

mod error;
mod guard;
mod handler;
mod thread;

pub use error::ConsumerError;
pub use guard::{Admission, DedupGuard};
pub use handler::{Consumer, HandlerContext, Outcome};
pub use thread::{ConsumerStats, ConsumerThread};
