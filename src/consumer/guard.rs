use uuid::Uuid;

use super::ConsumerError;
use crate::store::{Database, InsertOutcome, Transaction};

/// Whether the guarded effect ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Applied,
    Duplicate,
}

/// Runs an effect at most once per `(consumer, event_id)`.
pub struct DedupGuard<D> {
    db: D,
}

impl<D: Database> DedupGuard<D> {
    pub fn new(db: D) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    /// Insert the processed marker and run `effect` in one transaction.
    ///
    /// If the marker exists, `effect` is skipped and the call succeeds. If
    /// `effect` fails, the marker is rolled back with it.
    pub fn admit<F>(
        &self,
        consumer: &str,
        event_id: Uuid,
        effect: F,
    ) -> Result<Admission, ConsumerError>
    where
        F: FnOnce(&mut D::Tx) -> Result<(), ConsumerError>,
    {
        self.db
            .transaction(|tx| match tx.insert_processed(consumer, event_id)? {
                InsertOutcome::AlreadyProcessed => Ok(Admission::Duplicate),
                InsertOutcome::Inserted => {
                    effect(tx)?;
                    Ok(Admission::Applied)
                }
            })
    }
}
