use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("row lock poisoned: {0}")]
    Poisoned(String),
    #[error("row lock {0} released by a transaction that does not hold it")]
    NotHeld(String),
}
