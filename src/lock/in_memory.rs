use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::{Lock, LockError, LockManager};

fn poisoned<T>(err: PoisonError<T>) -> LockError {
    LockError::Poisoned(err.to_string())
}

/// A row lock held by at most one transaction. Waiters park on a condvar.
#[derive(Default)]
pub struct InMemoryLock {
    key: String,
    held: Mutex<bool>,
    released: Condvar,
}

impl InMemoryLock {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held
            .lock()
            .map(|held| *held)
            .unwrap_or_else(|err| *err.into_inner())
    }
}

impl Lock for InMemoryLock {
    fn acquire(&self, timeout: Duration) -> Result<bool, LockError> {
        let held = self.held.lock().map_err(poisoned)?;
        let (mut held, wait) = self
            .released
            .wait_timeout_while(held, timeout, |held| *held)
            .map_err(poisoned)?;
        if wait.timed_out() && *held {
            return Ok(false);
        }
        *held = true;
        Ok(true)
    }

    fn release(&self) -> Result<(), LockError> {
        let mut held = self.held.lock().map_err(poisoned)?;
        if !*held {
            return Err(LockError::NotHeld(self.key.clone()));
        }
        *held = false;
        drop(held);
        self.released.notify_one();
        Ok(())
    }
}

/// Row locks by key. A key's entry lives while some transaction holds or
/// waits on it.
#[derive(Default)]
pub struct InMemoryLockManager {
    rows: Mutex<HashMap<String, Arc<InMemoryLock>>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently tracked.
    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LockManager for InMemoryLockManager {
    type Lock = InMemoryLock;

    fn get_lock(&self, key: &str) -> Result<Arc<InMemoryLock>, LockError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let row = rows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(InMemoryLock::new(key)));
        Ok(Arc::clone(row))
    }

    fn forget(&self, key: &str) -> Result<(), LockError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        // The map's own handle is the last one: no holder and no waiter.
        let unused = rows.get(key).is_some_and(|row| Arc::strong_count(row) == 1);
        if unused {
            rows.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn second_acquire_times_out_while_held() {
        let row = InMemoryLock::new("processed:mailer:1");
        assert!(row.acquire(Duration::ZERO).unwrap());
        assert!(!row.acquire(Duration::from_millis(20)).unwrap());

        row.release().unwrap();
        assert!(!row.is_held());
        assert!(row.acquire(Duration::ZERO).unwrap());
    }

    #[test]
    fn releasing_an_unheld_row_is_an_error() {
        let row = InMemoryLock::new("processed:mailer:1");
        assert_eq!(
            row.release(),
            Err(LockError::NotHeld("processed:mailer:1".into()))
        );
    }

    #[test]
    fn waiter_takes_over_on_release() {
        let row = Arc::new(InMemoryLock::new("k"));
        assert!(row.acquire(Duration::ZERO).unwrap());

        let waiter = {
            let row = Arc::clone(&row);
            thread::spawn(move || row.acquire(Duration::from_secs(5)).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        row.release().unwrap();

        assert!(waiter.join().unwrap());
        assert!(row.is_held());
    }

    #[test]
    fn one_lock_per_key() {
        let rows = InMemoryLockManager::new();
        let first = rows.get_lock("processed:a").unwrap();
        let again = rows.get_lock("processed:a").unwrap();
        let other = rows.get_lock("processed:b").unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(first.key(), "processed:a");
    }

    #[test]
    fn forget_keeps_rows_still_in_use() {
        let rows = InMemoryLockManager::new();
        let held = rows.get_lock("k").unwrap();

        rows.forget("k").unwrap();
        assert_eq!(rows.len(), 1);

        drop(held);
        rows.forget("k").unwrap();
        assert!(rows.is_empty());
    }
}
