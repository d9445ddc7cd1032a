//! Transaction manager
//!
//! `with_transaction` runs a closure between begin and commit. If the closure
//! fails, panics, or the commit fails, the transaction is cancelled and the
//! store is left exactly as it was before the call.

use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::store::{PutMode, RecordIter, RecordStore};

/// Mutation handle passed to the body of [`with_transaction`].
pub struct Transaction<'a> {
    store: &'a RecordStore,
}

impl<'a> Transaction<'a> {
    /// Reads see this transaction's staged writes.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.store.get(key)
    }

    pub fn put(&self, key: &[u8], value: &[u8], mode: PutMode) -> StoreResult<()> {
        self.store.put(key, value, mode)
    }

    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.store.delete(key)
    }

    pub fn iterate(&self) -> RecordIter<'a> {
        self.store.iterate()
    }
}

/// Cancels the transaction unless disarmed by a successful commit.
struct CancelOnDrop<'a> {
    store: &'a RecordStore,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.store.transaction_cancel() {
                warn!(error = %e, "failed to cancel transaction");
            }
        }
    }
}

/// Run `body` inside a single transaction on `store`.
///
/// - body Ok, commit Ok: every mutation is durably visible.
/// - body Err: cancelled, the body's error is returned.
/// - commit Err: nothing applied, `StoreError::CommitFailed` is returned.
///
/// Fails with `InvalidState` if `store` already has a transaction open.
pub fn with_transaction<T, E, F>(store: &RecordStore, body: F) -> Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce(&Transaction<'_>) -> Result<T, E>,
{
    store.transaction_begin()?;
    let mut guard = CancelOnDrop { store, armed: true };

    let value = body(&Transaction { store })?;

    // The commit consumes the transaction even when it fails.
    guard.armed = false;
    store.transaction_commit().map_err(|e| match e {
        e @ StoreError::CommitFailed { .. } => e,
        other => StoreError::CommitFailed { reason: other.to_string() },
    })?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn test_store() -> (RecordStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path().join("txn.tdb"), Config::ephemeral()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_body_success_commits() {
        let (store, _dir) = test_store();
        let n = with_transaction(&store, |tx| -> StoreResult<usize> {
            tx.put(b"k1", b"A", PutMode::Insert)?;
            tx.put(b"k2", b"B", PutMode::Insert)?;
            Ok(tx.iterate().count())
        })
        .unwrap();

        assert_eq!(n, 2);
        assert_eq!(store.get(b"k1").unwrap(), Some(b"A".to_vec()));
        assert!(!store.in_transaction());
        assert_eq!(store.current_sequence(), 2);
    }

    #[test]
    fn test_body_error_cancels() {
        let (store, _dir) = test_store();
        let result = with_transaction(&store, |tx| {
            tx.put(b"k1", b"A", PutMode::Insert)?;
            tx.put(b"k2", b"B", PutMode::Insert)?;
            tx.delete(b"missing")
        });

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(store.get(b"k1").unwrap(), None);
        assert_eq!(store.get(b"k2").unwrap(), None);
        assert!(!store.in_transaction());
        assert_eq!(store.current_sequence(), 0);
    }

    #[derive(Debug)]
    enum AppError {
        Store(StoreError),
        Rejected,
    }

    impl From<StoreError> for AppError {
        fn from(e: StoreError) -> Self {
            AppError::Store(e)
        }
    }

    #[test]
    fn test_caller_error_type_propagates() {
        let (store, _dir) = test_store();
        store.put(b"k1", b"before", PutMode::Replace).unwrap();

        let result: Result<(), AppError> = with_transaction(&store, |tx| {
            tx.put(b"k1", b"during", PutMode::Modify)?;
            Err(AppError::Rejected)
        });

        assert!(matches!(result, Err(AppError::Rejected)));
        assert_eq!(store.get(b"k1").unwrap(), Some(b"before".to_vec()));

        let nested: Result<(), AppError> = with_transaction(&store, |_| {
            with_transaction(&store, |_| Ok::<(), AppError>(()))
        });
        assert!(matches!(nested, Err(AppError::Store(StoreError::InvalidState(_)))));
        assert!(!store.in_transaction());
    }

    #[test]
    fn test_panic_in_body_cancels() {
        let (store, _dir) = test_store();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = with_transaction(&store, |tx| -> StoreResult<()> {
                tx.put(b"k", b"v", PutMode::Replace)?;
                panic!("body panicked");
            });
        }));

        assert!(result.is_err());
        assert!(!store.in_transaction());
        assert_eq!(store.get(b"k").unwrap(), None);
        store.transaction_begin().unwrap();
        store.transaction_cancel().unwrap();
    }
}
