//! Per-record advisory locking with a transaction journal.
//!
//! ```text
//! UNLOCKED --run_exclusive--> LOCKED(pending) --ok--> COMMITTED   --> UNLOCKED
//!                                             \-err-> ROLLED_BACK --> UNLOCKED
//! ```
//!
//! The lock is a set of record ids held in process memory.  It does not
//! coordinate between processes or replicas, and callers that touch shared
//! state without going through [`AtomicUpdateCoordinator::run_exclusive`] are
//! not stopped.  A second caller for a locked id fails immediately with
//! [`LedgerError::LockHeld`]; there is no queue.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Journal entries kept before the oldest are dropped.
pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// Lifecycle of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// The operation is running.
    Pending,
    /// The operation returned `Ok`.
    Committed,
    /// The operation failed, panicked or was dropped.
    RolledBack,
}

/// Observability record for one exclusive run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction id.
    pub transaction_id: Uuid,
    /// Record the lock was held for.
    pub record_id: String,
    /// Current status.
    pub status: TransactionStatus,
    /// Lock acquisition time, Unix milliseconds.
    pub start_time_ms: u64,
    /// Release time, Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time_ms: Option<u64>,
    /// Failure description for rolled back transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Grants at most one in-flight operation per record id.
#[derive(Debug)]
pub struct AtomicUpdateCoordinator {
    locked: Mutex<HashSet<String>>,
    journal: Mutex<VecDeque<TransactionRecord>>,
    journal_capacity: usize,
}

impl Default for AtomicUpdateCoordinator {
    fn default() -> Self {
        Self::with_journal_capacity(DEFAULT_JOURNAL_CAPACITY)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Guarded collections are updated in single statements, so a poisoned
    // mutex still holds consistent data.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AtomicUpdateCoordinator {
    /// Creates a coordinator with the default journal capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a coordinator that keeps at most `capacity` journal entries.
    pub fn with_journal_capacity(capacity: usize) -> Self {
        Self {
            locked: Mutex::new(HashSet::new()),
            journal: Mutex::new(VecDeque::new()),
            journal_capacity: capacity.max(1),
        }
    }

    /// Runs `op` while holding the lock for `record_id`.
    ///
    /// The lock is released on every exit path: success, error, panic, or
    /// the returned future being dropped.  Errors from `op` are returned
    /// unchanged after the transaction is marked rolled back.
    pub async fn run_exclusive<F, Fut, T>(&self, record_id: &str, op: F) -> Result<T>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(record_id)?;
        let outcome = op(guard.transaction_id).await;
        match &outcome {
            Ok(_) => guard.settle(TransactionStatus::Committed, None),
            Err(err) => guard.settle(TransactionStatus::RolledBack, Some(err.to_string())),
        }
        outcome
    }

    fn acquire(&self, record_id: &str) -> Result<LockGuard<'_>> {
        if !lock(&self.locked).insert(record_id.to_string()) {
            tracing::warn!(record_id, "lock contention");
            return Err(LedgerError::LockHeld {
                record_id: record_id.to_string(),
            });
        }
        let transaction_id = Uuid::new_v4();
        self.append(TransactionRecord {
            transaction_id,
            record_id: record_id.to_string(),
            status: TransactionStatus::Pending,
            start_time_ms: crate::unix_millis(),
            end_time_ms: None,
            error: None,
        });
        tracing::debug!(record_id, %transaction_id, "lock acquired");
        Ok(LockGuard {
            coordinator: self,
            record_id: record_id.to_string(),
            transaction_id,
            settled: false,
        })
    }

    fn append(&self, record: TransactionRecord) {
        let mut journal = lock(&self.journal);
        journal.push_back(record);
        while journal.len() > self.journal_capacity {
            journal.pop_front();
        }
    }

    fn close(&self, transaction_id: Uuid, status: TransactionStatus, error: Option<String>) {
        let mut journal = lock(&self.journal);
        if let Some(entry) = journal
            .iter_mut()
            .rev()
            .find(|entry| entry.transaction_id == transaction_id)
        {
            entry.status = status;
            entry.end_time_ms = Some(crate::unix_millis());
            entry.error = error;
        }
    }

    /// Returns true while an operation holds the lock for `record_id`.
    pub fn is_locked(&self, record_id: &str) -> bool {
        lock(&self.locked).contains(record_id)
    }

    /// Snapshot of the journal, oldest first.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        lock(&self.journal).iter().cloned().collect()
    }

    /// Looks up one transaction.
    pub fn transaction(&self, transaction_id: Uuid) -> Option<TransactionRecord> {
        lock(&self.journal)
            .iter()
            .rev()
            .find(|entry| entry.transaction_id == transaction_id)
            .cloned()
    }
}

struct LockGuard<'a> {
    coordinator: &'a AtomicUpdateCoordinator,
    record_id: String,
    transaction_id: Uuid,
    settled: bool,
}

impl LockGuard<'_> {
    fn settle(mut self, status: TransactionStatus, error: Option<String>) {
        match status {
            TransactionStatus::RolledBack => {
                tracing::warn!(record_id = %self.record_id, transaction_id = %self.transaction_id, error = error.as_deref().unwrap_or(""), "transaction rolled back");
            }
            _ => {
                tracing::debug!(record_id = %self.record_id, transaction_id = %self.transaction_id, "transaction committed");
            }
        }
        self.coordinator.close(self.transaction_id, status, error);
        self.settled = true;
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(record_id = %self.record_id, transaction_id = %self.transaction_id, "transaction aborted before completion");
            self.coordinator.close(
                self.transaction_id,
                TransactionStatus::RolledBack,
                Some("aborted before completion".into()),
            );
        }
        lock(&self.coordinator.locked).remove(&self.record_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn commit_is_journaled() {
        let coord = AtomicUpdateCoordinator::new();
        let value = coord.run_exclusive("r1", |_| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!coord.is_locked("r1"));
        let journal = coord.transactions();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal[0].status, TransactionStatus::Committed);
        assert!(journal[0].end_time_ms.is_some());
    }

    #[tokio::test]
    async fn concurrent_same_record_is_rejected() {
        let coord = Arc::new(AtomicUpdateCoordinator::new());
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord
                    .run_exclusive("r1", |_| async move {
                        let _ = entered_tx.send(());
                        let _ = release_rx.await;
                        Ok(1)
                    })
                    .await
            })
        };
        entered_rx.await.unwrap();
        assert!(coord.is_locked("r1"));

        let err = coord
            .run_exclusive("r1", |_| async { Ok(2) })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::LockHeld {
                record_id: "r1".into()
            }
        );
        // A different record is unaffected.
        assert_eq!(coord.run_exclusive("r2", |_| async { Ok(3) }).await.unwrap(), 3);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(coord.run_exclusive("r1", |_| async { Ok(4) }).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn error_rolls_back_and_releases() {
        let coord = AtomicUpdateCoordinator::new();
        let err = coord
            .run_exclusive("r1", |_| async {
                Err::<(), _>(LedgerError::Persistence("disk full".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::Persistence("disk full".into()));
        assert!(!coord.is_locked("r1"));
        let tx = &coord.transactions()[0];
        assert_eq!(tx.status, TransactionStatus::RolledBack);
        assert_eq!(tx.error.as_deref(), Some("persistence failure: disk full"));
        assert!(coord.run_exclusive("r1", |_| async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_future_releases_lock() {
        let coord = AtomicUpdateCoordinator::new();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            coord.run_exclusive("r1", |_| std::future::pending::<Result<()>>()),
        )
        .await;
        assert!(timed_out.is_err());
        assert!(!coord.is_locked("r1"));
        assert_eq!(coord.transactions()[0].status, TransactionStatus::RolledBack);
    }

    #[tokio::test]
    async fn panic_releases_lock() {
        let coord = Arc::new(AtomicUpdateCoordinator::new());
        let task = {
            let coord = Arc::clone(&coord);
            tokio::spawn(async move {
                coord
                    .run_exclusive("r1", |_| async {
                        if true {
                            panic!("boom");
                        }
                        Ok(())
                    })
                    .await
            })
        };
        assert!(task.await.is_err());
        assert!(!coord.is_locked("r1"));
    }

    #[tokio::test]
    async fn transaction_id_is_passed_to_operation() {
        let coord = AtomicUpdateCoordinator::new();
        let id = coord.run_exclusive("r1", |id| async move { Ok(id) }).await.unwrap();
        let tx = coord.transaction(id).unwrap();
        assert_eq!(tx.record_id, "r1");
        assert!(coord.transaction(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn journal_is_bounded() {
        let coord = AtomicUpdateCoordinator::with_journal_capacity(2);
        for i in 0..5 {
            coord
                .run_exclusive(&format!("r{i}"), |_| async { Ok(()) })
                .await
                .unwrap();
        }
        let journal = coord.transactions();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[1].record_id, "r4");
    }
}
