// ============================================================================
// Transaction Executor
// ============================================================================

use super::{TransactionId, TransactionState};
use crate::core::Result;
use crate::interface::AdapterHandle;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub committed: u64,
    pub aborted: u64,
}

#[derive(Default)]
struct Counters {
    committed: AtomicU64,
    aborted: AtomicU64,
}

/// Runs closures inside an adapter transaction.
///
/// The closure receives the handle; `Ok` commits and `Err` rolls back. A
/// failing rollback is logged and the closure's error is returned.
#[derive(Clone)]
pub struct TransactionExecutor {
    adapter: AdapterHandle,
    counters: Arc<Counters>,
}

impl TransactionExecutor {
    pub fn new(adapter: AdapterHandle) -> Self {
        Self {
            adapter,
            counters: Arc::new(Counters::default()),
        }
    }

    pub async fn run<F, Fut, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce(AdapterHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = TransactionId::new();
        self.adapter.begin().await?;
        event!(Level::TRACE, txn = %id, state = %TransactionState::Active, "transaction started");

        match work(Arc::clone(&self.adapter)).await {
            Ok(value) => {
                if let Err(err) = self.adapter.commit().await {
                    self.abort(id).await;
                    return Err(err);
                }
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                event!(Level::TRACE, txn = %id, state = %TransactionState::Committed, "transaction finished");
                Ok(value)
            }
            Err(err) => {
                self.abort(id).await;
                Err(err)
            }
        }
    }

    async fn abort(&self, id: TransactionId) {
        if let Err(err) = self.adapter.rollback().await {
            event!(Level::WARN, txn = %id, error = %err, "transaction rollback failed");
        }
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        event!(Level::TRACE, txn = %id, state = %TransactionState::Aborted, "transaction finished");
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
        }
    }
}
