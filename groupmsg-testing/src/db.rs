//! Database backends for exercising commit failures

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use groupmsg_core::db::mem_impl::{MemDatabase, MemTransaction};
use groupmsg_core::db::{
    IDatabaseTransactionOps, IRawDatabase, IRawDatabaseTransaction, IReadDatabaseTransactionOps,
    IWriteDatabaseTransactionOps, PrefixStream,
};
use groupmsg_logging::LOG_TEST;
use tracing::debug;

/// Decides which commits of a [`FlakyCommitDatabase`] fail
#[derive(Debug, Default)]
pub struct CommitFaults {
    /// Commits still to fail, `usize::MAX` fails all of them
    remaining: AtomicUsize,
    failed: AtomicUsize,
}

impl CommitFaults {
    /// Fail the next `commits` commits
    pub fn fail_next(&self, commits: usize) {
        self.remaining.store(commits, Ordering::SeqCst);
    }

    pub fn fail_all(&self) {
        self.remaining.store(usize::MAX, Ordering::SeqCst);
    }

    /// Number of commits that were failed so far
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        let should_fail = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                match remaining {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                }
            })
            .is_ok();
        if should_fail {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        should_fail
    }
}

/// In-memory database whose commits fail on demand, like a store that keeps
/// reporting write conflicts
///
/// A failed commit leaves the committed data untouched.
#[derive(Debug, Default)]
pub struct FlakyCommitDatabase {
    inner: MemDatabase,
    faults: Arc<CommitFaults>,
}

impl FlakyCommitDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Arc<CommitFaults> {
        self.faults.clone()
    }
}

pub struct FlakyCommitTransaction<'a> {
    inner: MemTransaction<'a>,
    faults: Arc<CommitFaults>,
}

#[async_trait]
impl IRawDatabase for FlakyCommitDatabase {
    type Transaction<'a> = FlakyCommitTransaction<'a>;

    async fn begin_transaction<'a>(&'a self) -> FlakyCommitTransaction<'a> {
        FlakyCommitTransaction {
            inner: self.inner.begin_transaction().await,
            faults: self.faults.clone(),
        }
    }
}

#[async_trait]
impl IReadDatabaseTransactionOps for FlakyCommitTransaction<'_> {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.raw_get_bytes(key).await
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>> {
        self.inner.raw_find_by_prefix(key_prefix).await
    }

    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>> {
        self.inner
            .raw_find_by_prefix_sorted_descending(key_prefix)
            .await
    }
}

#[async_trait]
impl IWriteDatabaseTransactionOps for FlakyCommitTransaction<'_> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.raw_insert_bytes(key, value).await
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.raw_remove_entry(key).await
    }
}

#[async_trait]
impl IDatabaseTransactionOps for FlakyCommitTransaction<'_> {
    async fn set_tx_savepoint(&mut self) -> Result<()> {
        self.inner.set_tx_savepoint().await
    }

    async fn rollback_tx_to_savepoint(&mut self) -> Result<()> {
        self.inner.rollback_tx_to_savepoint().await
    }
}

#[async_trait]
impl IRawDatabaseTransaction for FlakyCommitTransaction<'_> {
    async fn commit_tx(self) -> Result<()> {
        if self.faults.take() {
            debug!(target: LOG_TEST, "Failing commit");
            return Err(anyhow!("Write conflict"));
        }
        self.inner.commit_tx().await
    }
}
