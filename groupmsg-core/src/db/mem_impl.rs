//! In-memory database backend
//!
//! Each transaction works on a private copy of the data taken when it begins,
//! which gives snapshot isolation for free. Committing replays the
//! transaction's pending changes onto the shared map, so with concurrent
//! writers the last commit wins. Meant for tests and ephemeral setups.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream;
use groupmsg_logging::LOG_DB;
use tracing::trace;

use super::{
    IDatabaseTransactionOps, IRawDatabase, IRawDatabaseTransaction, IReadDatabaseTransactionOps,
    IWriteDatabaseTransactionOps, PrefixStream,
};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// `None` marks a removal
type PendingChanges = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

#[derive(Debug, Default)]
pub struct MemDatabase {
    data: Mutex<Map>,
}

#[derive(Debug)]
pub struct MemTransaction<'a> {
    db: &'a MemDatabase,
    view: Map,
    pending: PendingChanges,
    savepoint: Option<(Map, PendingChanges)>,
}

impl MemDatabase {
    pub fn new() -> MemDatabase {
        Default::default()
    }

    /// Number of committed entries
    pub fn len(&self) -> usize {
        self.data.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IRawDatabase for MemDatabase {
    type Transaction<'a> = MemTransaction<'a>;

    async fn begin_transaction<'a>(&'a self) -> MemTransaction<'a> {
        MemTransaction {
            db: self,
            view: self.data.lock().expect("poisoned").clone(),
            pending: PendingChanges::new(),
            savepoint: None,
        }
    }
}

impl MemTransaction<'_> {
    fn prefix_range(&self, key_prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.view
            .range::<[u8], _>((std::ops::Bound::Included(key_prefix), std::ops::Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(key_prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

#[async_trait]
impl IReadDatabaseTransactionOps for MemTransaction<'_> {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.view.get(key).cloned())
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>> {
        Ok(Box::pin(stream::iter(self.prefix_range(key_prefix))))
    }

    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>> {
        let mut entries = self.prefix_range(key_prefix);
        entries.reverse();
        Ok(Box::pin(stream::iter(entries)))
    }
}

#[async_trait]
impl IWriteDatabaseTransactionOps for MemTransaction<'_> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.pending.insert(key.to_vec(), Some(value.to_vec()));
        Ok(self.view.insert(key.to_vec(), value.to_vec()))
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.pending.insert(key.to_vec(), None);
        Ok(self.view.remove(key))
    }
}

#[async_trait]
impl IDatabaseTransactionOps for MemTransaction<'_> {
    async fn set_tx_savepoint(&mut self) -> Result<()> {
        self.savepoint = Some((self.view.clone(), self.pending.clone()));
        Ok(())
    }

    async fn rollback_tx_to_savepoint(&mut self) -> Result<()> {
        match self.savepoint.clone() {
            Some((view, pending)) => {
                self.view = view;
                self.pending = pending;
            }
            None => {
                // no savepoint means rolling back to the start
                self.view = self.db.data.lock().expect("poisoned").clone();
                self.pending.clear();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IRawDatabaseTransaction for MemTransaction<'_> {
    async fn commit_tx(self) -> Result<()> {
        trace!(target: LOG_DB, changes = self.pending.len(), "Committing memory transaction");
        let mut data = self.db.data.lock().expect("poisoned");
        for (key, change) in self.pending {
            match change {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
