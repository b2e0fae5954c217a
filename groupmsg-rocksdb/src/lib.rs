//! RocksDB backend for the group message queue database
//!
//! Transactions are optimistic and snapshot-based: a transaction reads the
//! database as of its creation plus its own writes, and committing fails if
//! another transaction committed a conflicting write in the meantime.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::stream;
use groupmsg_core::db::{
    IDatabaseTransactionOps, IRawDatabase, IRawDatabaseTransaction, IReadDatabaseTransactionOps,
    IWriteDatabaseTransactionOps, PrefixStream,
};
use groupmsg_core::envs::{GM_ROCKSDB_WRITE_BUFFER_SIZE_ENV, parse_env_var};
use groupmsg_core::runtime::block_in_place;
use groupmsg_logging::LOG_DB;
pub use rocksdb;
use rocksdb::{OptimisticTransactionOptions, WriteOptions};
use tracing::{debug, info};

#[derive(Debug)]
pub struct RocksDb(rocksdb::OptimisticTransactionDB);

pub struct RocksDbTransaction<'a>(rocksdb::Transaction<'a, rocksdb::OptimisticTransactionDB>);

impl RocksDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<RocksDb> {
        let opts = get_default_options()?;
        let db: rocksdb::OptimisticTransactionDB =
            rocksdb::OptimisticTransactionDB::<rocksdb::SingleThreaded>::open(&opts, &db_path)
                .with_context(|| {
                    format!("Could not open rocksdb at {}", db_path.as_ref().display())
                })?;
        info!(target: LOG_DB, path = %db_path.as_ref().display(), "Opened rocksdb database");
        Ok(RocksDb(db))
    }

    pub fn inner(&self) -> &rocksdb::OptimisticTransactionDB {
        &self.0
    }
}

fn is_power_of_two(num: usize) -> bool {
    num.count_ones() == 1
}

fn get_default_options() -> Result<rocksdb::Options> {
    let mut opts = rocksdb::Options::default();
    if let Some(size) = parse_env_var::<usize>(GM_ROCKSDB_WRITE_BUFFER_SIZE_ENV)? {
        debug!(target: LOG_DB, size, "Using custom write buffer size");
        if !is_power_of_two(size) {
            bail!("{GM_ROCKSDB_WRITE_BUFFER_SIZE_ENV} is not a power of 2");
        }
        opts.set_write_buffer_size(size);
    }
    opts.create_if_missing(true);
    Ok(opts)
}

/// The smallest byte string that is greater than every key starting with
/// `prefix`, or `None` if `prefix` is all `0xff`
///
/// Reverse iteration over a prefix has to start from here.
fn next_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Wraps a blocking rocksdb iterator so each `next` runs in `block_in_place`
fn convert_to_async_stream<'i, I>(iter: I) -> impl futures::Stream<Item = I::Item> + 'i
where
    I: Iterator + Send + 'i,
    I::Item: Send,
{
    stream::unfold(iter, |mut iter| async move {
        block_in_place(move || {
            let item = iter.next();
            item.map(move |item| (item, iter))
        })
    })
}

#[async_trait]
impl IRawDatabase for RocksDb {
    type Transaction<'a> = RocksDbTransaction<'a>;

    async fn begin_transaction<'a>(&'a self) -> RocksDbTransaction<'a> {
        let mut optimistic_options = OptimisticTransactionOptions::default();
        optimistic_options.set_snapshot(true);
        let rocksdb_tx = RocksDbTransaction(
            self.0
                .transaction_opt(&WriteOptions::default(), &optimistic_options),
        );
        // rolling back without an explicit savepoint goes to the start
        block_in_place(|| rocksdb_tx.0.set_savepoint());

        rocksdb_tx
    }
}

impl<'a> RocksDbTransaction<'a> {
    fn prefix_iter<'s>(
        &'s self,
        key_prefix: &[u8],
        mode: rocksdb::IteratorMode<'_>,
    ) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + Send + use<'s, 'a> {
        let prefix = key_prefix.to_vec();
        let mut options = rocksdb::ReadOptions::default();
        options.set_iterate_range(rocksdb::PrefixRange(prefix.clone()));
        self.0
            .snapshot()
            .iterator_opt(mode, options)
            .map_while(move |res| {
                let (key_bytes, value_bytes) = res.expect("Error reading from RocksDb");
                key_bytes
                    .starts_with(&prefix)
                    .then(|| (key_bytes.to_vec(), value_bytes.to_vec()))
            })
    }
}

#[async_trait]
impl IReadDatabaseTransactionOps for RocksDbTransaction<'_> {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        block_in_place(|| Ok(self.0.snapshot().get(key)?))
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>> {
        Ok(block_in_place(|| {
            let iter = self.prefix_iter(
                key_prefix,
                rocksdb::IteratorMode::From(key_prefix, rocksdb::Direction::Forward),
            );
            Box::pin(convert_to_async_stream(iter))
        }))
    }

    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>> {
        let next_prefix = next_prefix(key_prefix);
        Ok(block_in_place(|| {
            let mode = match &next_prefix {
                Some(next_prefix) => {
                    rocksdb::IteratorMode::From(next_prefix, rocksdb::Direction::Reverse)
                }
                None => rocksdb::IteratorMode::End,
            };
            // collected eagerly as the iterator borrows `next_prefix`
            let entries = self.prefix_iter(key_prefix, mode).collect::<Vec<_>>();
            Box::pin(stream::iter(entries))
        }))
    }
}

#[async_trait]
impl IWriteDatabaseTransactionOps for RocksDbTransaction<'_> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        block_in_place(|| {
            let val = self.0.get(key)?;
            self.0.put(key, value)?;
            Ok(val)
        })
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        block_in_place(|| {
            let val = self.0.get(key)?;
            self.0.delete(key)?;
            Ok(val)
        })
    }

    async fn raw_remove_by_prefix(&mut self, key_prefix: &[u8]) -> Result<()> {
        block_in_place(|| {
            // delete_range is not available inside transactions
            let keys = self
                .prefix_iter(
                    key_prefix,
                    rocksdb::IteratorMode::From(key_prefix, rocksdb::Direction::Forward),
                )
                .map(|(key, _)| key)
                .collect::<Vec<_>>();
            for key in keys {
                self.0.delete(key)?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl IDatabaseTransactionOps for RocksDbTransaction<'_> {
    async fn set_tx_savepoint(&mut self) -> Result<()> {
        block_in_place(|| self.0.set_savepoint());
        Ok(())
    }

    async fn rollback_tx_to_savepoint(&mut self) -> Result<()> {
        Ok(block_in_place(|| self.0.rollback_to_savepoint())?)
    }
}

#[async_trait]
impl IRawDatabaseTransaction for RocksDbTransaction<'_> {
    async fn commit_tx(self) -> Result<()> {
        block_in_place(|| {
            self.0.commit()?;
            Ok(())
        })
    }
}
