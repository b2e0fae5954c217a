//! Transactional key-value database abstraction
//!
//! Backends implement the raw traits ([`IRawDatabase`],
//! [`IRawDatabaseTransaction`] and the `I*DatabaseTransactionOps` family)
//! on plain byte keys and values. [`Database`] erases the backend type and
//! hands out [`DatabaseTransaction`]s (read-write, committable) and
//! [`ReadDatabaseTransaction`]s (snapshot reads, never committed).
//!
//! Typed access goes through [`IReadDatabaseTransactionOpsTyped`] and
//! [`IWriteDatabaseTransactionOpsTyped`], which are implemented for every
//! transaction and work on records declared with [`impl_db_record!`] and
//! [`impl_db_lookup!`].
//!
//! # Isolation
//!
//! Backends must provide snapshot isolation: a transaction reads the state
//! as of its creation plus its own writes, never sees uncommitted writes of
//! other transactions, and a prefix scan returns the same set of keys for
//! the whole life of the transaction. Prefix scans return keys in ascending
//! byte order.

use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use groupmsg_logging::LOG_DB;
use thiserror::Error;
use tracing::{instrument, trace, warn};

use crate::encoding::{Decodable, Encodable};
use crate::util::BoxFuture;

pub mod mem_impl;

pub use test_utils::*;

pub trait DatabaseKeyPrefix: Debug {
    fn to_bytes(&self) -> Vec<u8>;
}

/// A key + value pair in the database with a unique prefix
/// Extends `DatabaseKeyPrefix` to prepend the key's prefix.
pub trait DatabaseRecord: DatabaseKeyPrefix {
    const DB_PREFIX: u8;
    type Key: DatabaseKey + Debug;
    type Value: DatabaseValue + Debug;
}

/// A key that can be used to query one or more `DatabaseRecord`
/// Extends `DatabaseKeyPrefix` to prepend the key's prefix.
pub trait DatabaseLookup: DatabaseKeyPrefix {
    type Record: DatabaseRecord;
}

// Every `DatabaseRecord` is automatically a `DatabaseLookup`
impl<Record> DatabaseLookup for Record
where
    Record: DatabaseRecord + Debug + Decodable + Encodable,
{
    type Record = Record;
}

/// `DatabaseKey` that represents the lookup structure for retrieving key/value
/// pairs from the database.
pub trait DatabaseKey: Sized {
    fn from_bytes(data: &[u8]) -> Result<Self, DecodingError>;
}

/// `DatabaseValue` that represents the value structure of database records.
pub trait DatabaseValue: Sized + Debug {
    fn from_bytes(data: &[u8]) -> Result<Self, DecodingError>;
    fn to_bytes(&self) -> Vec<u8>;
}

pub type PrefixStream<'a> = Pin<Box<dyn Stream<Item = (Vec<u8>, Vec<u8>)> + Send + 'a>>;

/// Read operations every transaction supports
#[async_trait]
pub trait IReadDatabaseTransactionOps: Send {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Returns a stream of key-value pairs with keys that start with
    /// `key_prefix`, in ascending key order.
    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>>;

    /// Same as [`Self::raw_find_by_prefix`] but the order is descending by key.
    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>>;
}

/// Write operations of a read-write transaction
#[async_trait]
pub trait IWriteDatabaseTransactionOps: IReadDatabaseTransactionOps {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Default implementation is a combination of [`Self::raw_find_by_prefix`]
    /// + loop over [`Self::raw_remove_entry`]
    async fn raw_remove_by_prefix(&mut self, key_prefix: &[u8]) -> Result<()> {
        let keys = self
            .raw_find_by_prefix(key_prefix)
            .await?
            .map(|kv| kv.0)
            .collect::<Vec<_>>()
            .await;
        for key in keys {
            self.raw_remove_entry(key.as_slice()).await?;
        }
        Ok(())
    }
}

/// Savepoint support on top of the write operations
#[async_trait]
pub trait IDatabaseTransactionOps: IWriteDatabaseTransactionOps {
    /// Create a savepoint during the transaction that can be rolled back to
    /// using [`Self::rollback_tx_to_savepoint`]. Rolling back to the savepoint
    /// will undo all changes made since the savepoint was set.
    async fn set_tx_savepoint(&mut self) -> Result<()>;

    async fn rollback_tx_to_savepoint(&mut self) -> Result<()>;
}

/// A raw database transaction as provided by a backend
#[async_trait]
pub trait IRawDatabaseTransaction: IDatabaseTransactionOps {
    async fn commit_tx(self) -> Result<()>;
}

/// A database backend
#[async_trait]
pub trait IRawDatabase: Debug + Send + Sync + 'static {
    type Transaction<'a>: IRawDatabaseTransaction;

    async fn begin_transaction<'a>(&'a self) -> Self::Transaction<'a>;
}

/// Extension trait turning any backend into a [`Database`]
pub trait IRawDatabaseExt: IRawDatabase + Sized {
    fn into_database(self) -> Database {
        Database::new(self)
    }
}

impl<T> IRawDatabaseExt for T where T: IRawDatabase {}

/// Type-erased database backend
#[async_trait]
pub trait IDatabase: Debug + Send + Sync + 'static {
    async fn begin_transaction<'a>(&'a self) -> Box<dyn IDatabaseTransaction + 'a>;
}

/// Type-erased raw transaction that can be committed through `&mut`
#[async_trait]
pub trait IDatabaseTransaction: IDatabaseTransactionOps {
    async fn commit_tx(&mut self) -> Result<()>;
}

#[derive(Debug)]
struct BaseDatabase<RawDatabase> {
    raw: RawDatabase,
}

#[async_trait]
impl<RawDatabase> IDatabase for BaseDatabase<RawDatabase>
where
    RawDatabase: IRawDatabase,
{
    async fn begin_transaction<'a>(&'a self) -> Box<dyn IDatabaseTransaction + 'a> {
        Box::new(BaseDatabaseTransaction {
            raw: Some(self.raw.begin_transaction().await),
        })
    }
}

/// Adapts an owned-commit raw transaction to [`IDatabaseTransaction`]
struct BaseDatabaseTransaction<Tx> {
    // `None` once committed
    raw: Option<Tx>,
}

impl<Tx> BaseDatabaseTransaction<Tx> {
    fn raw_mut(&mut self) -> Result<&mut Tx> {
        self.raw
            .as_mut()
            .context("Cannot use a database transaction after it was committed")
    }
}

#[async_trait]
impl<Tx: IRawDatabaseTransaction> IReadDatabaseTransactionOps for BaseDatabaseTransaction<Tx> {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.raw_mut()?.raw_get_bytes(key).await
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>> {
        self.raw_mut()?.raw_find_by_prefix(key_prefix).await
    }

    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>> {
        self.raw_mut()?
            .raw_find_by_prefix_sorted_descending(key_prefix)
            .await
    }
}

#[async_trait]
impl<Tx: IRawDatabaseTransaction> IWriteDatabaseTransactionOps for BaseDatabaseTransaction<Tx> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.raw_mut()?.raw_insert_bytes(key, value).await
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.raw_mut()?.raw_remove_entry(key).await
    }

    async fn raw_remove_by_prefix(&mut self, key_prefix: &[u8]) -> Result<()> {
        self.raw_mut()?.raw_remove_by_prefix(key_prefix).await
    }
}

#[async_trait]
impl<Tx: IRawDatabaseTransaction> IDatabaseTransactionOps for BaseDatabaseTransaction<Tx> {
    async fn set_tx_savepoint(&mut self) -> Result<()> {
        self.raw_mut()?.set_tx_savepoint().await
    }

    async fn rollback_tx_to_savepoint(&mut self) -> Result<()> {
        self.raw_mut()?.rollback_tx_to_savepoint().await
    }
}

#[async_trait]
impl<Tx: IRawDatabaseTransaction> IDatabaseTransaction for BaseDatabaseTransaction<Tx> {
    async fn commit_tx(&mut self) -> Result<()> {
        self.raw
            .take()
            .context("Cannot commit a database transaction twice")?
            .commit_tx()
            .await
    }
}

/// A handle to a type-erased database implementation
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<dyn IDatabase>,
}

/// Error returned when the autocommit function fails
#[derive(Debug, Error)]
pub enum AutocommitError<E> {
    /// Committing the transaction failed too many times, giving up
    #[error("Commit failed after {attempts} attempts: {last_error}")]
    CommitFailed {
        /// Number of attempts
        attempts: usize,
        /// Last error on commit
        last_error: anyhow::Error,
    },
    /// Error returned by the closure provided to `autocommit`. If returned no
    /// commit was attempted in that round
    #[error("Autocommit closure failed on attempt {attempts}")]
    ClosureError {
        /// The attempt on which the closure returned an error
        attempts: usize,
        /// Error returned by the closure
        error: E,
    },
}

impl Database {
    pub fn new(raw: impl IRawDatabase + 'static) -> Self {
        Self {
            inner: Arc::new(BaseDatabase { raw }),
        }
    }

    /// Begin a read-write transaction
    pub async fn begin_write_transaction(&self) -> DatabaseTransaction<'_> {
        DatabaseTransaction::new(self.inner.begin_transaction().await)
    }

    /// Begin a snapshot read transaction
    pub async fn begin_read_transaction(&self) -> ReadDatabaseTransaction<'_> {
        ReadDatabaseTransaction {
            tx: self.inner.begin_transaction().await,
        }
    }

    /// Fill a fresh write transaction with `tx_fn` and commit it
    ///
    /// An `Err` from `tx_fn` drops the transaction and is returned as is. A
    /// failed commit starts over with a new transaction, at most
    /// `max_attempts` times in total (unbounded for `None`). Anything
    /// `tx_fn` does outside of the transaction happens once per attempt.
    ///
    /// # Panics
    ///
    /// If `max_attempts` is `Some(0)`.
    pub async fn autocommit<'s: 'dt, 'dt, F, T, E>(
        &'s self,
        tx_fn: F,
        max_attempts: Option<usize>,
    ) -> Result<T, AutocommitError<E>>
    where
        for<'a> F: Fn(&'a mut DatabaseTransaction<'dt>) -> BoxFuture<'a, Result<T, E>>,
    {
        assert_ne!(max_attempts, Some(0));
        let mut curr_attempts: usize = 0;

        loop {
            curr_attempts = curr_attempts
                .checked_add(1)
                .expect("db autocommit attempt counter overflowed");

            let mut dbtx = self.begin_write_transaction().await;

            let value = match tx_fn(&mut dbtx).await {
                Ok(value) => value,
                Err(error) => {
                    return Err(AutocommitError::ClosureError {
                        attempts: curr_attempts,
                        error,
                    });
                }
            };

            match dbtx.commit_tx_result().await {
                Ok(()) => return Ok(value),
                Err(err) => {
                    warn!(
                        target: LOG_DB,
                        curr_attempts,
                        err = %err,
                        "Database commit failed in an autocommit block"
                    );
                    if max_attempts.is_some_and(|max_att| max_att <= curr_attempts) {
                        return Err(AutocommitError::CommitFailed {
                            attempts: curr_attempts,
                            last_error: err,
                        });
                    }
                }
            }
        }
    }
}

struct CommitTracker {
    is_committed: bool,
    has_writes: bool,
}

impl Drop for CommitTracker {
    fn drop(&mut self) {
        if self.has_writes && !self.is_committed {
            warn!(
                target: LOG_DB,
                "DatabaseTransaction has writes and has not called commit."
            );
        }
    }
}

/// A read-write transaction
///
/// Dropping it without calling [`Self::commit_tx`] discards all writes.
pub struct DatabaseTransaction<'tx> {
    tx: Box<dyn IDatabaseTransaction + 'tx>,
    commit_tracker: CommitTracker,
    on_commit_hooks: Vec<Box<dyn FnOnce() + Send + 'static>>,
}

impl<'tx> DatabaseTransaction<'tx> {
    fn new(tx: Box<dyn IDatabaseTransaction + 'tx>) -> Self {
        Self {
            tx,
            commit_tracker: CommitTracker {
                is_committed: false,
                has_writes: false,
            },
            on_commit_hooks: vec![],
        }
    }

    /// Register a hook that runs after this transaction commits successfully
    ///
    /// Hooks run in registration order and are dropped without running if the
    /// transaction is dropped or fails to commit.
    pub fn on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_commit_hooks.push(Box::new(f));
    }

    pub async fn commit_tx_result(mut self) -> Result<()> {
        self.commit_tracker.is_committed = true;
        self.tx.commit_tx().await?;
        for hook in std::mem::take(&mut self.on_commit_hooks) {
            hook();
        }
        Ok(())
    }

    pub async fn commit_tx(self) {
        self.commit_tx_result()
            .await
            .expect("Unrecoverable error occurred while committing to the database.");
    }

    #[instrument(target = "gm::db", level = "trace", skip_all, ret)]
    pub async fn set_tx_savepoint(&mut self) -> Result<()> {
        self.tx.set_tx_savepoint().await
    }

    #[instrument(target = "gm::db", level = "trace", skip_all, ret)]
    pub async fn rollback_tx_to_savepoint(&mut self) -> Result<()> {
        self.tx.rollback_tx_to_savepoint().await
    }
}

#[async_trait]
impl IReadDatabaseTransactionOps for DatabaseTransaction<'_> {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.raw_get_bytes(key).await
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>> {
        self.tx.raw_find_by_prefix(key_prefix).await
    }

    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>> {
        self.tx.raw_find_by_prefix_sorted_descending(key_prefix).await
    }
}

#[async_trait]
impl IWriteDatabaseTransactionOps for DatabaseTransaction<'_> {
    async fn raw_insert_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        self.commit_tracker.has_writes = true;
        self.tx.raw_insert_bytes(key, value).await
    }

    async fn raw_remove_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.commit_tracker.has_writes = true;
        self.tx.raw_remove_entry(key).await
    }

    async fn raw_remove_by_prefix(&mut self, key_prefix: &[u8]) -> Result<()> {
        self.commit_tracker.has_writes = true;
        self.tx.raw_remove_by_prefix(key_prefix).await
    }
}

/// A snapshot read transaction, released when dropped
pub struct ReadDatabaseTransaction<'tx> {
    tx: Box<dyn IDatabaseTransaction + 'tx>,
}

#[async_trait]
impl IReadDatabaseTransactionOps for ReadDatabaseTransaction<'_> {
    async fn raw_get_bytes(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tx.raw_get_bytes(key).await
    }

    async fn raw_find_by_prefix(&mut self, key_prefix: &[u8]) -> Result<PrefixStream<'_>> {
        self.tx.raw_find_by_prefix(key_prefix).await
    }

    async fn raw_find_by_prefix_sorted_descending(
        &mut self,
        key_prefix: &[u8],
    ) -> Result<PrefixStream<'_>> {
        self.tx.raw_find_by_prefix_sorted_descending(key_prefix).await
    }
}

fn decode_value<V: DatabaseValue>(value_bytes: &[u8]) -> Result<V, DecodingError> {
    trace!(
        target: LOG_DB,
        value_type = std::any::type_name::<V>(),
        len = value_bytes.len(),
        "decoding value",
    );
    V::from_bytes(value_bytes)
}

/// Typed reads over any transaction
#[async_trait]
pub trait IReadDatabaseTransactionOpsTyped {
    async fn get_value<K>(&mut self, key: &K) -> Option<K::Value>
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync;

    async fn find_by_prefix<KP>(
        &mut self,
        key_prefix: &KP,
    ) -> Pin<
        Box<
            dyn Stream<
                    Item = (
                        KP::Record,
                        <<KP as DatabaseLookup>::Record as DatabaseRecord>::Value,
                    ),
                > + Send
                + '_,
        >,
    >
    where
        KP: DatabaseLookup + Send + Sync,
        KP::Record: DatabaseKey;

    async fn find_by_prefix_sorted_descending<KP>(
        &mut self,
        key_prefix: &KP,
    ) -> Pin<
        Box<
            dyn Stream<
                    Item = (
                        KP::Record,
                        <<KP as DatabaseLookup>::Record as DatabaseRecord>::Value,
                    ),
                > + Send
                + '_,
        >,
    >
    where
        KP: DatabaseLookup + Send + Sync,
        KP::Record: DatabaseKey;
}

fn decode_pair<KP>(
    (key_bytes, value_bytes): (Vec<u8>, Vec<u8>),
) -> (
    KP::Record,
    <<KP as DatabaseLookup>::Record as DatabaseRecord>::Value,
)
where
    KP: DatabaseLookup,
    KP::Record: DatabaseKey,
{
    let key = KP::Record::from_bytes(&key_bytes)
        .with_context(|| anyhow::anyhow!("key: {}", hex::encode(&key_bytes)))
        .expect("Unrecoverable error reading DatabaseKey");
    let value = decode_value(&value_bytes)
        .with_context(|| anyhow::anyhow!("key: {}", hex::encode(&key_bytes)))
        .expect("Unrecoverable error decoding DatabaseValue");
    (key, value)
}

#[async_trait]
impl<T> IReadDatabaseTransactionOpsTyped for T
where
    T: IReadDatabaseTransactionOps + ?Sized,
{
    async fn get_value<K>(&mut self, key: &K) -> Option<K::Value>
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync,
    {
        let key_bytes = key.to_bytes();
        let value_bytes = self
            .raw_get_bytes(&key_bytes)
            .await
            .expect("Unrecoverable error when reading from database")?;

        Some(
            decode_value::<K::Value>(&value_bytes)
                .expect("Unrecoverable error when decoding the database value"),
        )
    }

    async fn find_by_prefix<KP>(
        &mut self,
        key_prefix: &KP,
    ) -> Pin<
        Box<
            dyn Stream<
                    Item = (
                        KP::Record,
                        <<KP as DatabaseLookup>::Record as DatabaseRecord>::Value,
                    ),
                > + Send
                + '_,
        >,
    >
    where
        KP: DatabaseLookup + Send + Sync,
        KP::Record: DatabaseKey,
    {
        let prefix_bytes = key_prefix.to_bytes();
        Box::pin(
            self.raw_find_by_prefix(&prefix_bytes)
                .await
                .expect("Error doing prefix search in database")
                .map(|kv| decode_pair::<KP>(kv)),
        )
    }

    async fn find_by_prefix_sorted_descending<KP>(
        &mut self,
        key_prefix: &KP,
    ) -> Pin<
        Box<
            dyn Stream<
                    Item = (
                        KP::Record,
                        <<KP as DatabaseLookup>::Record as DatabaseRecord>::Value,
                    ),
                > + Send
                + '_,
        >,
    >
    where
        KP: DatabaseLookup + Send + Sync,
        KP::Record: DatabaseKey,
    {
        let prefix_bytes = key_prefix.to_bytes();
        Box::pin(
            self.raw_find_by_prefix_sorted_descending(&prefix_bytes)
                .await
                .expect("Error doing prefix search in database")
                .map(|kv| decode_pair::<KP>(kv)),
        )
    }
}

/// Typed writes over any read-write transaction
#[async_trait]
pub trait IWriteDatabaseTransactionOpsTyped {
    async fn insert_entry<K>(&mut self, key: &K, value: &K::Value) -> Option<K::Value>
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync,
        K::Value: Send + Sync;

    /// Insert a value that is expected not to exist yet, logging a warning
    /// if it did
    async fn insert_new_entry<K>(&mut self, key: &K, value: &K::Value)
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync,
        K::Value: Send + Sync;

    async fn remove_entry<K>(&mut self, key: &K) -> Option<K::Value>
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync;

    async fn remove_by_prefix<KP>(&mut self, key_prefix: &KP)
    where
        KP: DatabaseLookup + Send + Sync;
}

#[async_trait]
impl<T> IWriteDatabaseTransactionOpsTyped for T
where
    T: IWriteDatabaseTransactionOps + ?Sized,
{
    async fn insert_entry<K>(&mut self, key: &K, value: &K::Value) -> Option<K::Value>
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync,
        K::Value: Send + Sync,
    {
        self.raw_insert_bytes(&key.to_bytes(), &value.to_bytes())
            .await
            .expect("Unrecoverable error while inserting into the database")
            .map(|old_val_bytes| {
                decode_value(&old_val_bytes)
                    .expect("Unrecoverable error while decoding the database value")
            })
    }

    async fn insert_new_entry<K>(&mut self, key: &K, value: &K::Value)
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync,
        K::Value: Send + Sync,
    {
        let prev_val = self
            .raw_insert_bytes(&key.to_bytes(), &value.to_bytes())
            .await
            .expect("Unrecoverable error occurred while inserting new entry into database");
        if let Some(prev_val) = prev_val {
            warn!(
                target: LOG_DB,
                key = ?key,
                prev_value = %hex::encode(prev_val),
                "Database overwriting element when expecting insertion of new entry",
            );
        }
    }

    async fn remove_entry<K>(&mut self, key: &K) -> Option<K::Value>
    where
        K: DatabaseKey + DatabaseRecord + Send + Sync,
    {
        let value_bytes = self
            .raw_remove_entry(&key.to_bytes())
            .await
            .expect("Unrecoverable error occurred while removing an entry from the database")?;
        Some(
            decode_value(&value_bytes)
                .expect("Unrecoverable error occurred while decoding the database value"),
        )
    }

    async fn remove_by_prefix<KP>(&mut self, key_prefix: &KP)
    where
        KP: DatabaseLookup + Send + Sync,
    {
        self.raw_remove_by_prefix(&key_prefix.to_bytes())
            .await
            .expect("Unrecoverable error occurred while removing by prefix");
    }
}

impl<T> DatabaseKeyPrefix for T
where
    T: DatabaseLookup + Encodable + Debug,
{
    fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![<Self as DatabaseLookup>::Record::DB_PREFIX];
        self.consensus_encode(&mut data)
            .expect("Writing to vec is infallible");
        data
    }
}

impl<T> DatabaseKey for T
where
    T: DatabaseRecord + Decodable + Sized,
{
    fn from_bytes(data: &[u8]) -> Result<Self, DecodingError> {
        let Some((&prefix, rest)) = data.split_first() else {
            return Err(DecodingError::wrong_length(1, 0));
        };

        if prefix != Self::DB_PREFIX {
            return Err(DecodingError::wrong_prefix(Self::DB_PREFIX, prefix));
        }

        <Self as Decodable>::consensus_decode_whole(rest)
            .map_err(|decode_error| DecodingError::Other(decode_error.0))
    }
}

impl<T> DatabaseValue for T
where
    T: Debug + Encodable + Decodable,
{
    fn from_bytes(data: &[u8]) -> Result<Self, DecodingError> {
        T::consensus_decode_whole(data).map_err(|e| DecodingError::Other(e.0))
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.consensus_encode_to_vec()
    }
}

/// This is a helper macro that generates the implementations of
/// `DatabaseRecord` necessary for reading/writing to the
/// database and fetching by prefix.
///
/// - `key`: This is the type of struct that will be used as the key into the
///   database
/// - `value`: This is the type of struct that will be used as the value into
///   the database
/// - `db_prefix`: Required enum expression that is represented as a `u8` and is
///   prepended to this key
#[macro_export]
macro_rules! impl_db_record {
    (key = $key:ty, value = $val:ty, db_prefix = $db_prefix:expr $(,)?) => {
        impl $crate::db::DatabaseRecord for $key {
            const DB_PREFIX: u8 = $db_prefix as u8;
            type Key = Self;
            type Value = $val;
        }
    };
}

/// Declares `query_prefix` types that can be passed to `find_by_prefix` to
/// find records of type `key`
#[macro_export]
macro_rules! impl_db_lookup{
    (key = $key:ty $(, query_prefix = $query_prefix:ty)* $(,)?) => {
        $(
            impl $crate::db::DatabaseLookup for $query_prefix {
                type Record = $key;
            }
        )*
    };
}

#[derive(Debug, Error)]
pub enum DecodingError {
    #[error("Key had a wrong prefix, expected {expected} but was {found}")]
    WrongPrefix { expected: u8, found: u8 },
    #[error("Key had a wrong length, expected {expected} but was {found}")]
    WrongLength { expected: usize, found: usize },
    #[error("Other decoding error: {0:#}")]
    Other(anyhow::Error),
}

impl DecodingError {
    pub fn other<E: std::error::Error + Send + Sync + 'static>(error: E) -> DecodingError {
        DecodingError::Other(anyhow::Error::from(error))
    }

    pub fn wrong_prefix(expected: u8, found: u8) -> DecodingError {
        DecodingError::WrongPrefix { expected, found }
    }

    pub fn wrong_length(expected: usize, found: usize) -> DecodingError {
        DecodingError::WrongLength { expected, found }
    }
}

/// Backend conformance checks, shared by the test suites of every backend
mod test_utils {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::{Database, IReadDatabaseTransactionOpsTyped, IWriteDatabaseTransactionOpsTyped};
    use crate::encoding::{Decodable, DecodeError, Encodable};

    #[repr(u8)]
    #[derive(Clone)]
    pub enum TestDbKeyPrefix {
        Test = 0x42,
        AltTest = 0x43,
    }

    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub struct TestKey(pub u64);

    #[derive(Debug)]
    pub struct TestKeyPrefix;

    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub struct AltTestKey(pub u64);

    #[derive(Debug)]
    pub struct AltTestKeyPrefix;

    #[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub struct TestVal(pub u64);

    macro_rules! impl_encode_decode_newtype_u64 {
        ($ty:ident) => {
            impl Encodable for $ty {
                fn consensus_encode<W: std::io::Write>(
                    &self,
                    writer: &mut W,
                ) -> Result<usize, std::io::Error> {
                    self.0.consensus_encode(writer)
                }
            }

            impl Decodable for $ty {
                fn consensus_decode<D: std::io::Read>(d: &mut D) -> Result<Self, DecodeError> {
                    Ok($ty(u64::consensus_decode(d)?))
                }
            }
        };
    }

    macro_rules! impl_encode_decode_unit {
        ($ty:ident) => {
            impl Encodable for $ty {
                fn consensus_encode<W: std::io::Write>(
                    &self,
                    _writer: &mut W,
                ) -> Result<usize, std::io::Error> {
                    Ok(0)
                }
            }
        };
    }

    impl_encode_decode_newtype_u64!(TestKey);
    impl_encode_decode_newtype_u64!(AltTestKey);
    impl_encode_decode_newtype_u64!(TestVal);
    impl_encode_decode_unit!(TestKeyPrefix);
    impl_encode_decode_unit!(AltTestKeyPrefix);

    impl_db_record!(key = TestKey, value = TestVal, db_prefix = TestDbKeyPrefix::Test);
    impl_db_lookup!(key = TestKey, query_prefix = TestKeyPrefix);
    impl_db_record!(
        key = AltTestKey,
        value = TestVal,
        db_prefix = TestDbKeyPrefix::AltTest,
    );
    impl_db_lookup!(key = AltTestKey, query_prefix = AltTestKeyPrefix);

    pub async fn verify_insert_elements(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        assert!(dbtx.insert_entry(&TestKey(1), &TestVal(2)).await.is_none());
        assert!(dbtx.insert_entry(&TestKey(2), &TestVal(3)).await.is_none());
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_read_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey(1)).await, Some(TestVal(2)));
        assert_eq!(dbtx.get_value(&TestKey(2)).await, Some(TestVal(3)));

        let mut dbtx = db.begin_write_transaction().await;
        assert_eq!(
            dbtx.insert_entry(&TestKey(1), &TestVal(4)).await,
            Some(TestVal(2))
        );
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_read_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey(1)).await, Some(TestVal(4)));
    }

    pub async fn verify_remove_nonexisting(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey(1)).await, None);
        assert!(dbtx.remove_entry(&TestKey(1)).await.is_none());
        dbtx.commit_tx().await;
    }

    pub async fn verify_remove_existing(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(1), &TestVal(2)).await;
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_write_transaction().await;
        assert_eq!(dbtx.remove_entry(&TestKey(1)).await, Some(TestVal(2)));
        assert_eq!(dbtx.get_value(&TestKey(1)).await, None);
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_read_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey(1)).await, None);
    }

    pub async fn verify_read_own_writes(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(1), &TestVal(2)).await;
        assert_eq!(dbtx.get_value(&TestKey(1)).await, Some(TestVal(2)));
        dbtx.commit_tx().await;
    }

    pub async fn verify_prevent_dirty_reads(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(1), &TestVal(2)).await;

        // uncommitted writes are invisible to others
        let mut dbtx2 = db.begin_read_transaction().await;
        assert_eq!(dbtx2.get_value(&TestKey(1)).await, None);

        dbtx.commit_tx().await;
    }

    pub async fn verify_find_by_prefix(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        for n in [55, 3, 300, 54] {
            dbtx.insert_new_entry(&TestKey(n), &TestVal(n * 10)).await;
        }
        dbtx.insert_new_entry(&AltTestKey(1), &TestVal(7)).await;
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_read_transaction().await;

        // ascending key order, no entries of the other prefix
        let ascending = dbtx
            .find_by_prefix(&TestKeyPrefix)
            .await
            .collect::<Vec<_>>()
            .await;
        assert_eq!(
            ascending,
            vec![
                (TestKey(3), TestVal(30)),
                (TestKey(54), TestVal(540)),
                (TestKey(55), TestVal(550)),
                (TestKey(300), TestVal(3000)),
            ]
        );

        let descending = dbtx
            .find_by_prefix_sorted_descending(&TestKeyPrefix)
            .await
            .collect::<Vec<_>>()
            .await;
        let mut expected = ascending;
        expected.reverse();
        assert_eq!(descending, expected);

        let alt = dbtx
            .find_by_prefix(&AltTestKeyPrefix)
            .await
            .collect::<Vec<_>>()
            .await;
        assert_eq!(alt, vec![(AltTestKey(1), TestVal(7))]);
    }

    pub async fn verify_commit(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(1), &TestVal(2)).await;
        dbtx.commit_tx().await;

        let mut dbtx2 = db.begin_read_transaction().await;
        assert_eq!(dbtx2.get_value(&TestKey(1)).await, Some(TestVal(2)));
    }

    pub async fn verify_uncommitted_writes_are_dropped(db: Database) {
        {
            let mut dbtx = db.begin_write_transaction().await;
            dbtx.insert_new_entry(&TestKey(9), &TestVal(9)).await;
        }

        let mut dbtx = db.begin_read_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey(9)).await, None);
    }

    pub async fn verify_rollback_to_savepoint(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(20), &TestVal(2000)).await;
        dbtx.set_tx_savepoint()
            .await
            .expect("Error setting transaction savepoint");
        dbtx.insert_new_entry(&TestKey(21), &TestVal(2001)).await;
        assert_eq!(dbtx.get_value(&TestKey(21)).await, Some(TestVal(2001)));

        dbtx.rollback_tx_to_savepoint()
            .await
            .expect("Error rolling back to savepoint");

        assert_eq!(dbtx.get_value(&TestKey(20)).await, Some(TestVal(2000)));
        assert_eq!(dbtx.get_value(&TestKey(21)).await, None);
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_read_transaction().await;
        assert_eq!(dbtx.get_value(&TestKey(20)).await, Some(TestVal(2000)));
        assert_eq!(dbtx.get_value(&TestKey(21)).await, None);
    }

    pub async fn verify_prevent_nonrepeatable_reads(db: Database) {
        let mut reader = db.begin_read_transaction().await;
        assert_eq!(reader.get_value(&TestKey(100)).await, None);

        let mut writer = db.begin_write_transaction().await;
        writer.insert_new_entry(&TestKey(100), &TestVal(101)).await;
        writer.commit_tx().await;

        // still operating over the snapshot taken at creation
        assert_eq!(reader.get_value(&TestKey(100)).await, None);
        assert_eq!(reader.find_by_prefix(&TestKeyPrefix).await.count().await, 0);
    }

    pub async fn verify_phantom_entry(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(100), &TestVal(101)).await;
        dbtx.insert_new_entry(&TestKey(101), &TestVal(102)).await;
        dbtx.commit_tx().await;

        let mut reader = db.begin_read_transaction().await;
        assert_eq!(reader.find_by_prefix(&TestKeyPrefix).await.count().await, 2);

        let mut writer = db.begin_write_transaction().await;
        writer.insert_new_entry(&TestKey(102), &TestVal(103)).await;
        writer.commit_tx().await;

        assert_eq!(reader.find_by_prefix(&TestKeyPrefix).await.count().await, 2);
    }

    pub async fn verify_remove_by_prefix(db: Database) {
        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(100), &TestVal(101)).await;
        dbtx.insert_new_entry(&TestKey(101), &TestVal(102)).await;
        dbtx.insert_new_entry(&AltTestKey(100), &TestVal(103)).await;
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_write_transaction().await;
        dbtx.remove_by_prefix(&TestKeyPrefix).await;
        dbtx.commit_tx().await;

        let mut dbtx = db.begin_read_transaction().await;
        assert_eq!(dbtx.find_by_prefix(&TestKeyPrefix).await.count().await, 0);
        assert_eq!(
            dbtx.get_value(&AltTestKey(100)).await,
            Some(TestVal(103)),
            "other prefixes must survive"
        );
    }

    pub async fn verify_on_commit_hooks(db: Database) {
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let mut dbtx = db.begin_write_transaction().await;
            dbtx.insert_new_entry(&TestKey(1), &TestVal(1)).await;
            let calls = calls.clone();
            dbtx.on_commit(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
            // dropped without commit
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let mut dbtx = db.begin_write_transaction().await;
        dbtx.insert_new_entry(&TestKey(1), &TestVal(1)).await;
        for _ in 0..2 {
            let calls = calls.clone();
            dbtx.on_commit(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        dbtx.commit_tx().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
