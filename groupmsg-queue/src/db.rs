use std::fmt;
use std::io::{Read, Write};
use std::time::SystemTime;

use async_trait::async_trait;
use futures::StreamExt;
use groupmsg_core::db::{
    DatabaseTransaction, IReadDatabaseTransactionOps, IReadDatabaseTransactionOpsTyped,
    IWriteDatabaseTransactionOpsTyped,
};
use groupmsg_core::encoding::{Decodable, DecodeError, Encodable};
use groupmsg_core::{impl_db_lookup, impl_db_record};
use groupmsg_logging::LOG_QUEUE;
use tracing::trace;

use crate::types::GroupId;

#[repr(u8)]
#[derive(Clone, Debug)]
pub enum DbKeyPrefix {
    IncomingGroupJob = 0x20,
    NextJobSequence = 0x21,
}

impl fmt::Display for DbKeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Stable identifier of a queued job
///
/// Jobs sort by `sequence`, which follows arrival order and is never handed
/// out twice, even after the queue ran empty. `nonce` keeps ids of jobs
/// enqueued concurrently on a backend without conflict detection apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId {
    pub sequence: u64,
    pub nonce: u64,
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:016x}", self.sequence, self.nonce)
    }
}

impl Encodable for JobId {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        (self.sequence, self.nonce).consensus_encode(writer)
    }
}

impl Decodable for JobId {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let (sequence, nonce) = <(u64, u64)>::consensus_decode(r)?;
        Ok(JobId { sequence, nonce })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingGroupJobKey(pub JobId);

#[derive(Debug)]
pub struct IncomingGroupJobPrefix;

/// A received group message waiting to be processed
///
/// Stored as soon as the message is decrypted and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingGroupJob {
    pub envelope: Vec<u8>,
    pub plaintext: Option<Vec<u8>>,
    pub group_id: GroupId,
    pub was_sealed_sender: bool,
    pub created_at: SystemTime,
}

impl Encodable for IncomingGroupJobKey {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for IncomingGroupJobKey {
    fn consensus_decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(IncomingGroupJobKey(JobId::consensus_decode(r)?))
    }
}

impl Encodable for IncomingGroupJobPrefix {
    fn consensus_encode<W: Write>(&self, _writer: &mut W) -> std::io::Result<usize> {
        Ok(0)
    }
}

impl Encodable for IncomingGroupJob {
    fn consensus_encode<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        let mut len = 0;
        len += self.envelope.consensus_encode(writer)?;
        len += self.plaintext.consensus_encode(writer)?;
        len += self.group_id.0.consensus_encode(writer)?;
        len += self.was_sealed_sender.consensus_encode(writer)?;
        len += self.created_at.consensus_encode(writer)?;
        Ok(len)
    }
}

impl Decodable for IncomingGroupJob {
    fn consensus_decode_from_finite_reader<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(IncomingGroupJob {
            envelope: Vec::consensus_decode_from_finite_reader(r)?,
            plaintext: Option::consensus_decode_from_finite_reader(r)?,
            group_id: GroupId(Vec::consensus_decode_from_finite_reader(r)?),
            was_sealed_sender: bool::consensus_decode_from_finite_reader(r)?,
            created_at: SystemTime::consensus_decode_from_finite_reader(r)?,
        })
    }
}

impl_db_record!(
    key = IncomingGroupJobKey,
    value = IncomingGroupJob,
    db_prefix = DbKeyPrefix::IncomingGroupJob,
);
impl_db_lookup!(key = IncomingGroupJobKey, query_prefix = IncomingGroupJobPrefix);

/// Sequence the next enqueued job gets
///
/// Every enqueue writes it, so concurrent enqueuers conflict on commit
/// instead of sharing a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextJobSequenceKey;

impl Encodable for NextJobSequenceKey {
    fn consensus_encode<W: Write>(&self, _writer: &mut W) -> std::io::Result<usize> {
        Ok(0)
    }
}

impl Decodable for NextJobSequenceKey {
    fn consensus_decode<R: Read>(_r: &mut R) -> Result<Self, DecodeError> {
        Ok(NextJobSequenceKey)
    }
}

impl_db_record!(
    key = NextJobSequenceKey,
    value = u64,
    db_prefix = DbKeyPrefix::NextJobSequence,
);

/// Read access to the job queue, available on every transaction
#[async_trait]
pub trait IReadJobStore {
    /// Up to `limit` jobs, oldest first
    async fn next_jobs(&mut self, limit: usize) -> Vec<(JobId, IncomingGroupJob)>;

    async fn job_count(&mut self) -> usize;

    async fn has_pending_jobs(&mut self) -> bool;
}

#[async_trait]
impl<T> IReadJobStore for T
where
    T: IReadDatabaseTransactionOps + ?Sized,
{
    async fn next_jobs(&mut self, limit: usize) -> Vec<(JobId, IncomingGroupJob)> {
        self.find_by_prefix(&IncomingGroupJobPrefix)
            .await
            .take(limit)
            .map(|(key, job)| (key.0, job))
            .collect()
            .await
    }

    async fn job_count(&mut self) -> usize {
        self.find_by_prefix(&IncomingGroupJobPrefix)
            .await
            .count()
            .await
    }

    async fn has_pending_jobs(&mut self) -> bool {
        self.find_by_prefix(&IncomingGroupJobPrefix)
            .await
            .next()
            .await
            .is_some()
    }
}

/// Write access to the job queue
#[async_trait]
pub trait IWriteJobStore {
    /// Append a job after every job currently in the queue
    async fn add_job(&mut self, job: &IncomingGroupJob) -> JobId;

    async fn remove_jobs(&mut self, ids: &[JobId]);
}

#[async_trait]
impl IWriteJobStore for DatabaseTransaction<'_> {
    async fn add_job(&mut self, job: &IncomingGroupJob) -> JobId {
        let sequence = self.get_value(&NextJobSequenceKey).await.unwrap_or(0);
        self.insert_entry(&NextJobSequenceKey, &(sequence + 1)).await;
        let id = JobId {
            sequence,
            nonce: rand::random(),
        };

        trace!(target: LOG_QUEUE, job_id = %id, "Adding incoming group job");
        self.insert_new_entry(&IncomingGroupJobKey(id), job).await;
        id
    }

    async fn remove_jobs(&mut self, ids: &[JobId]) {
        for id in ids {
            self.remove_entry(&IncomingGroupJobKey(*id)).await;
        }
    }
}
