//! Turning stored jobs into everything needed to judge them

use groupmsg_logging::LOG_QUEUE;
use prost::Message as _;
use tracing::debug;

use crate::collaborators::GroupStateGateway;
use crate::db::{IncomingGroupJob, JobId};
use crate::proto::{Content, Envelope, GroupContextV2};
use crate::types::{GroupContextInfo, GroupId, ServiceAddress};

/// A job together with what could be derived from it
///
/// Computed fresh on every drain and never stored. A `None` field means that
/// part could not be derived and the job has to be discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub job_id: JobId,
    pub job: IncomingGroupJob,
    pub envelope: Option<Envelope>,
    pub group_context: Option<GroupContextV2>,
    pub group_context_info: Option<GroupContextInfo>,
}

impl JobInfo {
    pub fn sender(&self) -> Option<ServiceAddress> {
        self.envelope.as_ref().and_then(Envelope::source_address)
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        self.group_context_info.as_ref().map(|info| &info.group_id)
    }

    /// Revision the sender's view of the group was at
    pub fn declared_revision(&self) -> Option<u32> {
        self.group_context.as_ref().and_then(|context| context.revision)
    }
}

/// Group context of a decrypted message
///
/// Needs a non-empty plaintext and an envelope that actually carried content.
pub fn group_context_for(envelope: &Envelope, plaintext: Option<&[u8]>) -> Option<GroupContextV2> {
    let plaintext = plaintext.filter(|plaintext| !plaintext.is_empty())?;
    envelope.content.as_ref()?;

    let content = match Content::decode(plaintext) {
        Ok(content) => content,
        Err(err) => {
            debug!(target: LOG_QUEUE, err = %err, "Could not decode message content");
            return None;
        }
    };
    content.group_context().cloned()
}

pub fn is_group_message(envelope: &Envelope, plaintext: Option<&[u8]>) -> bool {
    group_context_for(envelope, plaintext).is_some()
}

/// Derive a [`JobInfo`] from a stored job
///
/// Never fails: whatever cannot be derived is left empty. Calling it twice on
/// the same job gives the same result as long as the gateway does.
pub fn resolve(
    job_id: JobId,
    job: &IncomingGroupJob,
    gateway: &dyn GroupStateGateway,
) -> JobInfo {
    let envelope = match Envelope::decode(job.envelope.as_slice()) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            debug!(target: LOG_QUEUE, %job_id, err = %err, "Could not decode envelope");
            None
        }
    };

    let group_context = envelope
        .as_ref()
        .and_then(|envelope| group_context_for(envelope, job.plaintext.as_deref()));

    let group_context_info = group_context
        .as_ref()
        .and_then(|context| context.master_key.as_deref())
        .and_then(|master_key| match gateway.context_info(master_key) {
            Ok(info) => Some(info),
            Err(err) => {
                debug!(target: LOG_QUEUE, %job_id, err = %err, "Invalid group master key");
                None
            }
        });

    JobInfo {
        job_id,
        job: job.clone(),
        envelope,
        group_context,
        group_context_info,
    }
}
