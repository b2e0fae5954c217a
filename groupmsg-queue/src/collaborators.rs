//! Interfaces of everything the queue relies on but does not own
//!
//! All of them are injected into [`crate::GroupMessageProcessor`] at
//! construction through [`QueueCollaborators`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use groupmsg_core::db::DatabaseTransaction;

use crate::db::JobId;
use crate::error::GroupsError;
use crate::proto::Envelope;
use crate::types::{
    GroupContextInfo, GroupId, GroupSecretParams, GroupSnapshot, ServiceAddress,
    VerifiedGroupChange,
};

/// Access to local group state and the group service
#[async_trait]
pub trait GroupStateGateway: fmt::Debug + Send + Sync {
    /// Derive the canonical identity of a group from its master key
    fn context_info(&self, master_key: &[u8]) -> Result<GroupContextInfo, GroupsError>;

    /// The locally stored state of a group, if it is known at all
    async fn local_group(&self, group_id: &GroupId) -> Option<GroupSnapshot>;

    /// Parse a signed group change and check its signature
    async fn parse_and_verify_change(
        &self,
        change: &[u8],
    ) -> Result<VerifiedGroupChange, GroupsError>;

    /// Apply a verified change to the local group, returning the new state
    async fn apply_change(
        &self,
        group_id: &GroupId,
        secret_params: &GroupSecretParams,
        change: VerifiedGroupChange,
    ) -> Result<GroupSnapshot, GroupsError>;

    /// Fetch the group from the service until it is at least at `revision`
    async fn refresh_to_revision(
        &self,
        group_id: &GroupId,
        secret_params: &GroupSecretParams,
        revision: u32,
    ) -> Result<GroupSnapshot, GroupsError>;
}

/// A job that passed every check and is ready to be applied locally
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job_id: JobId,
    pub envelope: Envelope,
    pub plaintext: Option<Vec<u8>>,
    pub group_id: GroupId,
    pub was_sealed_sender: bool,
}

/// Final consumer of processed messages
///
/// Writes go through `dbtx` so they commit atomically with the removal of
/// the job. An error rolls back whatever the sink wrote for this delivery.
#[async_trait]
pub trait DeliverySink: fmt::Debug + Send + Sync {
    async fn deliver(
        &self,
        dbtx: &mut DatabaseTransaction<'_>,
        delivery: &Delivery,
    ) -> anyhow::Result<()>;
}

/// User visible reporting of messages that could not be read
#[async_trait]
pub trait ErrorNotifier: fmt::Debug + Send + Sync {
    async fn notify_corrupted_message(&self, dbtx: &mut DatabaseTransaction<'_>);
}

pub trait BlockingPolicy: fmt::Debug + Send + Sync {
    fn is_address_blocked(&self, address: &ServiceAddress) -> bool;

    fn is_group_blocked(&self, group_id: &GroupId) -> bool;
}

/// State of the application hosting the queue
pub trait HostState: fmt::Debug + Send + Sync {
    fn is_registered_and_ready(&self) -> bool;

    /// `false` while another process owns message handling
    fn should_process_incoming_messages(&self) -> bool;

    /// Address of the local account, once registered
    fn local_address(&self) -> Option<ServiceAddress>;
}

#[derive(Debug, Clone)]
pub struct QueueCollaborators {
    pub gateway: Arc<dyn GroupStateGateway>,
    pub sink: Arc<dyn DeliverySink>,
    pub notifier: Arc<dyn ErrorNotifier>,
    pub blocking: Arc<dyn BlockingPolicy>,
    pub host: Arc<dyn HostState>,
}
