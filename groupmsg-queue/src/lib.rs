//! Durable queue for incoming group messages
//!
//! Decrypted group messages are stored as jobs in the caller's database
//! transaction before anything else happens to them. A single worker then
//! drains the queue oldest first. Jobs whose group is known locally at the
//! revision they were sent at are delivered in batches; a job that is ahead
//! of the local group first brings the group up to date through
//! [`reconcile::UpdateReconciler`], on its own.
//!
//! Everything outside the queue (group state, delivery, blocking, the host
//! application) is reached through the traits in [`collaborators`].

pub mod collaborators;
pub mod config;
pub mod db;
pub mod eligibility;
pub mod error;
mod metrics;
mod processor;
pub mod proto;
pub mod reconcile;
pub mod resolve;
pub mod types;

pub use collaborators::{
    BlockingPolicy, Delivery, DeliverySink, ErrorNotifier, GroupStateGateway, HostState,
    QueueCollaborators,
};
pub use config::QueueConfig;
pub use db::{IReadJobStore, IWriteJobStore, IncomingGroupJob, JobId};
pub use error::{EnqueueError, GroupsError};
pub use processor::{DrainState, DrainTrigger, GroupMessageProcessor, QueueEvent};
pub use reconcile::UpdateOutcome;
