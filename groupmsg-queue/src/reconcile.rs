//! Bringing the local group up to the revision a message was sent at
//!
//! A job whose declared revision is ahead of the local group goes through
//! [`UpdateReconciler::reconcile`] on its own. The reconciler first tries the
//! group change embedded in the message, which only works when the message
//! is exactly one revision ahead, and falls back to fetching the group from
//! the service otherwise.

use std::sync::Arc;

use groupmsg_logging::LOG_QUEUE_UPDATE;
use tracing::{debug, info, warn};

use crate::collaborators::GroupStateGateway;
use crate::error::GroupsError;
use crate::metrics::QUEUE_GROUP_UPDATE_OUTCOMES_TOTAL;
use crate::resolve::JobInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The group is current, deliver the job
    SuccessShouldProcess,
    /// Drop the job without delivering or notifying
    FailureShouldDiscard,
    /// Keep the job and try again after a delay
    FailureShouldRetry,
}

impl UpdateOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateOutcome::SuccessShouldProcess => "success",
            UpdateOutcome::FailureShouldDiscard => "discard",
            UpdateOutcome::FailureShouldRetry => "retry",
        }
    }
}

/// Result of the embedded change attempt
///
/// Failing over is internal to the reconciler, callers only ever see an
/// [`UpdateOutcome`].
enum EmbeddedAttempt {
    Done(UpdateOutcome),
    FailoverToService,
}

#[derive(Debug, Clone)]
pub struct UpdateReconciler {
    gateway: Arc<dyn GroupStateGateway>,
    apply_embedded_changes: bool,
}

impl UpdateReconciler {
    pub fn new(gateway: Arc<dyn GroupStateGateway>, apply_embedded_changes: bool) -> Self {
        Self {
            gateway,
            apply_embedded_changes,
        }
    }

    pub async fn reconcile(&self, info: &JobInfo) -> UpdateOutcome {
        let outcome = match self.try_embedded_change(info).await {
            EmbeddedAttempt::Done(outcome) => outcome,
            EmbeddedAttempt::FailoverToService => {
                debug!(
                    target: LOG_QUEUE_UPDATE,
                    job_id = %info.job_id,
                    "Failing over to group service"
                );
                self.refresh_from_service(info).await
            }
        };

        QUEUE_GROUP_UPDATE_OUTCOMES_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        debug!(
            target: LOG_QUEUE_UPDATE,
            job_id = %info.job_id,
            outcome = outcome.as_str(),
            "Group update finished"
        );
        outcome
    }

    async fn try_embedded_change(&self, info: &JobInfo) -> EmbeddedAttempt {
        let (Some(context), Some(context_info)) = (&info.group_context, &info.group_context_info)
        else {
            return EmbeddedAttempt::Done(UpdateOutcome::FailureShouldDiscard);
        };
        let group_id = &context_info.group_id;
        if !group_id.is_valid() {
            warn!(target: LOG_QUEUE_UPDATE, %group_id, "Invalid group id");
            return EmbeddedAttempt::Done(UpdateOutcome::FailureShouldDiscard);
        }

        let Some(local_group) = self.gateway.local_group(group_id).await else {
            return EmbeddedAttempt::FailoverToService;
        };
        let Some(declared) = context.revision else {
            return EmbeddedAttempt::Done(UpdateOutcome::FailureShouldDiscard);
        };
        if declared <= local_group.revision {
            debug!(
                target: LOG_QUEUE_UPDATE,
                declared,
                local = local_group.revision,
                "Group already up to date"
            );
            return EmbeddedAttempt::Done(UpdateOutcome::SuccessShouldProcess);
        }
        if local_group.revision.checked_add(1) != Some(declared) {
            debug!(
                target: LOG_QUEUE_UPDATE,
                declared,
                local = local_group.revision,
                "Revision gap, embedded change not applicable"
            );
            return EmbeddedAttempt::FailoverToService;
        }
        if !self.apply_embedded_changes {
            return EmbeddedAttempt::FailoverToService;
        }
        let Some(change_bytes) = context.group_change.as_deref() else {
            return EmbeddedAttempt::FailoverToService;
        };

        let change = match self.gateway.parse_and_verify_change(change_bytes).await {
            Ok(change) => change,
            Err(err) => return embedded_failure(&err),
        };
        if change.revision != declared {
            let err = GroupsError::InvalidChange(format!(
                "change is for revision {}, message declares {declared}",
                change.revision
            ));
            return embedded_failure(&err);
        }

        let updated = match self
            .gateway
            .apply_change(group_id, &local_group.secret_params, change)
            .await
        {
            Ok(updated) => updated,
            Err(err) => return embedded_failure(&err),
        };

        if updated.revision < declared {
            warn!(
                target: LOG_QUEUE_UPDATE,
                declared,
                landed = updated.revision,
                "Embedded change did not reach the declared revision"
            );
            EmbeddedAttempt::FailoverToService
        } else if updated.revision > declared {
            warn!(
                target: LOG_QUEUE_UPDATE,
                declared,
                landed = updated.revision,
                "Embedded change overshot the declared revision"
            );
            EmbeddedAttempt::Done(UpdateOutcome::SuccessShouldProcess)
        } else {
            info!(
                target: LOG_QUEUE_UPDATE,
                %group_id,
                revision = declared,
                "Applied embedded group change"
            );
            EmbeddedAttempt::Done(UpdateOutcome::SuccessShouldProcess)
        }
    }

    async fn refresh_from_service(&self, info: &JobInfo) -> UpdateOutcome {
        let (Some(context_info), Some(declared)) =
            (&info.group_context_info, info.declared_revision())
        else {
            return UpdateOutcome::FailureShouldDiscard;
        };

        match self
            .gateway
            .refresh_to_revision(&context_info.group_id, &context_info.secret_params, declared)
            .await
        {
            Ok(group) => {
                debug!(
                    target: LOG_QUEUE_UPDATE,
                    group_id = %context_info.group_id,
                    revision = group.revision,
                    "Refreshed group from service"
                );
                UpdateOutcome::SuccessShouldProcess
            }
            Err(err) if err.is_retryable() => {
                warn!(target: LOG_QUEUE_UPDATE, err = %err, "Group refresh failed, will retry");
                UpdateOutcome::FailureShouldRetry
            }
            Err(err) => {
                info!(target: LOG_QUEUE_UPDATE, err = %err, "Group refresh failed permanently");
                UpdateOutcome::FailureShouldDiscard
            }
        }
    }
}

fn embedded_failure(err: &GroupsError) -> EmbeddedAttempt {
    if err.is_retryable() {
        warn!(target: LOG_QUEUE_UPDATE, err = %err, "Embedded group change failed, will retry");
        EmbeddedAttempt::Done(UpdateOutcome::FailureShouldRetry)
    } else {
        warn!(target: LOG_QUEUE_UPDATE, err = %err, "Embedded group change rejected");
        EmbeddedAttempt::FailoverToService
    }
}
