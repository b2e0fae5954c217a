//! Deciding whether a resolved job may be delivered

use crate::collaborators::BlockingPolicy;
use crate::resolve::JobInfo;
use crate::types::{GroupSnapshot, ServiceAddress};

/// Why a job gets dropped without delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    MissingEnvelope,
    MissingGroupContext,
    InvalidGroupContext,
    InvalidSender,
    BlockedSender,
    BlockedGroup,
    MissingRevision,
    MissingLocalAddress,
    UnknownGroup,
    LocalUserNotMember,
    SenderNotMember,
}

impl DiscardReason {
    /// The stored job itself is broken, as opposed to being unwanted
    pub fn is_resolution_failure(self) -> bool {
        matches!(
            self,
            DiscardReason::MissingEnvelope
                | DiscardReason::MissingGroupContext
                | DiscardReason::InvalidGroupContext
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::MissingEnvelope => "missing_envelope",
            DiscardReason::MissingGroupContext => "missing_group_context",
            DiscardReason::InvalidGroupContext => "invalid_group_context",
            DiscardReason::InvalidSender => "invalid_sender",
            DiscardReason::BlockedSender => "blocked_sender",
            DiscardReason::BlockedGroup => "blocked_group",
            DiscardReason::MissingRevision => "missing_revision",
            DiscardReason::MissingLocalAddress => "missing_local_address",
            DiscardReason::UnknownGroup => "unknown_group",
            DiscardReason::LocalUserNotMember => "local_user_not_member",
            DiscardReason::SenderNotMember => "sender_not_member",
        }
    }
}

/// Whether membership is checked as part of [`must_discard`]
///
/// Membership is only trustworthy once the local group is up to date, so it
/// is skipped when deciding if an update is needed and enforced right
/// before delivery.
#[derive(Debug, Clone, Copy)]
pub enum MembershipCheck<'a> {
    Skip,
    Enforce {
        local_address: Option<&'a ServiceAddress>,
        local_group: Option<&'a GroupSnapshot>,
    },
}

pub fn must_discard(
    info: &JobInfo,
    blocking: &dyn BlockingPolicy,
    membership: MembershipCheck<'_>,
) -> Option<DiscardReason> {
    if info.envelope.is_none() {
        return Some(DiscardReason::MissingEnvelope);
    }
    let Some(context) = info.group_context.as_ref() else {
        return Some(DiscardReason::MissingGroupContext);
    };
    let Some(group_id) = info.group_id() else {
        return Some(DiscardReason::InvalidGroupContext);
    };

    let Some(sender) = info.sender().filter(ServiceAddress::is_valid) else {
        return Some(DiscardReason::InvalidSender);
    };
    if blocking.is_address_blocked(&sender) {
        return Some(DiscardReason::BlockedSender);
    }
    if blocking.is_group_blocked(group_id) {
        return Some(DiscardReason::BlockedGroup);
    }
    if context.revision.is_none() {
        return Some(DiscardReason::MissingRevision);
    }

    if let MembershipCheck::Enforce {
        local_address,
        local_group,
    } = membership
    {
        let Some(local_address) = local_address else {
            return Some(DiscardReason::MissingLocalAddress);
        };
        let Some(local_group) = local_group else {
            return Some(DiscardReason::UnknownGroup);
        };
        if !local_group.is_non_pending_member(local_address) {
            return Some(DiscardReason::LocalUserNotMember);
        }
        if !local_group.is_non_pending_member(&sender) {
            return Some(DiscardReason::SenderNotMember);
        }
    }

    None
}

/// `true` when the job can go into a batch without updating the group first
///
/// Jobs that are going to be discarded anyway never need an update.
pub fn can_process_without_update(
    info: &JobInfo,
    blocking: &dyn BlockingPolicy,
    local_group: Option<&GroupSnapshot>,
) -> bool {
    if must_discard(info, blocking, MembershipCheck::Skip).is_some() {
        return true;
    }
    match (local_group, info.declared_revision()) {
        (Some(group), Some(declared)) => group.revision >= declared,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::db::{IncomingGroupJob, JobId};
    use crate::proto::{Envelope, GroupContextV2};
    use crate::types::{GroupContextInfo, GroupId, GroupSecretParams};

    #[derive(Debug, Default)]
    struct Blocklist {
        addresses: Vec<ServiceAddress>,
        groups: Vec<GroupId>,
    }

    impl BlockingPolicy for Blocklist {
        fn is_address_blocked(&self, address: &ServiceAddress) -> bool {
            self.addresses.iter().any(|blocked| blocked.matches(address))
        }

        fn is_group_blocked(&self, group_id: &GroupId) -> bool {
            self.groups.contains(group_id)
        }
    }

    fn group_id() -> GroupId {
        GroupId(vec![9; 32])
    }

    fn info(sender: &str, revision: Option<u32>) -> JobInfo {
        JobInfo {
            job_id: JobId {
                sequence: 1,
                nonce: 2,
            },
            job: IncomingGroupJob {
                envelope: vec![],
                plaintext: None,
                group_id: group_id(),
                was_sealed_sender: true,
                created_at: SystemTime::UNIX_EPOCH,
            },
            envelope: Some(Envelope {
                source_uuid: Some(sender.into()),
                content: Some(vec![1]),
                ..Envelope::default()
            }),
            group_context: Some(GroupContextV2 {
                master_key: Some(vec![9; 32]),
                revision,
                group_change: None,
            }),
            group_context_info: Some(GroupContextInfo {
                group_id: group_id(),
                secret_params: GroupSecretParams(vec![]),
            }),
        }
    }

    fn group(revision: u32, members: &[&str]) -> GroupSnapshot {
        GroupSnapshot {
            group_id: group_id(),
            revision,
            members: members
                .iter()
                .map(|member| ServiceAddress::from_uuid(*member))
                .collect(),
            secret_params: GroupSecretParams(vec![]),
        }
    }

    #[test]
    fn resolution_failures_come_first() {
        let blocking = Blocklist::default();

        let mut missing = info("alice", Some(1));
        missing.group_context_info = None;
        assert_eq!(
            must_discard(&missing, &blocking, MembershipCheck::Skip),
            Some(DiscardReason::InvalidGroupContext)
        );
        missing.group_context = None;
        assert_eq!(
            must_discard(&missing, &blocking, MembershipCheck::Skip),
            Some(DiscardReason::MissingGroupContext)
        );
        missing.envelope = None;
        let reason = must_discard(&missing, &blocking, MembershipCheck::Skip);
        assert_eq!(reason, Some(DiscardReason::MissingEnvelope));
        assert!(reason.is_some_and(DiscardReason::is_resolution_failure));
    }

    #[test]
    fn blocked_sender_and_group() {
        let blocking = Blocklist {
            addresses: vec![ServiceAddress::from_uuid("mallory")],
            groups: vec![],
        };
        assert_eq!(
            must_discard(&info("mallory", Some(1)), &blocking, MembershipCheck::Skip),
            Some(DiscardReason::BlockedSender)
        );
        assert_eq!(
            must_discard(&info("alice", Some(1)), &blocking, MembershipCheck::Skip),
            None
        );

        let blocking = Blocklist {
            addresses: vec![],
            groups: vec![group_id()],
        };
        assert_eq!(
            must_discard(&info("alice", Some(1)), &blocking, MembershipCheck::Skip),
            Some(DiscardReason::BlockedGroup)
        );
    }

    #[test]
    fn invalid_sender_and_missing_revision() {
        let blocking = Blocklist::default();
        assert_eq!(
            must_discard(&info("", Some(1)), &blocking, MembershipCheck::Skip),
            Some(DiscardReason::InvalidSender)
        );
        let reason = must_discard(&info("alice", None), &blocking, MembershipCheck::Skip);
        assert_eq!(reason, Some(DiscardReason::MissingRevision));
        assert!(!reason.is_some_and(DiscardReason::is_resolution_failure));
    }

    #[test]
    fn membership_only_when_enforced() {
        let blocking = Blocklist::default();
        let me = ServiceAddress::from_uuid("me");
        let with_both = group(4, &["me", "alice"]);
        let without_sender = group(4, &["me"]);
        let without_me = group(4, &["alice"]);
        let enforce = |local_group| MembershipCheck::Enforce {
            local_address: Some(&me),
            local_group,
        };
        let alice = info("alice", Some(4));

        assert_eq!(must_discard(&alice, &blocking, enforce(Some(&with_both))), None);
        assert_eq!(
            must_discard(&alice, &blocking, enforce(Some(&without_sender))),
            Some(DiscardReason::SenderNotMember)
        );
        assert_eq!(
            must_discard(&alice, &blocking, enforce(Some(&without_me))),
            Some(DiscardReason::LocalUserNotMember)
        );
        assert_eq!(
            must_discard(&alice, &blocking, enforce(None)),
            Some(DiscardReason::UnknownGroup)
        );
        assert_eq!(
            must_discard(
                &alice,
                &blocking,
                MembershipCheck::Enforce {
                    local_address: None,
                    local_group: Some(&with_both),
                }
            ),
            Some(DiscardReason::MissingLocalAddress)
        );
        assert_eq!(must_discard(&alice, &blocking, MembershipCheck::Skip), None);
    }

    #[test]
    fn update_needed_only_when_behind() {
        let blocking = Blocklist::default();
        let local = group(5, &["me", "alice"]);

        for declared in 0..=5 {
            assert!(can_process_without_update(
                &info("alice", Some(declared)),
                &blocking,
                Some(&local)
            ));
        }
        assert!(!can_process_without_update(
            &info("alice", Some(6)),
            &blocking,
            Some(&local)
        ));
        assert!(!can_process_without_update(
            &info("alice", Some(1)),
            &blocking,
            None
        ));
    }

    #[test]
    fn discarded_jobs_never_need_an_update() {
        let blocking = Blocklist {
            addresses: vec![ServiceAddress::from_uuid("mallory")],
            groups: vec![],
        };
        assert!(can_process_without_update(
            &info("mallory", Some(100)),
            &blocking,
            None
        ));
        assert!(can_process_without_update(&info("alice", None), &blocking, None));
    }
}
