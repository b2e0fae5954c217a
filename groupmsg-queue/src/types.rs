use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of a valid group identifier
pub const GROUP_ID_LEN: usize = 32;

/// The address of an account, by service id and/or phone number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub uuid: Option<String>,
    pub e164: Option<String>,
}

impl ServiceAddress {
    pub fn from_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: Some(uuid.into()),
            e164: None,
        }
    }

    /// At least one non-empty identifier, and the phone number (if any) in
    /// `+<digits>` form
    pub fn is_valid(&self) -> bool {
        let uuid_ok = self.uuid.as_deref().is_some_and(|uuid| !uuid.is_empty());
        let e164_ok = self.e164.as_deref().is_some_and(|e164| {
            e164.len() > 1
                && e164.starts_with('+')
                && e164[1..].bytes().all(|b| b.is_ascii_digit())
        });
        match (&self.uuid, &self.e164) {
            (None, None) => false,
            (Some(_), None) => uuid_ok,
            (None, Some(_)) => e164_ok,
            (Some(_), Some(_)) => uuid_ok && e164_ok,
        }
    }

    /// Same account: uuids match when both have one, phone numbers otherwise
    pub fn matches(&self, other: &ServiceAddress) -> bool {
        match (&self.uuid, &other.uuid) {
            (Some(a), Some(b)) => a == b,
            _ => matches!((&self.e164, &other.e164), (Some(a), Some(b)) if a == b),
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.uuid, &self.e164) {
            (Some(uuid), _) => f.write_str(uuid),
            (None, Some(e164)) => f.write_str(e164),
            (None, None) => f.write_str("<unknown>"),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub Vec<u8>);

impl GroupId {
    pub fn is_valid(&self) -> bool {
        self.0.len() == GROUP_ID_LEN
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", hex::encode(&self.0))
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Key material derived from a group master key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSecretParams(pub Vec<u8>);

impl fmt::Debug for GroupSecretParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupSecretParams(<redacted>)")
    }
}

/// Canonical identity of a group, derived from its master key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupContextInfo {
    pub group_id: GroupId,
    pub secret_params: GroupSecretParams,
}

/// The locally known state of a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group_id: GroupId,
    pub revision: u32,
    /// Full members; invited members are not included
    pub members: Vec<ServiceAddress>,
    pub secret_params: GroupSecretParams,
}

impl GroupSnapshot {
    pub fn is_non_pending_member(&self, address: &ServiceAddress) -> bool {
        self.members.iter().any(|member| member.matches(address))
    }
}

/// A group change whose signature was checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedGroupChange {
    /// Revision the group is at once the change is applied
    pub revision: u32,
    pub actions: Vec<u8>,
}
