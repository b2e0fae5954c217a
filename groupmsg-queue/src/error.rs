use thiserror::Error;

/// Failures reported by the group state collaborator
#[derive(Debug, Error)]
pub enum GroupsError {
    #[error("Network connectivity failure: {0}")]
    Network(String),
    #[error("Group service responded with HTTP status {status}")]
    HttpStatus { status: u16 },
    #[error("Group service request timed out")]
    Timeout,
    #[error("Group operation should be retried")]
    ShouldRetry,
    #[error("Group message should be discarded")]
    ShouldDiscard,
    #[error("Group change has an invalid signature")]
    InvalidSignature,
    #[error("Group change is invalid: {0}")]
    InvalidChange(String),
    #[error("Group is not known")]
    UnknownGroup,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GroupsError {
    /// Whether trying again later can succeed
    ///
    /// Connectivity failures, HTTP 401, any 5xx and explicit timeout/retry
    /// errors are transient. Everything else is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            GroupsError::Network(_) | GroupsError::Timeout | GroupsError::ShouldRetry => true,
            GroupsError::HttpStatus { status } => *status == 401 || (500..=599).contains(status),
            GroupsError::ShouldDiscard
            | GroupsError::InvalidSignature
            | GroupsError::InvalidChange(_)
            | GroupsError::UnknownGroup
            | GroupsError::Other(_) => false,
        }
    }
}

/// Why a message could not be added to the queue
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("Envelope is empty")]
    EmptyEnvelope,
    #[error("Envelope could not be decoded: {0}")]
    MalformedEnvelope(#[from] prost::DecodeError),
    #[error("Message carries no group context")]
    NotAGroupMessage,
    #[error("Group context is invalid: {0}")]
    InvalidGroupContext(#[source] GroupsError),
}
