use std::fmt;

use thiserror::Error;

use crate::types::{QueueEntryId, ResourceId, ResourceKind};

/// Errors raised by a resource store or webhook queue backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    #[error("queue entry not found: {0}")]
    EntryNotFound(QueueEntryId),

    #[error("status belongs to a {expected:?} but {id} is not one")]
    KindMismatch { id: ResourceId, expected: ResourceKind },

    /// Stored data could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// The backend itself failed (connection, query, ...).
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors returned by `Simulator::schedule_lifecycle`.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The lifecycle for this resource was already scheduled by this process.
    #[error("lifecycle already scheduled for {0}")]
    AlreadyScheduled(ResourceId),

    /// The simulator has been shut down.
    #[error("simulator is shut down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a destination URL was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed url: {0}")]
    Malformed(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("url has no host")]
    MissingHost,

    /// Host is, or resolves to, a loopback/link-local/private address.
    #[error("blocked host: {0}")]
    BlockedHost(String),
}

/// Final outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Refused before any network attempt.
    Rejected(ValidationError),
    Failed(FailureReason),
}

/// Reasons why an HTTP delivery attempt failed. All of them are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Network,
    /// Destination answered with a non-2xx status.
    RemoteStatus(u16),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::RemoteStatus(code) =>
                write!(f, "remote endpoint returned {}", code),
        }
    }
}
