//! Error Types
//!
//! Two families live here. `ResultCode` is the expected traffic a caller gets
//! back (contention, not-found, pending work) and is never raised as an error.
//! `DirectorError` is for hard failures: lock discipline bugs, store corruption,
//! collaborators that are not wired up.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::locks::LockError;
use crate::ports::PortError;
use crate::store::StoreError;

/// Status code carried by every public outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultCode {
    Success,
    /// Async work was started (or a queue slot taken); poll for the result.
    Pending,
    /// Someone already holds the queue slot, or the caller owns the resource.
    QueueFull,
    /// No resource could be claimed or queued for.
    ClusterFull,
    NotFound,
    /// An operation of the same kind on the same target is still running.
    AlreadyInProgress,
    Cancelled,
    GenericFail,
    Timeout,
    /// The desired state already holds, nothing was done.
    NoActionNeeded,
    BadRequest,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::Pending => "pending",
            ResultCode::QueueFull => "queueFull",
            ResultCode::ClusterFull => "clusterFull",
            ResultCode::NotFound => "notFound",
            ResultCode::AlreadyInProgress => "alreadyInProgress",
            ResultCode::Cancelled => "cancelled",
            ResultCode::GenericFail => "genericFail",
            ResultCode::Timeout => "timeout",
            ResultCode::NoActionNeeded => "noActionNeeded",
            ResultCode::BadRequest => "badRequest",
        }
    }

    /// Anything other than `Pending` means the operation will not change again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResultCode::Pending)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which kind of access a caller attempted on a record section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug)]
pub enum DirectorError {
    Store(StoreError),
    Lock(LockError),
    Port(PortError),
    /// No record exists under that key.
    NotFound(String),
    /// A section was touched without the matching grant. Always a bug.
    LockViolation {
        resource: String,
        section: &'static str,
        access: Access,
    },
    /// The resource is in the middle of a transition that forbids this access.
    AccessDenied { resource: String, reason: String },
    InvalidRequest(String),
    /// A background worker could not be started or died.
    Worker(String),
}

impl fmt::Display for DirectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectorError::Store(err) => write!(f, "Store error: {}", err),
            DirectorError::Lock(err) => write!(f, "Lock error: {}", err),
            DirectorError::Port(err) => write!(f, "Port error: {}", err),
            DirectorError::NotFound(key) => write!(f, "Resource not found: {}", key),
            DirectorError::LockViolation {
                resource,
                section,
                access,
            } => write!(
                f,
                "Lock violation: {} access to '{}' of {} without a grant",
                access, section, resource
            ),
            DirectorError::AccessDenied { resource, reason } => {
                write!(f, "Access to {} denied: {}", resource, reason)
            }
            DirectorError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            DirectorError::Worker(msg) => write!(f, "Worker error: {}", msg),
        }
    }
}

impl std::error::Error for DirectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DirectorError::Store(err) => Some(err),
            DirectorError::Lock(err) => Some(err),
            DirectorError::Port(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for DirectorError {
    fn from(err: StoreError) -> Self {
        DirectorError::Store(err)
    }
}

impl From<LockError> for DirectorError {
    fn from(err: LockError) -> Self {
        DirectorError::Lock(err)
    }
}

impl From<PortError> for DirectorError {
    fn from(err: PortError) -> Self {
        DirectorError::Port(err)
    }
}

pub type Result<T> = std::result::Result<T, DirectorError>;
