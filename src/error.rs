//! BuddyMirror Error Types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{GroupId, TargetId};

/// Result type alias for BuddyMirror operations
pub type Result<T> = std::result::Result<T, Error>;

/// BuddyMirror error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Sequence window errors
    #[error("Sequence window of buddy group {0} is full")]
    Busy(GroupId),

    #[error("Wait for a sequence number was interrupted")]
    Interrupted,

    #[error("Buddy group {0} has not been assigned a sequence number base yet")]
    NotYetInitialized(GroupId),

    // Topology errors
    #[error("Unknown buddy group: {0}")]
    UnknownGroup(GroupId),

    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),

    #[error("Unknown storage pool: {0}")]
    UnknownPool(u16),

    #[error("Target {target} already belongs to buddy group {group}")]
    TargetInUse { target: TargetId, group: GroupId },

    #[error("Buddy group already exists: {0}")]
    GroupExists(GroupId),

    #[error("Invalid buddy group: {0}")]
    InvalidGroup(String),

    // Mirroring errors
    #[error("Request for the same sequence number is in progress, try again")]
    TryAgain,

    #[error("Operation failed: {0}")]
    Operation(OpsResult),

    // Communication errors
    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Request rejected by peer: {0}")]
    Rejected(OpsResult),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Busy(_)
                | Error::TryAgain
                | Error::ConnectionTimeout(_)
                | Error::Communication(_)
        )
    }

    /// Check if this error means the peer could not be talked to at all
    pub fn is_communication(&self) -> bool {
        matches!(
            self,
            Error::Communication(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Io(_)
        )
    }
}

/// Result codes carried in protocol responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpsResult {
    Success,
    /// Transient condition, the requestor may retry
    Again,
    Inval,
    UnknownTarget,
    UnknownPool,
    InUse,
    Exists,
    NoEntry,
    Communication,
    Internal,
}

impl OpsResult {
    pub fn is_success(self) -> bool {
        self == OpsResult::Success
    }
}

impl std::fmt::Display for OpsResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpsResult::Success => write!(f, "SUCCESS"),
            OpsResult::Again => write!(f, "AGAIN"),
            OpsResult::Inval => write!(f, "INVAL"),
            OpsResult::UnknownTarget => write!(f, "UNKNOWN_TARGET"),
            OpsResult::UnknownPool => write!(f, "UNKNOWN_POOL"),
            OpsResult::InUse => write!(f, "IN_USE"),
            OpsResult::Exists => write!(f, "EXISTS"),
            OpsResult::NoEntry => write!(f, "NO_ENTRY"),
            OpsResult::Communication => write!(f, "COMMUNICATION"),
            OpsResult::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl From<&Error> for OpsResult {
    fn from(e: &Error) -> Self {
        match e {
            Error::Busy(_) | Error::TryAgain | Error::NotYetInitialized(_) => OpsResult::Again,
            Error::UnknownTarget(_) => OpsResult::UnknownTarget,
            Error::UnknownPool(_) => OpsResult::UnknownPool,
            Error::UnknownGroup(_) => OpsResult::NoEntry,
            Error::TargetInUse { .. } => OpsResult::InUse,
            Error::GroupExists(_) => OpsResult::Exists,
            Error::InvalidGroup(_) | Error::Config(_) | Error::ConfigParse(_) => OpsResult::Inval,
            Error::Operation(res) | Error::Rejected(res) => *res,
            Error::Communication(_)
            | Error::ConnectionFailed { .. }
            | Error::ConnectionTimeout(_) => OpsResult::Communication,
            _ => OpsResult::Internal,
        }
    }
}
