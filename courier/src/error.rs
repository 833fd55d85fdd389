//! Control-plane error type.

use std::fmt;
use thiserror::Error;

use crate::ipc::shmem::ShmError;
use crate::protocol::ErrorCode;

/// Result alias for control-plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Kind of driver resource a request referred to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Publication,
    Subscription,
    Counter,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Publication => "publication",
            Self::Subscription => "subscription",
            Self::Counter => "counter",
        })
    }
}

/// Errors raised by the control plane on either side of the CnC boundary.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Channel text could not be parsed or resolved.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
    /// A frame was shorter than its layout or declared an impossible length.
    #[error("malformed command: {0}")]
    MalformedCommand(String),
    /// A request referenced a registration id the driver does not know.
    #[error("unknown {kind}: {registration_id}")]
    ResourceNotFound {
        kind: ResourceKind,
        registration_id: i64,
    },
    /// The driver evicted this client for missing heartbeats.
    #[error("client {client_id} timed out")]
    ClientTimeout { client_id: i64 },
    /// The ring buffer had no room for the record.
    #[error("buffer full")]
    BufferFull,
    /// A broadcast receiver was lapped by the transmitter.
    #[error("data loss: receiver lapped by transmitter")]
    DataLoss,
    /// The request is understood but not supported in this configuration.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// Shared memory setup failed.
    #[error("shared memory error: {0}")]
    Shm(#[from] ShmError),
}

impl ControlError {
    /// Wire error code reported in an `ON_ERROR` frame.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidChannel(_) => ErrorCode::InvalidChannel,
            Self::MalformedCommand(_) => ErrorCode::MalformedCommand,
            Self::ResourceNotFound { kind, .. } => match kind {
                ResourceKind::Publication => ErrorCode::UnknownPublication,
                ResourceKind::Subscription => ErrorCode::UnknownSubscription,
                ResourceKind::Counter => ErrorCode::UnknownCounter,
            },
            Self::ClientTimeout { .. } => ErrorCode::ClientTimeout,
            Self::BufferFull => ErrorCode::ResourceTemporarilyUnavailable,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::DataLoss | Self::Shm(_) => ErrorCode::GenericError,
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedCommand(detail.into())
    }

    pub(crate) fn invalid_channel(detail: impl Into<String>) -> Self {
        Self::InvalidChannel(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_not_found_maps_by_kind() {
        let err = ControlError::ResourceNotFound {
            kind: ResourceKind::Counter,
            registration_id: 7,
        };
        assert_eq!(err.error_code(), ErrorCode::UnknownCounter);
        assert_eq!(err.to_string(), "unknown counter: 7");

        let err = ControlError::ResourceNotFound {
            kind: ResourceKind::Subscription,
            registration_id: 7,
        };
        assert_eq!(err.error_code(), ErrorCode::UnknownSubscription);
    }

    #[test]
    fn resolution_failures_report_invalid_channel() {
        assert_eq!(
            ControlError::invalid_channel("bad").error_code(),
            ErrorCode::InvalidChannel
        );
        assert_eq!(
            ControlError::BufferFull.error_code(),
            ErrorCode::ResourceTemporarilyUnavailable
        );
    }
}
