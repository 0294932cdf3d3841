//! Update engine errors.

use std::fmt;

use thiserror::Error;

use crate::payload::ContainerError;
use crate::transport::LinkError;

/// Coarse classification of every failure an update run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed container: signature, version, alignment or termination.
    Format,
    /// CRC mismatch.
    Integrity,
    /// Module name outside the allowed set.
    Validation,
    /// Unexpected, absent or malformed device response.
    Protocol,
    /// No matching response within the deadline.
    Timeout,
    /// Device reports a state the run cannot proceed from.
    DeviceState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Format => write!(f, "format"),
            ErrorKind::Integrity => write!(f, "integrity"),
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::DeviceState => write!(f, "device state"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout after {timeout_ms}ms waiting for \"{marker}\"")]
    Timeout { marker: String, timeout_ms: u64 },

    #[error("Device state error: {0}")]
    DeviceState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Link error: {0}")]
    Link(LinkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinkError> for UpdateError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout { marker, timeout_ms } => UpdateError::Timeout { marker, timeout_ms },
            other => UpdateError::Link(other),
        }
    }
}

impl UpdateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Container(e) => e.kind(),
            UpdateError::Protocol(_) | UpdateError::Link(_) => ErrorKind::Protocol,
            UpdateError::Timeout { .. } => ErrorKind::Timeout,
            UpdateError::DeviceState(_) => ErrorKind::DeviceState,
            UpdateError::Validation(_) => ErrorKind::Validation,
            UpdateError::Integrity(_) => ErrorKind::Integrity,
            // Payload reload failures: the image changed or vanished mid run.
            UpdateError::Io(_) => ErrorKind::Format,
        }
    }
}

impl ContainerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::Header(_)
            | ContainerError::Truncated(_)
            | ContainerError::Io(_) => ErrorKind::Format,
            ContainerError::ModuleCrcMismatch { .. } => ErrorKind::Integrity,
            ContainerError::UnknownModule(_) => ErrorKind::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HeaderError;

    #[test]
    fn test_link_timeout_maps_to_timeout_kind() {
        let err: UpdateError = LinkError::Timeout {
            marker: "validation ok".into(),
            timeout_ms: 3000,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("validation ok"));

        let err: UpdateError = LinkError::ReaderStopped.into();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_container_kinds() {
        let err: UpdateError = ContainerError::UnknownModule("EVIL".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err: UpdateError = ContainerError::ModuleCrcMismatch {
            module: "OPFW".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Integrity);

        let err: UpdateError = ContainerError::Header(HeaderError::UnsupportedVersion(0x0200)).into();
        assert_eq!(err.kind(), ErrorKind::Format);
    }
}
