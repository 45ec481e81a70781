//! Error taxonomy shared by the capture engine and its collaborators

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::PixelFormat;

/// Coarse classification reported through the status snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DeviceUnavailable,
    ConfigurationRejected,
    ReadTimeout,
    DeviceLost,
    StaleFrame,
    BufferEmpty,
    ReconnectBudgetExhausted,
    EncodeFailure,
}

/// Failure to acquire the device or apply the requested capture mode.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// Device does not exist, is busy, or cannot be accessed
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Device exists but refuses the requested mode
    #[error("configuration rejected: {0}")]
    ConfigurationRejected(String),
}

impl OpenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpenError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            OpenError::ConfigurationRejected(_) => ErrorKind::ConfigurationRejected,
        }
    }
}

/// Failure while waiting for a frame on an open session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("device lost: {0}")]
    DeviceLost(String),

    /// The session was closed while the read was pending
    #[error("session closed")]
    Closed,
}

impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReadError::Timeout(_) => ErrorKind::ReadTimeout,
            ReadError::DeviceLost(_) | ReadError::Closed => ErrorKind::DeviceLost,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("unsupported pixel format: {0:?}")]
    Unsupported(PixelFormat),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("jpeg codec error: {0}")]
    Codec(String),
}

impl EncodeError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::EncodeFailure
    }
}

/// Recoverable signals returned to frame consumers.
///
/// Neither variant means the stream is broken; callers skip the tick and
/// poll again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("no frame available yet")]
    BufferEmpty,

    #[error("latest frame is stale ({age:?} old)")]
    StaleFrame { age: Duration },
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::BufferEmpty => ErrorKind::BufferEmpty,
            FrameError::StaleFrame { .. } => ErrorKind::StaleFrame,
        }
    }
}

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectBudgetExhausted { attempts: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] crate::config::ConfigError),

    #[error("capture loop already started")]
    AlreadyStarted,

    #[error("camera manager has shut down")]
    ShutDown,

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ManagerError {
    /// Only an exhausted budget is a capture failure; the rest are caller errors
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ManagerError::ReconnectBudgetExhausted { .. } => Some(ErrorKind::ReconnectBudgetExhausted),
            _ => None,
        }
    }
}

/// Last failure recorded by the capture loop, as exposed in status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&OpenError> for ErrorReport {
    fn from(err: &OpenError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<&ReadError> for ErrorReport {
    fn from(err: &ReadError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<&EncodeError> for ErrorReport {
    fn from(err: &EncodeError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(
            OpenError::DeviceUnavailable("busy".into()).kind(),
            ErrorKind::DeviceUnavailable
        );
        assert_eq!(
            ReadError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::ReadTimeout
        );
        assert_eq!(ReadError::Closed.kind(), ErrorKind::DeviceLost);
        assert_eq!(FrameError::BufferEmpty.kind(), ErrorKind::BufferEmpty);
        assert_eq!(
            ManagerError::ReconnectBudgetExhausted { attempts: 3 }.kind(),
            Some(ErrorKind::ReconnectBudgetExhausted)
        );
        assert_eq!(ManagerError::AlreadyStarted.kind(), None);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ReconnectBudgetExhausted).unwrap();
        assert_eq!(json, "\"reconnect_budget_exhausted\"");
    }
}
