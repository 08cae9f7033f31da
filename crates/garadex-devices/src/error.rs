//! Error types for device operations.

use std::time::Duration;

use crate::queue::QueueError;

/// Errors that can occur while driving a device.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device reported an explicit error for a command. The caller
    /// reverts the user-visible target after a short delay.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// A response did not have the expected shape. Logged and treated as
    /// a failed poll or command; never retried automatically.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Transport-level failure (connection, publish, request).
    #[error("transport error: {0}")]
    Transport(String),

    /// A queued unit of work exceeded its hard bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport is not connected.
    #[error("device not connected")]
    NotConnected,

    /// Serialization error building or decoding a payload.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<QueueError> for DeviceError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Timeout(bound) => Self::Timeout(bound),
            QueueError::Closed => Self::NotConnected,
        }
    }
}
