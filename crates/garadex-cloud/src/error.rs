//! Error types for cloud account operations.

use thiserror::Error;

/// Errors that can occur when talking to the cloud account API.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A network fault another attempt could recover from.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The server answered with a body we could not make sense of.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Any other HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// An authenticated endpoint was used before [`login`] succeeded.
    ///
    /// [`login`]: crate::CloudSession::login
    #[error("not authenticated")]
    NotAuthenticated,
}

/// Result type for cloud session operations.
pub type CloudResult<T> = Result<T, CloudError>;
