use thiserror::Error;

use weft_core::CoreError;

/// Errors surfaced by the stateful client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// No usable access token, or the server hard-logged this session out.
    #[error("login required")]
    LoginRequired,
    /// The server answered with a Matrix error object.
    #[error("{errcode}: {error} (http {http_status})")]
    MatrixApi {
        errcode: String,
        error: String,
        http_status: u16,
        /// Back-off hint from rate-limit responses, when the server sent one.
        retry_after_ms: Option<u64>,
    },
    /// Non-success response without a valid Matrix error body.
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    /// The transport failed before a response was produced.
    #[error("network failure: {0}")]
    Network(String),
    /// A required field was missing or a primitive had the wrong type.
    #[error("decode failure at {path}: {reason}")]
    Decode { path: String, reason: String },
    /// Internal signal consumed by the session retry loop; never surfaces.
    #[error("retry requested")]
    RetryRequested,
    /// The API was used in a way its contract forbids.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A structural invariant was violated.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl ClientError {
    pub(crate) fn decode(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<CoreError> for ClientError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Decode { path, reason } => Self::Decode { path, reason },
            CoreError::InvalidOperation(message) => Self::InvalidOperation(message),
            CoreError::Internal(message) => Self::Internal(message),
        }
    }
}
