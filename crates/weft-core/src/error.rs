use thiserror::Error;

/// Errors produced by the pure protocol layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A required field was missing or a primitive had the wrong type.
    #[error("decode failure at {path}: {reason}")]
    Decode { path: String, reason: String },
    /// The API was used in a way its contract forbids.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    /// A structural invariant was violated.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl CoreError {
    /// Construct a decode failure with a JSON-path-ish location.
    pub fn decode(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Decode {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
