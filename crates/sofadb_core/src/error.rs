//! Error kinds shared across the workspace.

use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors carried through the core.
///
/// Every kind maps to an HTTP-ish status via [`Error::status`], which is
/// what transport adapters put on the wire. User-script exceptions are not
/// represented here: they are logged and swallowed per-document.
#[derive(Debug, Error)]
pub enum Error {
    /// Document, view, attachment or revision does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Update against a revision that is not a current leaf.
    #[error("document update conflict")]
    Conflict,

    /// Invalid option value, body or selector.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Rejected by a validate function throwing `{unauthorized: ...}`.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Rejected by a validate function throwing `{forbidden: ...}`.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The underlying store was unreachable across a transport boundary.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Unexpected storage or sandbox infrastructure failure.
    #[error("internal: {0}")]
    Internal(String),

    /// The request context was cancelled or its deadline passed.
    #[error("request cancelled")]
    Cancelled,

    /// Read from an iterator after close.
    #[error("iterator closed")]
    IteratorClosed,

    /// SQLite-level failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Malformed JSON in a request body.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Sandbox infrastructure failure (not a user-script exception).
    #[error(transparent)]
    Script(#[from] sofadb_script::ScriptError),
}

impl Error {
    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a bad-request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status a transport layer should use for this error.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict => 409,
            Self::BadRequest(_) | Self::Json(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::Forbidden(_) => 403,
            Self::BadGateway(_) => 502,
            Self::Internal(_) | Self::Storage(_) | Self::Script(_) | Self::IteratorClosed => 500,
            Self::Cancelled => 499,
        }
    }

    /// Whether the error is the not-found kind.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Error::not_found("doc").status(), 404);
        assert_eq!(Error::Conflict.status(), 409);
        assert_eq!(Error::bad_request("nope").status(), 400);
        assert_eq!(Error::Cancelled.status(), 499);
        assert_eq!(Error::IteratorClosed.status(), 500);
    }

    #[test]
    fn display_includes_message() {
        let err = Error::bad_request("invalid value for 'update'");
        assert_eq!(err.to_string(), "bad request: invalid value for 'update'");
    }
}
