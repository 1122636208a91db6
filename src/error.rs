//! Error taxonomy shared by the query and ingestion pipelines.
//!
//! Every component maps failures into the narrowest kind it can and
//! re-raises; only the outer request/task boundary converts an error
//! into something user-visible.

use thiserror::Error;

/// Maximum length of an error message persisted on a document record.
pub const MAX_PERSISTED_ERROR_LEN: usize = 500;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the core pipelines.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input from the caller: file type, size, duplicate upload,
    /// malformed query, unknown group. Never retried.
    #[error("invalid input: {0}")]
    InputInvalid(String),

    /// The caller lacks membership in the requested group. Never retried.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Network trouble, timeout, or a 5xx from an upstream service.
    /// Retried with bounded backoff.
    #[error("transient upstream failure: {0}")]
    TransientExternal(String),

    /// A 4xx from an upstream, a malformed response, or extraction that
    /// produced nothing usable. Not retried.
    #[error("permanent upstream failure: {0}")]
    PermanentExternal(String),

    /// Retry budget for a transient failure was exhausted.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A record or object that must exist is missing.
    #[error("data consistency violation: {0}")]
    DataConsistency(String),

    /// Anything unexpected. Caught at the outermost handler only.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a bounded retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientExternal(_))
    }

    /// Consume a transient error into its terminal form once the retry
    /// budget is spent. Other kinds pass through unchanged.
    pub fn into_exhausted(self) -> Error {
        match self {
            Error::TransientExternal(msg) => Error::ServiceUnavailable(msg),
            other => other,
        }
    }

    /// Message truncated for persistence on a document record.
    pub fn persisted_message(&self) -> String {
        truncate_chars(&self.to_string(), MAX_PERSISTED_ERROR_LEN)
    }
}

/// Truncate to at most `max` characters on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return Error::TransientExternal(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return Error::TransientExternal(format!("HTTP {status}: {err}"));
            }
            return Error::PermanentExternal(format!("HTTP {status}: {err}"));
        }
        Error::TransientExternal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::PermanentExternal(format!("malformed payload: {err}"))
    }
}
