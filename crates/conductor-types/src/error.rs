//! Error taxonomy for the Conductor core.
//!
//! The core surfaces a single tagged error type, `CoreError`, whose
//! `ErrorKind` drives both retry decisions (only `Transient` is retried)
//! and HTTP status mapping in the API layer. A wrapped cause is carried
//! for debug logs but never surfaced to clients.

use std::fmt;

use thiserror::Error;

/// The kind of a core error. Drives retry and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The referenced entity does not exist.
    NotFound,
    /// An entity with the same identity already exists.
    AlreadyExists,
    /// The request was syntactically or semantically malformed.
    InvalidInput,
    /// A submitted workflow failed validation (never becomes a run record).
    ValidationFailed,
    /// Missing or invalid credentials.
    Unauthorized,
    /// The caller is authenticated but not allowed. At the endpoint plane
    /// this is surfaced as `NotFound` to avoid disclosing existence.
    Forbidden,
    /// A rate limit denied the request.
    RateLimited,
    /// The service is draining and not admitting new work.
    Draining,
    /// The admission queue is bounded and full.
    CapacityExhausted,
    /// The run is already terminal and cannot be cancelled.
    NotCancellable,
    /// An operation exceeded its deadline.
    Timeout,
    /// The operation was cancelled.
    Cancelled,
    /// A retryable I/O failure in the storage layer.
    Transient,
    /// An unrecoverable failure (schema mismatch, corruption).
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::ValidationFailed => "validation failed",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::Draining => "draining",
            ErrorKind::CapacityExhausted => "capacity exhausted",
            ErrorKind::NotCancellable => "not cancellable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Transient => "transient",
            ErrorKind::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// Tagged error carried through the Conductor core.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct CoreError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    /// Build an error of the given kind with a short message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach the underlying cause (kept for debug logs only).
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether callers should retry this error.
    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationFailed, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn draining(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Draining, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CapacityExhausted, message)
    }

    pub fn not_cancellable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotCancellable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

/// Convenience alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_kind_and_message() {
        let err = CoreError::not_found("run 'abc' not found");
        assert_eq!(err.to_string(), "not found: run 'abc' not found");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(CoreError::transient("io").is_transient());
        assert!(!CoreError::fatal("corrupt").is_transient());
        assert!(!CoreError::not_found("x").is_transient());
    }

    #[test]
    fn test_source_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = CoreError::transient("write failed").with_source(io);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_kind_display_strings() {
        assert_eq!(ErrorKind::CapacityExhausted.to_string(), "capacity exhausted");
        assert_eq!(ErrorKind::NotCancellable.to_string(), "not cancellable");
        assert_eq!(ErrorKind::RateLimited.to_string(), "rate limited");
    }
}
