//! Error types for ambientlock.
//!
//! Error handling follows a small set of principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors).
//! - Request failures are delivered through the acquisition future, never
//!   panicked from the request method.
//! - Failures from release callbacks are captured and aggregated; release
//!   proceeds and the aggregate is surfaced through the release future or,
//!   if unobserved there, through the completion signal.

use core::fmt;
use std::sync::Arc;

/// The kind of lock error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was cancelled before the lock was issued.
    Cancelled,
    /// A top-level request arrived after the lock was marked complete.
    Completed,
    /// The operation is not valid in the caller's current lock state.
    InvalidOperation,
    /// One or more release callbacks failed.
    Aggregate,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Completed => ErrorCategory::Lifecycle,
            Self::InvalidOperation => ErrorCategory::Usage,
            Self::Aggregate => ErrorCategory::Callback,
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Cancellation-related failures.
    Cancellation,
    /// Lifecycle failures (requests against a completed lock).
    Lifecycle,
    /// API misuse (escalation from a read, release of a non-held lock,
    /// callback registration without a write lock).
    Usage,
    /// Release-callback failures.
    Callback,
}

/// The main error type for lock operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    related: Vec<Error>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            related: Vec::new(),
        }
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled)
    }

    /// Creates an invalid-operation error with a description.
    #[must_use]
    pub fn invalid_operation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidOperation).with_message(detail)
    }

    /// Creates an aggregate error from individual callback failures.
    ///
    /// The individual errors remain reachable through [`Error::related`].
    #[must_use]
    pub fn aggregate(errors: Vec<Error>) -> Self {
        let message = format!("{} release callback(s) failed", errors.len());
        Self {
            kind: ErrorKind::Aggregate,
            message: Some(message),
            source: None,
            related: errors,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error was caused by lock completion.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.kind, ErrorKind::Completed)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Returns the individual errors inside an aggregate (empty otherwise).
    #[must_use]
    pub fn related(&self) -> &[Error] {
        &self.related
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match self.kind {
            ErrorKind::Cancelled => "lock request cancelled",
            ErrorKind::Completed => "lock has been marked complete",
            ErrorKind::InvalidOperation => "invalid lock operation",
            ErrorKind::Aggregate => "release callback failures",
        };
        match &self.message {
            Some(msg) => write!(f, "{base}: {msg}"),
            None => write!(f, "{base}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}
