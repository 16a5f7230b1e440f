// src/error.rs

//! Crate-wide error type and result alias
//!
//! Error variants are grouped by how the pipeline reacts to them:
//! transient resource and authentication problems are retried in place,
//! integrity and invariant failures abort the run immediately, and
//! everything else is fatal for the current phase.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A resource was busy or temporarily unavailable (mount contention,
    /// device mid-enumeration, another run holding the lock)
    #[error("transient resource error: {0}")]
    TransientResource(String),

    /// The hardware token was absent, unreadable, or produced a garbled
    /// session (wrong keystream output)
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Structured input did not match its documented format
    #[error("format error: {0}")]
    Format(String),

    /// A checksum that must match after transformation did not
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// An external tool exited nonzero or timed out
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    /// An internal invariant was violated; the run cannot continue safely
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The requested operation is recognized but deliberately not handled
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The run was cancelled cooperatively
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Extraction cache bookkeeping failed
    #[error("cache error: {0}")]
    Cache(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the pipeline may retry the failing phase in place.
    ///
    /// Format errors count as retryable because a garbled file list is a
    /// symptom of a failed token session, not a broken input file.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransientResource(_) | Error::Authentication(_) | Error::Format(_)
        )
    }
}
