//! Error handling for the reconciliation engine
//!
//! Defines the fatal error taxonomy and establishes a unified Result type
//! using anyhow for context chaining and error propagation.

use thiserror::Error;

/// Fatal error kinds for a reconciliation run.
///
/// Anything not covered here (unmapped accounts, unmatched tickers,
/// unparsable rows) is non-fatal and surfaces through the run report
/// instead of aborting the run.
#[derive(Error, Debug)]
pub enum ReconcileError {
    /// No CSV matched the naming convention, or the template key is absent.
    #[error("input not found: {0}")]
    InputNotFound(String),

    /// The CSV is missing required headers or has no parseable rows at all.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The template bytes cannot be opened as a workbook.
    #[error("template unreadable: {0}")]
    TemplateUnreadable(String),

    /// The storage collaborator failed on a read or write.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Result type alias for reconciliation operations
pub type Result<T> = anyhow::Result<T>;

/// Classify an error chain by its fatal kind, if any.
///
/// Callers (transports) use this to distinguish retryable storage failures
/// from bad-input failures without string matching.
pub fn fatal_kind(err: &anyhow::Error) -> Option<&ReconcileError> {
    err.downcast_ref::<ReconcileError>()
}
