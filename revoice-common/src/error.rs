//! Common error types for Revoice

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for Revoice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared across the retargeting core.
///
/// Every failure a job can surface maps onto one of these variants; the
/// persisted `failure_reason` is derived via [`Error::reason_code`] so
/// clients see short stable strings rather than debug output.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested record does not exist in the job store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record exists but is not in a state the operation accepts
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// An external process (transcoder, separator) exited abnormally
    #[error("{component} failed: {stderr_tail}")]
    ExternalToolFailed {
        component: String,
        /// Last portion of the process stderr, for diagnostics
        stderr_tail: String,
    },

    /// A synthesis request failed after component-level retries
    #[error("TTS request {request_index} failed (status: {upstream_status:?}, retryable: {retryable})")]
    TtsFailed {
        request_index: usize,
        retryable: bool,
        upstream_status: Option<u16>,
    },

    /// Blob store rejected or dropped the final artifact
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// A produced file is missing, not a regular file, or empty
    #[error("Invalid artifact {path}: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },

    /// An external call exceeded its wall-clock deadline
    #[error("{component} timed out")]
    Timeout { component: String },

    /// Job was cancelled at a checkpoint
    #[error("Cancelled")]
    Cancelled,

    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short stable string persisted as the job's failure reason.
    ///
    /// Intentionally free of paths, indices and stack traces; the full
    /// detail goes to the log, not the status row.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NotFound",
            Error::PreconditionFailed(_) => "PreconditionFailed",
            Error::ExternalToolFailed { .. } => "ExternalToolFailed",
            Error::TtsFailed { .. } => "TTSFailed",
            Error::UploadFailed(_) => "UploadFailed",
            Error::InvalidArtifact { .. } => "InvalidArtifact",
            Error::Timeout { .. } => "Timeout",
            Error::Cancelled => "Cancelled",
            #[cfg(feature = "sqlx")]
            Error::Database(_) => "Database",
            Error::Io(_) => "IO",
            Error::Config(_) => "Config",
            Error::Internal(_) => "Internal",
        }
    }

    /// Whether the queue runtime may re-attempt a job that failed with
    /// this error. Terminal classifications abort immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Intake rejections and bad artifacts will not heal on retry
            Error::NotFound(_)
            | Error::PreconditionFailed(_)
            | Error::InvalidArtifact { .. }
            | Error::Config(_) => false,
            // Cancellation is an explicit user decision
            Error::Cancelled => false,
            // The TTS client already exhausted its own retry budget;
            // re-attempt the job only for transient upstream classes
            Error::TtsFailed { retryable, .. } => *retryable,
            Error::ExternalToolFailed { .. }
            | Error::UploadFailed(_)
            | Error::Timeout { .. }
            | Error::Io(_)
            | Error::Internal(_) => true,
            #[cfg(feature = "sqlx")]
            Error::Database(_) => true,
        }
    }
}
