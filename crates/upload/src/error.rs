//! Upload error types.

use vaultpush_transfer::{PlanError, RunResult, TransferError};

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The request may succeed if repeated.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The request was rejected and must not be repeated.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// The upload session does not exist (already completed or aborted).
    #[error("upload not found: {0}")]
    NotFound(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors that end an upload run.
///
/// Transient part failures never appear here; they are retried and, once
/// the budget is spent, recorded in the returned session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid resume point {part}: upload has {total_parts} parts")]
    InvalidResumePoint { part: u32, total_parts: u64 },

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("source error: {0}")]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("{cause}; aborting the upload also failed: {abort}")]
    AbortFailed {
        cause: Box<UploadError>,
        abort: TransportError,
    },

    /// A run stopped on an error after parts started moving. `result`
    /// holds what the vault had confirmed by then.
    #[error(
        "upload {} stopped after {} of {} parts",
        .result.upload_id,
        .result.transferred_parts,
        .result.total_parts
    )]
    Interrupted {
        result: Box<RunResult>,
        #[source]
        source: Box<UploadError>,
    },
}

impl UploadError {
    /// Returns `true` for failures of the local side (source or worker
    /// task) after which the remote session should be aborted.
    pub fn is_local_failure(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Task(_))
    }

    /// Confirmed counts of an interrupted run.
    pub fn run_result(&self) -> Option<&RunResult> {
        match self {
            Self::Interrupted { result, .. } => Some(result),
            _ => None,
        }
    }

    /// The error that stopped the run, looking through [`Self::Interrupted`].
    pub fn cause(&self) -> &UploadError {
        match self {
            Self::Interrupted { source, .. } => source.cause(),
            other => other,
        }
    }
}
