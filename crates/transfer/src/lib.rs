//! Building blocks for multipart vault uploads: part planning, tree hashing,
//! exact-range source reading, session bookkeeping and progress statistics.
//!
//! Everything here is synchronous and transport-agnostic. The orchestrator
//! in `vaultpush-upload` drives these pieces against a remote vault.

mod chunked;
mod planner;
mod progress;
mod treehash;
mod types;

pub use chunked::PartReader;
pub use planner::{
    DEFAULT_BASELINE_PART_SIZE, MAX_PART_SIZE, MIN_PART_SIZE, PLANNED_PART_SIZE_LIMIT, PartPlan,
    PartPlanner, PlanError, TARGET_MAX_PARTS, choose_part_size, part_count, validate_part_size,
};
pub use progress::{
    ETA_MIN_ELAPSED, ProgressEvent, ProgressObserver, ProgressReporter, ProgressStats,
    SpeedCalculator, StatsCallback,
};
pub use treehash::{
    LEAF_SIZE, TreeHasher, combine_tree_hashes, compute_tree_hash, tree_hash_reader,
};
pub use types::{PartAttempt, PartOutcome, RunResult, UploadSession};

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source ended early: expected {expected} bytes at offset {offset}")]
    ShortRead { offset: u64, expected: u64 },

    #[error("source is {actual} bytes but the session expects {expected}")]
    SourceSizeMismatch { expected: u64, actual: u64 },

    #[error("cannot combine an empty checksum list")]
    EmptyChecksumList,

    #[error("checksums recorded for {have} of {expected} parts")]
    IncompleteChecksums { have: usize, expected: u64 },

    #[error(transparent)]
    Plan(#[from] PlanError),
}
