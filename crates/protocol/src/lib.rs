//! Value and request types exchanged between the upload orchestrator and
//! a vault transport.
//!
//! Nothing in this crate performs I/O; transports translate these types
//! into whatever the concrete storage service expects.

pub mod messages;
pub mod types;

pub use messages::{
    AbortUploadRequest, CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest,
    UploadPartRequest,
};
pub use types::{ByteRange, ParseTreeHashError, TreeHash, UploadStatus};

/// Hard limit on the number of parts in one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;
