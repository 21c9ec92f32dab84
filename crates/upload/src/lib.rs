//! Multipart upload of a single archive to a vault.
//!
//! This crate implements the **upload state machine**: it walks an archive
//! part by part, tree-hashes each part, sends it through a
//! [`TransportClient`], retries transient failures, resumes from a given
//! part and stops cleanly on cancellation. Transports are pluggable; the
//! bundled [`LocalVault`] keeps vaults in a local directory.
//!
//! # Pipeline
//!
//! 1. **Plan**: pick a part size for the archive
//! 2. **Initiate**: open an upload session (or reuse one when resuming)
//! 3. **Upload**: send parts in order, skipping those already accepted
//! 4. **Complete**: assemble the archive with the whole-archive tree hash

pub mod error;
pub mod local_vault;
pub mod orchestrator;
pub mod pipeline;
pub mod transport;
pub mod types;
mod validation;

pub use error::{TransportError, UploadError};
pub use local_vault::{ArchiveInfo, LocalVault, UploadInfo};
pub use orchestrator::UploadOrchestrator;
pub use pipeline::{ArchiveOutcome, ResumeTarget, UploadRequest};
pub use transport::{NoProgress, PartProgress, TransportClient, TransportFuture, abort_session};
pub use types::RetryConfig;
