//! Transport trait for talking to a vault.
//!
//! `TransportClient` is implemented once per storage backend. Keeping the
//! orchestrator behind this trait keeps it independent of any wire protocol
//! and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use tracing::debug;
use vaultpush_protocol::{
    AbortUploadRequest, CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest,
    UploadPartRequest,
};

use crate::error::TransportError;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Receives incremental progress while a part body is being sent.
pub trait PartProgress: Send + Sync {
    /// Reports the cumulative number of body bytes sent for the part.
    fn bytes_sent(&self, sent: u64);
}

/// Progress sink that discards every report.
pub struct NoProgress;

impl PartProgress for NoProgress {
    fn bytes_sent(&self, _sent: u64) {}
}

/// Abstract connection to a vault service.
pub trait TransportClient: Send + Sync {
    /// Opens a multipart upload and returns its upload id.
    fn initiate_upload<'a>(&'a self, request: &'a InitiateUploadRequest)
    -> TransportFuture<'a, String>;

    /// Sends one part. `body` covers exactly `request.range`.
    fn upload_part<'a>(
        &'a self,
        request: &'a UploadPartRequest,
        body: &'a [u8],
        progress: &'a dyn PartProgress,
    ) -> TransportFuture<'a, ()>;

    /// Assembles the accepted parts into an archive.
    fn complete_upload<'a>(
        &'a self,
        request: &'a CompleteUploadRequest,
    ) -> TransportFuture<'a, CompleteUploadResponse>;

    /// Discards an open upload and its parts.
    fn abort_upload<'a>(&'a self, request: &'a AbortUploadRequest) -> TransportFuture<'a, ()>;
}

/// Aborts an upload session.
///
/// A session that no longer exists counts as aborted unless `strict` is set.
pub async fn abort_session(
    transport: &dyn TransportClient,
    vault_name: &str,
    upload_id: &str,
    strict: bool,
) -> Result<(), TransportError> {
    let request = AbortUploadRequest {
        vault_name: vault_name.to_string(),
        upload_id: upload_id.to_string(),
    };
    match transport.abort_upload(&request).await {
        Err(TransportError::NotFound(reason)) if !strict => {
            debug!(vault = %vault_name, upload_id = %upload_id, %reason, "upload already gone");
            Ok(())
        }
        other => other,
    }
}
