use serde::{Deserialize, Serialize};

use crate::types::{ByteRange, TreeHash};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Opens a multipart upload session in a vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub vault_name: String,
    /// Bytes per part; every part except the last must have exactly this size.
    pub part_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Uploads one part of an open session. The body travels alongside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPartRequest {
    pub vault_name: String,
    pub upload_id: String,
    pub range: ByteRange,
    /// Tree hash of the part body.
    pub checksum: TreeHash,
}

/// Assembles all accepted parts into an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub vault_name: String,
    pub upload_id: String,
    pub archive_size: u64,
    /// Tree hash of the whole archive.
    pub checksum: TreeHash,
}

/// Discards an open session and every part uploaded to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortUploadRequest {
    pub vault_name: String,
    pub upload_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// Result of a successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub archive_id: String,
    pub checksum: TreeHash,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,
}
