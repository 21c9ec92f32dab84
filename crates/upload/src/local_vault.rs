//! Directory-backed vault.
//!
//! Emulates a remote vault on the local file system:
//!
//! ```text
//! <root>/<vault>/uploads/<upload_id>/session.json
//! <root>/<vault>/uploads/<upload_id>/00001.part
//! <root>/<vault>/archives/<archive_id>
//! <root>/<vault>/archives/<archive_id>.json
//! ```
//!
//! Part bodies are checked against their tree hash on receipt, and the
//! assembled archive against the whole-archive tree hash on completion.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use vaultpush_protocol::{
    AbortUploadRequest, CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest,
    TreeHash, UploadPartRequest,
};
use vaultpush_transfer::{
    TransferError, combine_tree_hashes, compute_tree_hash, part_count, tree_hash_reader,
    validate_part_size,
};

use crate::error::TransportError;
use crate::transport::{PartProgress, TransportClient, TransportFuture};
use crate::validation::validate_name;

const SESSION_FILE: &str = "session.json";
const PART_EXTENSION: &str = "part";

/// Bytes written per progress report.
const WRITE_SLICE: usize = 256 * 1024;

/// Metadata of an open upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInfo {
    pub upload_id: String,
    pub vault_name: String,
    pub part_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Metadata stored next to an assembled archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveInfo {
    pub archive_id: String,
    pub vault_name: String,
    pub size: u64,
    pub checksum: TreeHash,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A vault stored under a local directory.
#[derive(Debug, Clone)]
pub struct LocalVault {
    root: PathBuf,
}

impl LocalVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads the metadata of an open upload.
    pub async fn upload_info(
        &self,
        vault_name: &str,
        upload_id: &str,
    ) -> Result<UploadInfo, TransportError> {
        let dir = self.upload_dir(vault_name, upload_id)?;
        let data = tokio::fs::read(dir.join(SESSION_FILE))
            .await
            .map_err(|e| not_found_or(e, format!("upload {upload_id} in vault {vault_name}")))?;
        serde_json::from_slice(&data)
            .map_err(|e| TransportError::Fatal(format!("corrupt session metadata: {e}")))
    }

    /// Part numbers accepted so far, ascending.
    pub async fn list_parts(
        &self,
        vault_name: &str,
        upload_id: &str,
    ) -> Result<Vec<u32>, TransportError> {
        let dir = self.upload_dir(vault_name, upload_id)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| not_found_or(e, format!("upload {upload_id} in vault {vault_name}")))?;

        let mut parts = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(transient)? {
            if let Some(number) = parse_part_name(&entry.file_name().to_string_lossy()) {
                parts.push(number);
            }
        }
        parts.sort_unstable();
        Ok(parts)
    }

    /// Reads the metadata of an assembled archive.
    pub async fn archive_info(
        &self,
        vault_name: &str,
        archive_id: &str,
    ) -> Result<ArchiveInfo, TransportError> {
        validate_name("archive id", archive_id)?;
        let path = self
            .vault_dir(vault_name)?
            .join("archives")
            .join(format!("{archive_id}.json"));
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| not_found_or(e, format!("archive {archive_id} in vault {vault_name}")))?;
        serde_json::from_slice(&data)
            .map_err(|e| TransportError::Fatal(format!("corrupt archive metadata: {e}")))
    }

    /// Path of an assembled archive's content.
    pub fn archive_path(&self, vault_name: &str, archive_id: &str) -> Result<PathBuf, TransportError> {
        validate_name("archive id", archive_id)?;
        Ok(self.vault_dir(vault_name)?.join("archives").join(archive_id))
    }

    fn vault_dir(&self, vault_name: &str) -> Result<PathBuf, TransportError> {
        validate_name("vault name", vault_name)?;
        Ok(self.root.join(vault_name))
    }

    fn upload_dir(&self, vault_name: &str, upload_id: &str) -> Result<PathBuf, TransportError> {
        validate_name("upload id", upload_id)?;
        Ok(self.vault_dir(vault_name)?.join("uploads").join(upload_id))
    }

    async fn initiate(&self, request: &InitiateUploadRequest) -> Result<String, TransportError> {
        validate_part_size(request.part_size).map_err(|e| TransportError::Fatal(e.to_string()))?;

        let upload_id = uuid::Uuid::new_v4().to_string();
        let dir = self.upload_dir(&request.vault_name, &upload_id)?;
        tokio::fs::create_dir_all(&dir).await.map_err(transient)?;

        let info = UploadInfo {
            upload_id: upload_id.clone(),
            vault_name: request.vault_name.clone(),
            part_size: request.part_size,
            description: request.description.clone(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&info)
            .map_err(|e| TransportError::Fatal(format!("encode session metadata: {e}")))?;
        tokio::fs::write(dir.join(SESSION_FILE), json)
            .await
            .map_err(transient)?;

        info!(
            vault = %request.vault_name,
            upload_id = %upload_id,
            part_size = request.part_size,
            "upload session created"
        );
        Ok(upload_id)
    }

    async fn store_part(
        &self,
        request: &UploadPartRequest,
        body: &[u8],
        progress: &dyn PartProgress,
    ) -> Result<(), TransportError> {
        let info = self
            .upload_info(&request.vault_name, &request.upload_id)
            .await?;
        let range = request.range;

        if range.is_empty() || range.length > info.part_size {
            return Err(TransportError::Fatal(format!(
                "part length {} outside 1..={}",
                range.length, info.part_size
            )));
        }
        if range.start % info.part_size != 0 {
            return Err(TransportError::Fatal(format!(
                "range {range} is not aligned to the part size {}",
                info.part_size
            )));
        }
        if body.len() as u64 != range.length {
            return Err(TransportError::Fatal(format!(
                "body is {} bytes but range {range} needs {}",
                body.len(),
                range.length
            )));
        }

        let actual = compute_tree_hash(body);
        if actual != request.checksum {
            warn!(
                upload_id = %request.upload_id,
                %range,
                expected = %request.checksum,
                %actual,
                "part checksum mismatch"
            );
            return Err(TransportError::Transient(format!(
                "checksum mismatch for {range}: expected {}, got {actual}",
                request.checksum
            )));
        }

        let part_number = range.start / info.part_size + 1;
        let dir = self.upload_dir(&request.vault_name, &request.upload_id)?;
        let final_path = dir.join(part_name(part_number));
        let tmp_path = dir.join(format!(".{}.tmp", part_name(part_number)));

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(transient)?;
        let mut written = 0u64;
        for slice in body.chunks(WRITE_SLICE) {
            file.write_all(slice).await.map_err(transient)?;
            written += slice.len() as u64;
            progress.bytes_sent(written);
        }
        file.flush().await.map_err(transient)?;
        file.sync_all().await.map_err(transient)?;
        drop(file);
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(transient)?;

        debug!(
            upload_id = %request.upload_id,
            part = part_number,
            %range,
            "part stored"
        );
        Ok(())
    }

    async fn assemble(
        &self,
        request: &CompleteUploadRequest,
    ) -> Result<CompleteUploadResponse, TransportError> {
        let info = self
            .upload_info(&request.vault_name, &request.upload_id)
            .await?;
        let dir = self.upload_dir(&request.vault_name, &request.upload_id)?;
        let parts = self
            .list_parts(&request.vault_name, &request.upload_id)
            .await?;

        if request.archive_size == 0 {
            return Err(TransportError::Fatal("archive size must be positive".into()));
        }
        let expected_parts = part_count(request.archive_size, info.part_size);
        if parts.len() as u64 != expected_parts
            || parts
                .iter()
                .enumerate()
                .any(|(i, &n)| u64::from(n) != i as u64 + 1)
        {
            return Err(TransportError::Fatal(format!(
                "parts do not cover the archive: have {:?}, need 1..={expected_parts}",
                parts
            )));
        }

        // Sizes and per-part hashes.
        let mut total = 0u64;
        let mut hashes = Vec::with_capacity(parts.len());
        for &number in &parts {
            let path = dir.join(part_name(u64::from(number)));
            let (hash, len) = hash_file(path).await?;
            let is_last = u64::from(number) == expected_parts;
            if !is_last && len != info.part_size {
                return Err(TransportError::Fatal(format!(
                    "part {number} is {len} bytes, expected {}",
                    info.part_size
                )));
            }
            total += len;
            hashes.push(hash);
        }
        if total != request.archive_size {
            return Err(TransportError::Fatal(format!(
                "parts total {total} bytes, archive size is {}",
                request.archive_size
            )));
        }
        let checksum =
            combine_tree_hashes(&hashes).map_err(|e| TransportError::Fatal(e.to_string()))?;
        if checksum != request.checksum {
            return Err(TransportError::Fatal(format!(
                "archive checksum mismatch: expected {}, got {checksum}",
                request.checksum
            )));
        }

        let archive_id = uuid::Uuid::new_v4().to_string();
        let archive_path = self.archive_path(&request.vault_name, &archive_id)?;
        if let Some(parent) = archive_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(transient)?;
        }
        let mut archive = tokio::fs::File::create(&archive_path)
            .await
            .map_err(transient)?;
        for &number in &parts {
            let mut part = tokio::fs::File::open(dir.join(part_name(u64::from(number))))
                .await
                .map_err(transient)?;
            tokio::io::copy(&mut part, &mut archive)
                .await
                .map_err(transient)?;
        }
        archive.flush().await.map_err(transient)?;

        let meta = ArchiveInfo {
            archive_id: archive_id.clone(),
            vault_name: request.vault_name.clone(),
            size: request.archive_size,
            checksum,
            description: info.description,
            created_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| TransportError::Fatal(format!("encode archive metadata: {e}")))?;
        let mut meta_path = archive_path.clone();
        meta_path.set_extension("json");
        tokio::fs::write(&meta_path, json).await.map_err(transient)?;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!(upload_id = %request.upload_id, error = %e, "failed to remove upload directory");
        }

        info!(
            vault = %request.vault_name,
            upload_id = %request.upload_id,
            archive_id = %archive_id,
            size = request.archive_size,
            %checksum,
            "archive assembled"
        );
        Ok(CompleteUploadResponse {
            archive_id,
            checksum,
            location: archive_path.to_string_lossy().into_owned(),
        })
    }

    async fn discard(&self, request: &AbortUploadRequest) -> Result<(), TransportError> {
        let dir = self.upload_dir(&request.vault_name, &request.upload_id)?;
        tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
            not_found_or(
                e,
                format!("upload {} in vault {}", request.upload_id, request.vault_name),
            )
        })?;
        info!(vault = %request.vault_name, upload_id = %request.upload_id, "upload aborted");
        Ok(())
    }
}

impl TransportClient for LocalVault {
    fn initiate_upload<'a>(
        &'a self,
        request: &'a InitiateUploadRequest,
    ) -> TransportFuture<'a, String> {
        Box::pin(self.initiate(request))
    }

    fn upload_part<'a>(
        &'a self,
        request: &'a UploadPartRequest,
        body: &'a [u8],
        progress: &'a dyn PartProgress,
    ) -> TransportFuture<'a, ()> {
        Box::pin(self.store_part(request, body, progress))
    }

    fn complete_upload<'a>(
        &'a self,
        request: &'a CompleteUploadRequest,
    ) -> TransportFuture<'a, CompleteUploadResponse> {
        Box::pin(self.assemble(request))
    }

    fn abort_upload<'a>(&'a self, request: &'a AbortUploadRequest) -> TransportFuture<'a, ()> {
        Box::pin(self.discard(request))
    }
}

fn part_name(part_number: u64) -> String {
    format!("{part_number:05}.{PART_EXTENSION}")
}

fn parse_part_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(PART_EXTENSION)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok().filter(|&n| n > 0)
}

/// Tree-hashes a file on the blocking pool.
async fn hash_file(path: PathBuf) -> Result<(TreeHash, u64), TransportError> {
    tokio::task::spawn_blocking(move || -> Result<(TreeHash, u64), TransferError> {
        let file = std::fs::File::open(&path)?;
        tree_hash_reader(io::BufReader::new(file))
    })
    .await
    .map_err(|e| TransportError::Transient(format!("task join error: {e}")))?
    .map_err(|e| TransportError::Transient(e.to_string()))
}

fn transient(e: io::Error) -> TransportError {
    TransportError::Transient(e.to_string())
}

fn not_found_or(e: io::Error, what: String) -> TransportError {
    if e.kind() == io::ErrorKind::NotFound {
        TransportError::NotFound(what)
    } else {
        transient(e)
    }
}
