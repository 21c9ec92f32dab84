//! End-to-end upload of one archive: plan, initiate, run, complete.

use std::io::{Read, Seek};

use serde::Serialize;
use tracing::info;
use vaultpush_protocol::{CompleteUploadRequest, InitiateUploadRequest, TreeHash};
use vaultpush_transfer::{PartPlan, PartPlanner, PartReader, RunResult, UploadSession};

use crate::error::UploadError;
use crate::orchestrator::UploadOrchestrator;

/// What to upload and where.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub vault_name: String,
    pub description: String,
    /// Explicit part size; chosen by the planner when `None`.
    pub part_size: Option<u64>,
    /// Continue an existing upload instead of initiating a new one.
    pub resume: Option<ResumeTarget>,
}

/// An open upload to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeTarget {
    pub upload_id: String,
    /// Part size the upload was initiated with.
    pub part_size: u64,
    /// First part to send; earlier parts are only hashed.
    pub from_part: u32,
}

/// How an archive upload ended.
///
/// Cancelled and failed uploads leave the remote session open so they
/// can be resumed from `RunResult::next_part`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ArchiveOutcome {
    #[serde(rename_all = "camelCase")]
    Completed {
        archive_id: String,
        checksum: TreeHash,
        result: RunResult,
    },
    Cancelled { result: RunResult },
    Failed { result: RunResult },
}

impl ArchiveOutcome {
    pub fn result(&self) -> &RunResult {
        match self {
            Self::Completed { result, .. } | Self::Cancelled { result } | Self::Failed { result } => {
                result
            }
        }
    }
}

impl UploadOrchestrator<'_> {
    /// Uploads `source` as one archive.
    ///
    /// A new upload is initiated unless `request.resume` names an open one.
    /// The upload is completed only if every part went through.
    pub async fn upload_archive<S>(
        &self,
        planner: &PartPlanner,
        request: &UploadRequest,
        source: PartReader<S>,
    ) -> Result<ArchiveOutcome, UploadError>
    where
        S: Read + Seek + Send + 'static,
    {
        let archive_size = source.len();

        let (session, from_part) = match &request.resume {
            Some(target) => {
                let plan = PartPlan::new(archive_size, target.part_size)?;
                info!(
                    vault = %request.vault_name,
                    upload_id = %target.upload_id,
                    from_part = target.from_part,
                    "resuming upload"
                );
                let session =
                    UploadSession::from_plan(&request.vault_name, &target.upload_id, plan);
                (session, target.from_part)
            }
            None => {
                let plan = planner.plan(archive_size, request.part_size)?;
                let upload_id = self
                    .transport()
                    .initiate_upload(&InitiateUploadRequest {
                        vault_name: request.vault_name.clone(),
                        part_size: plan.part_size(),
                        description: request.description.clone(),
                    })
                    .await?;
                info!(
                    vault = %request.vault_name,
                    upload_id = %upload_id,
                    archive_size,
                    part_size = plan.part_size(),
                    parts = plan.total_parts(),
                    "upload initiated"
                );
                (
                    UploadSession::from_plan(&request.vault_name, upload_id, plan),
                    1,
                )
            }
        };

        let session = self.run(session, source, from_part).await?;
        if session.cancelled() {
            return Ok(ArchiveOutcome::Cancelled {
                result: session.result(),
            });
        }
        if !session.success() {
            return Ok(ArchiveOutcome::Failed {
                result: session.result(),
            });
        }

        let checksum = session.archive_checksum()?;
        let response = self
            .transport()
            .complete_upload(&CompleteUploadRequest {
                vault_name: session.vault_name().to_string(),
                upload_id: session.upload_id().to_string(),
                archive_size: session.total_bytes(),
                checksum,
            })
            .await?;

        info!(
            vault = %session.vault_name(),
            archive_id = %response.archive_id,
            %checksum,
            "archive uploaded"
        );
        Ok(ArchiveOutcome::Completed {
            archive_id: response.archive_id,
            checksum,
            result: session.result(),
        })
    }
}
