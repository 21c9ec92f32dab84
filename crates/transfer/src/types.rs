use serde::Serialize;
use vaultpush_protocol::{ByteRange, TreeHash, UploadStatus};

use crate::planner::{PartPlan, PlanError};
use crate::{TransferError, combine_tree_hashes};

/// Outcome of a single part within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    /// Not yet decided.
    Pending,
    /// Hashed locally but not sent; accepted in an earlier run.
    Skipped,
    /// Confirmed by the remote vault.
    Uploaded,
    /// The last attempt failed and may be retried.
    TransientFailure,
}

/// State of one part while it is being processed.
///
/// The read position belongs to the attempt: a retry rewinds it to the
/// start of the range so the part is re-read and re-hashed from scratch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartAttempt {
    /// 1-based part number.
    pub part_number: u32,
    pub range: ByteRange,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// Offset the next read for this part must start from.
    pub read_position: u64,
    pub checksum: Option<TreeHash>,
    pub outcome: PartOutcome,
}

impl PartAttempt {
    pub fn new(part_number: u32, range: ByteRange) -> Self {
        Self {
            part_number,
            range,
            attempt: 1,
            read_position: range.start,
            checksum: None,
            outcome: PartOutcome::Pending,
        }
    }

    /// Bytes of the part still to be read in this attempt, starting at
    /// the attempt's read position.
    pub fn pending_range(&self) -> ByteRange {
        ByteRange::new(self.read_position, self.range.end() - self.read_position)
    }

    /// Records that the part body was read and hashed.
    pub fn record_read(&mut self, checksum: TreeHash) {
        self.read_position = self.range.end();
        self.checksum = Some(checksum);
    }

    /// Marks the part confirmed and returns its checksum.
    ///
    /// Returns `None` if the part was never read in this attempt.
    pub fn mark_uploaded(&mut self) -> Option<TreeHash> {
        if self.checksum.is_some() {
            self.outcome = PartOutcome::Uploaded;
        }
        self.checksum
    }

    /// Marks the current attempt failed and rewinds for the next one.
    pub fn retry(&mut self) {
        self.outcome = PartOutcome::TransientFailure;
        self.attempt += 1;
        self.read_position = self.range.start;
        self.checksum = None;
    }

    pub fn is_last_attempt(&self, max_attempts: u32) -> bool {
        self.attempt >= max_attempts
    }
}

/// Mutable record of one upload run.
///
/// Owned by a single orchestrator for the duration of the run. Counters
/// only move forward, and a part is counted as transferred only after the
/// vault has confirmed it.
#[derive(Debug, Clone)]
pub struct UploadSession {
    vault_name: String,
    upload_id: String,
    plan: PartPlan,
    current_position: u64,
    transferred_bytes: u64,
    transferred_parts: u64,
    part_checksums: Vec<TreeHash>,
    status: UploadStatus,
    error: String,
}

impl UploadSession {
    /// Creates a pending session.
    ///
    /// `part_size` must be the value the upload was initiated with.
    pub fn new(
        vault_name: impl Into<String>,
        upload_id: impl Into<String>,
        part_size: u64,
        total_bytes: u64,
    ) -> Result<Self, PlanError> {
        let plan = PartPlan::new(total_bytes, part_size)?;
        Ok(Self::from_plan(vault_name, upload_id, plan))
    }

    pub fn from_plan(
        vault_name: impl Into<String>,
        upload_id: impl Into<String>,
        plan: PartPlan,
    ) -> Self {
        Self {
            vault_name: vault_name.into(),
            upload_id: upload_id.into(),
            plan,
            current_position: 0,
            transferred_bytes: 0,
            transferred_parts: 0,
            part_checksums: Vec::with_capacity(plan.total_parts() as usize),
            status: UploadStatus::Pending,
            error: String::new(),
        }
    }

    pub fn vault_name(&self) -> &str {
        &self.vault_name
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn plan(&self) -> &PartPlan {
        &self.plan
    }

    pub fn part_size(&self) -> u64 {
        self.plan.part_size()
    }

    pub fn total_bytes(&self) -> u64 {
        self.plan.archive_size()
    }

    pub fn total_parts(&self) -> u64 {
        self.plan.total_parts()
    }

    pub fn current_position(&self) -> u64 {
        self.current_position
    }

    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes
    }

    pub fn transferred_parts(&self) -> u64 {
        self.transferred_parts
    }

    pub fn part_checksums(&self) -> &[TreeHash] {
        &self.part_checksums
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    /// Failure reason; empty unless the run failed.
    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn success(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    pub fn cancelled(&self) -> bool {
        self.status == UploadStatus::Cancelled
    }

    /// Returns `true` once every part has been processed.
    pub fn is_finished(&self) -> bool {
        self.current_position >= self.total_bytes()
    }

    /// 1-based number of the next part to process.
    pub fn next_part_number(&self) -> u32 {
        self.part_checksums.len() as u32 + 1
    }

    /// Byte range of the next part, or `None` when all parts are done.
    ///
    /// The final part is whatever remains, which may be shorter than the
    /// part size.
    pub fn next_range(&self) -> Option<ByteRange> {
        if self.is_finished() {
            return None;
        }
        let remaining = self.total_bytes() - self.current_position;
        Some(ByteRange::new(
            self.current_position,
            remaining.min(self.part_size()),
        ))
    }

    pub fn mark_started(&mut self) {
        self.status = UploadStatus::InProgress;
    }

    /// Records a part that was hashed but not sent.
    pub fn record_skipped(&mut self, range: ByteRange, checksum: TreeHash) {
        self.advance(range, checksum);
    }

    /// Records a part the vault has confirmed.
    pub fn record_uploaded(&mut self, range: ByteRange, checksum: TreeHash) {
        self.advance(range, checksum);
        self.transferred_bytes += range.length;
        self.transferred_parts += 1;
    }

    fn advance(&mut self, range: ByteRange, checksum: TreeHash) {
        debug_assert_eq!(range.start, self.current_position, "parts must be contiguous");
        self.part_checksums.push(checksum);
        self.current_position = range.end();
    }

    /// Marks a run whose every part was uploaded or skipped.
    pub fn mark_completed(&mut self) {
        self.status = UploadStatus::Completed;
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = UploadStatus::Failed;
        self.error = reason.into();
    }

    pub fn mark_cancelled(&mut self) {
        self.status = UploadStatus::Cancelled;
    }

    /// Tree hash of the whole archive.
    ///
    /// Only available once every part has a checksum.
    pub fn archive_checksum(&self) -> Result<TreeHash, TransferError> {
        let expected = self.total_parts();
        if self.part_checksums.len() as u64 != expected {
            return Err(TransferError::IncompleteChecksums {
                have: self.part_checksums.len(),
                expected,
            });
        }
        combine_tree_hashes(&self.part_checksums)
    }

    /// Snapshot for callers deciding whether to complete, report or resume.
    pub fn result(&self) -> RunResult {
        RunResult {
            vault_name: self.vault_name.clone(),
            upload_id: self.upload_id.clone(),
            success: self.success(),
            cancelled: self.cancelled(),
            total_bytes: self.total_bytes(),
            transferred_bytes: self.transferred_bytes,
            total_parts: self.total_parts(),
            transferred_parts: self.transferred_parts,
            next_part: if self.is_finished() {
                None
            } else {
                Some(self.next_part_number())
            },
            part_checksums: self.part_checksums.clone(),
            error: self.error.clone(),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub vault_name: String,
    pub upload_id: String,
    pub success: bool,
    pub cancelled: bool,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub total_parts: u64,
    pub transferred_parts: u64,
    /// First part not yet confirmed; pass it as the resume point.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_part: Option<u32>,
    pub part_checksums: Vec<TreeHash>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}
