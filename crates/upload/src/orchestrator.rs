//! Upload orchestrator: drives one archive through its parts.
//!
//! Parts are processed strictly in order. Each part is read, tree-hashed
//! and either skipped (accepted in an earlier run) or sent with retries.
//! Cancellation is cooperative and never aborts the remote session.

use std::io::{Read, Seek};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vaultpush_protocol::{ByteRange, TreeHash, UploadPartRequest};
use vaultpush_transfer::{
    PartAttempt, PartReader, ProgressEvent, ProgressObserver, TransferError,
    UploadSession, compute_tree_hash,
};

use crate::error::UploadError;
use crate::transport::{PartProgress, TransportClient, abort_session};
use crate::types::RetryConfig;

/// Drives multipart uploads through a transport.
pub struct UploadOrchestrator<'a> {
    transport: &'a dyn TransportClient,
    retry: RetryConfig,
    cancel: CancellationToken,
    observer: Option<&'a dyn ProgressObserver>,
}

/// Terminal outcome of one part.
enum PartStep {
    Uploaded(TreeHash),
    Exhausted(String),
    Cancelled,
}

impl<'a> UploadOrchestrator<'a> {
    pub fn new(transport: &'a dyn TransportClient) -> Self {
        Self {
            transport,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Uses an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Returns a cancellation token for this orchestrator.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &'a dyn TransportClient {
        self.transport
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Uploads every part of `source` into the session, skipping parts
    /// numbered below `resume_from_part`.
    ///
    /// Exhausted retries and cancellation are recorded in the returned
    /// session. `Err` is reserved for invalid input, fatal transport
    /// errors and local failures; the latter abort the remote session
    /// first. Errors raised once parts are being processed come wrapped in
    /// [`UploadError::Interrupted`] with the confirmed counts.
    pub async fn run<S>(
        &self,
        mut session: UploadSession,
        source: PartReader<S>,
        resume_from_part: u32,
    ) -> Result<UploadSession, UploadError>
    where
        S: Read + Seek + Send + 'static,
    {
        let total_parts = session.total_parts();
        if resume_from_part == 0 || u64::from(resume_from_part) > total_parts {
            return Err(UploadError::InvalidResumePoint {
                part: resume_from_part,
                total_parts,
            });
        }

        if source.len() != session.total_bytes() {
            let cause = UploadError::Transfer(TransferError::SourceSizeMismatch {
                expected: session.total_bytes(),
                actual: source.len(),
            });
            return Err(self.abort_after(&session, cause).await);
        }

        info!(
            vault = %session.vault_name(),
            upload_id = %session.upload_id(),
            parts = total_parts,
            part_size = session.part_size(),
            resume_from = resume_from_part,
            "starting upload run"
        );

        session.mark_started();
        let mut source = BlockingSource::new(source);
        if let Err(e) = self
            .process_parts(&mut session, &mut source, resume_from_part)
            .await
        {
            let e = if e.is_local_failure() {
                self.abort_after(&session, e).await
            } else {
                error!(
                    vault = %session.vault_name(),
                    upload_id = %session.upload_id(),
                    part = session.next_part_number(),
                    error = %e,
                    "upload run failed"
                );
                e
            };
            session.mark_failed(e.to_string());
            return Err(UploadError::Interrupted {
                result: Box::new(session.result()),
                source: Box::new(e),
            });
        }

        info!(
            vault = %session.vault_name(),
            upload_id = %session.upload_id(),
            status = ?session.status(),
            transferred_parts = session.transferred_parts(),
            transferred_bytes = session.transferred_bytes(),
            "upload run finished"
        );
        Ok(session)
    }

    async fn process_parts<S>(
        &self,
        session: &mut UploadSession,
        source: &mut BlockingSource<S>,
        resume_from_part: u32,
    ) -> Result<(), UploadError>
    where
        S: Read + Seek + Send + 'static,
    {
        let run_started = Instant::now();

        while let Some(range) = session.next_range() {
            if self.cancel.is_cancelled() {
                session.mark_cancelled();
                info!(part = session.next_part_number(), "upload cancelled");
                return Ok(());
            }

            let part_number = session.next_part_number();
            if part_number < resume_from_part {
                let (_, checksum) = source.read_part(range).await?;
                debug!(part = part_number, %checksum, "skipping accepted part");
                session.record_skipped(range, checksum);
                continue;
            }

            match self
                .send_part(session, source, part_number, range, run_started)
                .await?
            {
                PartStep::Uploaded(checksum) => {
                    debug!(part = part_number, bytes = range.length, %checksum, "part uploaded");
                    session.record_uploaded(range, checksum);
                }
                PartStep::Exhausted(reason) => {
                    error!(part = part_number, error = %reason, "retries exhausted");
                    session.mark_failed(reason);
                    return Ok(());
                }
                PartStep::Cancelled => {
                    session.mark_cancelled();
                    info!(part = part_number, "upload cancelled");
                    return Ok(());
                }
            }
        }

        session.mark_completed();
        Ok(())
    }

    /// Attempt loop for one part. Every attempt re-reads and re-hashes
    /// the range from its start.
    async fn send_part<S>(
        &self,
        session: &UploadSession,
        source: &mut BlockingSource<S>,
        part_number: u32,
        range: ByteRange,
        run_started: Instant,
    ) -> Result<PartStep, UploadError>
    where
        S: Read + Seek + Send + 'static,
    {
        let max_attempts = self.retry.attempts();
        let mut attempt = PartAttempt::new(part_number, range);
        let tracker = PartTracker::new(self.observer, session, part_number, range, run_started);

        loop {
            let (body, checksum) = source.read_part(attempt.pending_range()).await?;
            attempt.record_read(checksum);
            tracker.begin_attempt(attempt.attempt);

            let request = UploadPartRequest {
                vault_name: session.vault_name().to_string(),
                upload_id: session.upload_id().to_string(),
                range,
                checksum,
            };
            debug!(
                part = part_number,
                attempt = attempt.attempt,
                %range,
                "sending part"
            );

            let sent = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(PartStep::Cancelled),
                result = self.transport.upload_part(&request, &body, &tracker) => result,
            };

            match sent {
                Ok(()) => {
                    tracker.bytes_sent(range.length);
                    return attempt.mark_uploaded().map(PartStep::Uploaded).ok_or_else(|| {
                        UploadError::Task(format!("part {part_number} confirmed before it was read"))
                    });
                }
                Err(e) if e.is_transient() => {
                    if attempt.is_last_attempt(max_attempts) {
                        return Ok(PartStep::Exhausted(format!(
                            "part {part_number} failed after {} attempts: {e}",
                            attempt.attempt
                        )));
                    }

                    let delay = self.retry.delay_after_attempt(attempt.attempt);
                    warn!(
                        part = part_number,
                        attempt = attempt.attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "part upload failed, retrying"
                    );
                    attempt.retry();

                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Ok(PartStep::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if self.cancel.is_cancelled() {
                        return Ok(PartStep::Cancelled);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Best-effort remote abort after a local failure.
    async fn abort_after(&self, session: &UploadSession, cause: UploadError) -> UploadError {
        error!(
            vault = %session.vault_name(),
            upload_id = %session.upload_id(),
            error = %cause,
            "local failure, aborting upload"
        );
        match abort_session(
            self.transport,
            session.vault_name(),
            session.upload_id(),
            false,
        )
        .await
        {
            Ok(()) => cause,
            Err(abort) => {
                warn!(upload_id = %session.upload_id(), error = %abort, "abort failed");
                UploadError::AbortFailed {
                    cause: Box::new(cause),
                    abort,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking source access
// ---------------------------------------------------------------------------

/// Moves the part reader onto the blocking pool for each read.
struct BlockingSource<S> {
    reader: Option<PartReader<S>>,
}

impl<S> BlockingSource<S>
where
    S: Read + Seek + Send + 'static,
{
    fn new(reader: PartReader<S>) -> Self {
        Self {
            reader: Some(reader),
        }
    }

    /// Reads `range` and computes its tree hash off the async runtime.
    async fn read_part(&mut self, range: ByteRange) -> Result<(Vec<u8>, TreeHash), UploadError> {
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| UploadError::Task("source lost by an earlier read task".into()))?;

        let (reader, result) = tokio::task::spawn_blocking(move || {
            let result = reader.read_range(range).map(|body| {
                let checksum = compute_tree_hash(&body);
                (body, checksum)
            });
            (reader, result)
        })
        .await
        .map_err(|e| UploadError::Task(format!("task join error: {e}")))?;

        self.reader = Some(reader);
        Ok(result?)
    }
}

// ---------------------------------------------------------------------------
// Part progress
// ---------------------------------------------------------------------------

/// Turns transport byte counts into progress events for one part.
///
/// Counts only move forward, including across attempts. Observer panics
/// are caught and logged.
struct PartTracker<'a> {
    observer: Option<&'a dyn ProgressObserver>,
    part_number: u32,
    total_parts: u64,
    total_bytes: u64,
    confirmed_bytes: u64,
    range: ByteRange,
    run_started: Instant,
    part_started: Instant,
    attempt: AtomicU32,
    sent: AtomicU64,
}

impl<'a> PartTracker<'a> {
    fn new(
        observer: Option<&'a dyn ProgressObserver>,
        session: &UploadSession,
        part_number: u32,
        range: ByteRange,
        run_started: Instant,
    ) -> Self {
        Self {
            observer,
            part_number,
            total_parts: session.total_parts(),
            total_bytes: session.total_bytes(),
            confirmed_bytes: session.transferred_bytes(),
            range,
            run_started,
            part_started: Instant::now(),
            attempt: AtomicU32::new(1),
            sent: AtomicU64::new(0),
        }
    }

    fn begin_attempt(&self, attempt: u32) {
        self.attempt.store(attempt, Ordering::Relaxed);
    }
}

impl PartProgress for PartTracker<'_> {
    fn bytes_sent(&self, sent: u64) {
        let Some(observer) = self.observer else {
            return;
        };
        let sent = sent.min(self.range.length);
        let previous = self.sent.fetch_max(sent, Ordering::Relaxed);
        if sent <= previous {
            return;
        }

        let event = ProgressEvent {
            part_number: self.part_number,
            total_parts: self.total_parts,
            total_bytes: self.total_bytes,
            bytes_transferred: self.confirmed_bytes + sent,
            position: self.range.start + sent,
            part_bytes_transferred: sent,
            part_length: self.range.length,
            elapsed: self.run_started.elapsed(),
            part_elapsed: self.part_started.elapsed(),
            attempt: self.attempt.load(Ordering::Relaxed),
        };
        if catch_unwind(AssertUnwindSafe(|| observer.observe(&event))).is_err() {
            warn!(part = self.part_number, "progress observer panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::TransportFuture;
    use std::collections::VecDeque;
    use std::io::{self, Cursor, SeekFrom};
    use std::sync::Mutex;
    use std::time::Duration;
    use vaultpush_protocol::{
        AbortUploadRequest, CompleteUploadRequest, CompleteUploadResponse,
        InitiateUploadRequest, MIB,
    };
    use vaultpush_transfer::combine_tree_hashes;

    /// Mock transport that records part uploads and aborts.
    #[derive(Default)]
    struct MockTransport {
        parts: Mutex<Vec<UploadPartRequest>>,
        bodies: Mutex<Vec<Vec<u8>>>,
        responses: Mutex<VecDeque<Result<(), TransportError>>>,
        aborts: Mutex<Vec<AbortUploadRequest>>,
        abort_result: Mutex<Option<TransportError>>,
        cancel_on_part: Option<(u32, CancellationToken)>,
        progress_steps: u64,
    }

    impl MockTransport {
        fn new() -> Self {
            Self::default()
        }

        fn push_response(&self, response: Result<(), TransportError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn part_numbers(&self) -> Vec<u32> {
            self.parts
                .lock()
                .unwrap()
                .iter()
                .map(|r| part_of(r.range))
                .collect()
        }

        fn abort_count(&self) -> usize {
            self.aborts.lock().unwrap().len()
        }
    }

    fn part_of(range: ByteRange) -> u32 {
        (range.start / MIB) as u32 + 1
    }

    impl TransportClient for MockTransport {
        fn initiate_upload<'a>(
            &'a self,
            _request: &'a InitiateUploadRequest,
        ) -> TransportFuture<'a, String> {
            Box::pin(async { Ok("u1".to_string()) })
        }

        fn upload_part<'a>(
            &'a self,
            request: &'a UploadPartRequest,
            body: &'a [u8],
            progress: &'a dyn PartProgress,
        ) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                self.parts.lock().unwrap().push(request.clone());
                self.bodies.lock().unwrap().push(body.to_vec());

                if self.progress_steps > 0 {
                    let step = (body.len() as u64 / self.progress_steps).max(1);
                    let mut sent = 0;
                    while sent < body.len() as u64 {
                        sent = (sent + step).min(body.len() as u64);
                        progress.bytes_sent(sent);
                    }
                }

                if let Some((part, token)) = &self.cancel_on_part
                    && part_of(request.range) == *part
                {
                    token.cancel();
                    std::future::pending::<()>().await;
                }

                self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()))
            })
        }

        fn complete_upload<'a>(
            &'a self,
            _request: &'a CompleteUploadRequest,
        ) -> TransportFuture<'a, CompleteUploadResponse> {
            Box::pin(async { Err(TransportError::Fatal("not used".into())) })
        }

        fn abort_upload<'a>(&'a self, request: &'a AbortUploadRequest) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                self.aborts.lock().unwrap().push(request.clone());
                match self.abort_result.lock().unwrap().clone() {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            })
        }
    }

    /// Source that fails every read starting at `fail_at`.
    struct FailingSource {
        inner: Cursor<Vec<u8>>,
        fail_at: u64,
    }

    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.position() >= self.fail_at {
                return Err(io::Error::other("disk unplugged"));
            }
            let room = (self.fail_at - self.inner.position()) as usize;
            let n = buf.len().min(room);
            self.inner.read(&mut buf[..n])
        }
    }

    impl Seek for FailingSource {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    fn archive(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn session(total: u64) -> UploadSession {
        UploadSession::new("vault", "u1", MIB, total).unwrap()
    }

    fn source(data: &[u8]) -> PartReader<Cursor<Vec<u8>>> {
        PartReader::new(Cursor::new(data.to_vec())).unwrap()
    }

    fn expected_checksums(data: &[u8]) -> Vec<TreeHash> {
        data.chunks(MIB as usize).map(compute_tree_hash).collect()
    }

    #[tokio::test]
    async fn uploads_every_part_in_order() {
        let data = archive(3 * MIB + 100);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig::immediate(3));

        let result = orch
            .run(session(data.len() as u64), source(&data), 1)
            .await
            .unwrap();

        assert!(result.success());
        assert!(!result.cancelled());
        assert_eq!(result.transferred_parts(), 4);
        assert_eq!(result.transferred_bytes(), data.len() as u64);
        assert_eq!(result.current_position(), data.len() as u64);
        assert_eq!(transport.part_numbers(), vec![1, 2, 3, 4]);
        assert_eq!(result.part_checksums(), expected_checksums(&data).as_slice());
        assert_eq!(
            result.archive_checksum().unwrap(),
            combine_tree_hashes(&expected_checksums(&data)).unwrap()
        );
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn final_part_is_shorter() {
        let data = archive(2 * MIB + 7);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);

        orch.run(session(data.len() as u64), source(&data), 1)
            .await
            .unwrap();

        let parts = transport.parts.lock().unwrap();
        assert_eq!(parts[2].range, ByteRange::new(2 * MIB, 7));
        assert_eq!(transport.bodies.lock().unwrap()[2], &data[2 * MIB as usize..]);
        assert_eq!(parts[2].checksum, compute_tree_hash(&data[2 * MIB as usize..]));
    }

    #[tokio::test]
    async fn retry_exhaustion_makes_exactly_budget_attempts() {
        let data = archive(2 * MIB);
        let transport = MockTransport::new();
        transport.push_response(Ok(()));
        for _ in 0..10 {
            transport.push_response(Err(TransportError::Transient("timeout".into())));
        }
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig::immediate(3));

        let result = orch
            .run(session(data.len() as u64), source(&data), 1)
            .await
            .unwrap();

        assert!(!result.success());
        assert!(!result.cancelled());
        assert_eq!(transport.part_numbers(), vec![1, 2, 2, 2]);
        assert_eq!(result.transferred_parts(), 1);
        assert_eq!(result.current_position(), MIB);
        assert!(result.error().contains("3 attempts"));
        assert_eq!(result.result().next_part, Some(2));
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn zero_budget_makes_one_attempt() {
        let data = archive(MIB);
        let transport = MockTransport::new();
        transport.push_response(Err(TransportError::Transient("timeout".into())));
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig::immediate(0));

        let result = orch.run(session(MIB), source(&data), 1).await.unwrap();
        assert!(!result.success());
        assert_eq!(transport.part_numbers(), vec![1]);
    }

    #[tokio::test]
    async fn transient_failure_rereads_and_succeeds() {
        let data = archive(2 * MIB);
        let transport = MockTransport::new();
        transport.push_response(Err(TransportError::Transient("reset".into())));
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig::immediate(3));

        let result = orch
            .run(session(data.len() as u64), source(&data), 1)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(transport.part_numbers(), vec![1, 1, 2]);
        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies[0], bodies[1]);
        assert_eq!(result.transferred_parts(), 2);
        assert_eq!(result.part_checksums().len(), 2);
    }

    #[tokio::test]
    async fn resume_skips_earlier_parts_but_hashes_them() {
        let data = archive(4 * MIB + 1);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);

        let result = orch
            .run(session(data.len() as u64), source(&data), 3)
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(transport.part_numbers(), vec![3, 4, 5]);
        assert_eq!(result.transferred_parts(), 3);
        assert_eq!(result.transferred_bytes(), 2 * MIB + 1);
        assert_eq!(result.part_checksums(), expected_checksums(&data).as_slice());
    }

    #[tokio::test]
    async fn resume_from_last_part() {
        let data = archive(3 * MIB);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);

        let result = orch.run(session(3 * MIB), source(&data), 3).await.unwrap();
        assert!(result.success());
        assert_eq!(transport.part_numbers(), vec![3]);
    }

    #[tokio::test]
    async fn invalid_resume_point_is_rejected_before_reading() {
        let data = archive(2 * MIB);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);

        for part in [0, 3] {
            let err = orch
                .run(session(2 * MIB), source(&data), part)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                UploadError::InvalidResumePoint { total_parts: 2, .. }
            ));
        }
        assert!(transport.part_numbers().is_empty());
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_part_stops_without_abort() {
        let data = archive(5 * MIB);
        let cancel = CancellationToken::new();
        let transport = MockTransport {
            cancel_on_part: Some((3, cancel.clone())),
            ..MockTransport::default()
        };
        let orch = UploadOrchestrator::new(&transport).with_cancel_token(cancel);

        let result = orch.run(session(5 * MIB), source(&data), 1).await.unwrap();

        assert!(result.cancelled());
        assert!(!result.success());
        assert_eq!(result.transferred_parts(), 2);
        assert_eq!(result.transferred_bytes(), 2 * MIB);
        assert_eq!(transport.part_numbers(), vec![1, 2, 3]);
        assert_eq!(result.result().next_part, Some(3));
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start_sends_nothing() {
        let data = archive(MIB);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);
        orch.cancel_token().cancel();

        let result = orch.run(session(MIB), source(&data), 1).await.unwrap();
        assert!(result.cancelled());
        assert_eq!(result.transferred_parts(), 0);
        assert!(transport.part_numbers().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let data = archive(MIB);
        let transport = MockTransport::new();
        transport.push_response(Err(TransportError::Transient("busy".into())));
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        };
        let orch = UploadOrchestrator::new(&transport).with_retry(retry);

        let started = tokio::time::Instant::now();
        let result = orch.run(session(MIB), source(&data), 1).await.unwrap();

        assert!(result.success());
        assert!(started.elapsed() >= Duration::from_millis(7_500));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_stops_retrying() {
        let data = archive(MIB);
        let transport = MockTransport::new();
        transport.push_response(Err(TransportError::Transient("busy".into())));
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.0,
        });

        let cancel = orch.cancel_token();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = orch.run(session(MIB), source(&data), 1).await.unwrap();
        canceller.await.unwrap();

        assert!(result.cancelled());
        assert_eq!(transport.part_numbers(), vec![1]);
        assert!(started.elapsed() < Duration::from_secs(45));
    }

    #[tokio::test]
    async fn fatal_transport_error_propagates_without_abort() {
        let data = archive(2 * MIB);
        let transport = MockTransport::new();
        transport.push_response(Err(TransportError::Fatal("bad checksum".into())));
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig::immediate(5));

        let err = orch
            .run(session(2 * MIB), source(&data), 1)
            .await
            .unwrap_err();

        assert!(matches!(
            err.cause(),
            UploadError::Transport(TransportError::Fatal(_))
        ));
        let result = err.run_result().unwrap();
        assert!(!result.success);
        assert_eq!(result.transferred_parts, 0);
        assert_eq!(result.next_part, Some(1));
        assert!(result.error.contains("bad checksum"));
        assert_eq!(transport.part_numbers(), vec![1]);
        assert_eq!(transport.abort_count(), 0);
    }

    #[tokio::test]
    async fn fatal_error_after_confirmed_parts_keeps_counts() {
        let data = archive(3 * MIB);
        let transport = MockTransport::new();
        transport.push_response(Ok(()));
        transport.push_response(Ok(()));
        transport.push_response(Err(TransportError::NotFound("u1".into())));
        let orch = UploadOrchestrator::new(&transport);

        let err = orch
            .run(session(3 * MIB), source(&data), 1)
            .await
            .unwrap_err();

        let UploadError::Interrupted { result, source } = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(matches!(
            **source,
            UploadError::Transport(TransportError::NotFound(_))
        ));
        assert_eq!(result.transferred_parts, 2);
        assert_eq!(result.transferred_bytes, 2 * MIB);
        assert_eq!(result.next_part, Some(3));
        assert_eq!(result.part_checksums.len(), 2);
        assert_eq!(err.to_string(), "upload u1 stopped after 2 of 3 parts");
    }

    #[tokio::test]
    async fn size_mismatch_aborts_session() {
        let data = archive(MIB);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);

        let err = orch
            .run(session(2 * MIB), source(&data), 1)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::Transfer(TransferError::SourceSizeMismatch {
                expected,
                actual
            }) if expected == 2 * MIB && actual == MIB
        ));
        assert_eq!(transport.abort_count(), 1);
        assert_eq!(transport.aborts.lock().unwrap()[0].upload_id, "u1");
        assert!(transport.part_numbers().is_empty());
    }

    #[tokio::test]
    async fn failed_abort_surfaces_both_errors() {
        let data = archive(MIB);
        let transport = MockTransport::new();
        *transport.abort_result.lock().unwrap() =
            Some(TransportError::Transient("unreachable".into()));
        let orch = UploadOrchestrator::new(&transport);

        let err = orch
            .run(session(2 * MIB), source(&data), 1)
            .await
            .unwrap_err();

        match err {
            UploadError::AbortFailed { cause, abort } => {
                assert!(matches!(*cause, UploadError::Transfer(_)));
                assert_eq!(abort, TransportError::Transient("unreachable".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn read_failure_mid_run_aborts_session() {
        let data = archive(3 * MIB);
        let transport = MockTransport::new();
        let orch = UploadOrchestrator::new(&transport);
        let reader = PartReader::new(FailingSource {
            inner: Cursor::new(data),
            fail_at: MIB + 10,
        })
        .unwrap();

        let err = orch.run(session(3 * MIB), reader, 1).await.unwrap_err();

        assert!(matches!(
            err.cause(),
            UploadError::Transfer(TransferError::Io(_))
        ));
        assert_eq!(err.run_result().unwrap().transferred_parts, 1);
        assert_eq!(transport.part_numbers(), vec![1]);
        assert_eq!(transport.abort_count(), 1);
    }

    #[tokio::test]
    async fn failed_abort_mid_run_is_wrapped_with_counts() {
        let data = archive(2 * MIB);
        let transport = MockTransport::new();
        *transport.abort_result.lock().unwrap() = Some(TransportError::Fatal("gone".into()));
        let orch = UploadOrchestrator::new(&transport);
        let reader = PartReader::new(FailingSource {
            inner: Cursor::new(data),
            fail_at: MIB,
        })
        .unwrap();

        let err = orch.run(session(2 * MIB), reader, 1).await.unwrap_err();

        assert!(matches!(err.cause(), UploadError::AbortFailed { .. }));
        assert_eq!(err.run_result().unwrap().transferred_parts, 1);
    }

    /// Cursor that records every absolute seek.
    struct SeekLog {
        inner: Cursor<Vec<u8>>,
        starts: std::sync::Arc<Mutex<Vec<u64>>>,
    }

    impl Read for SeekLog {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Seek for SeekLog {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            if let SeekFrom::Start(offset) = pos {
                self.starts.lock().unwrap().push(offset);
            }
            self.inner.seek(pos)
        }
    }

    #[tokio::test]
    async fn retry_seeks_back_to_part_start() {
        let data = archive(2 * MIB);
        let starts = std::sync::Arc::new(Mutex::new(Vec::new()));
        let reader = PartReader::new(SeekLog {
            inner: Cursor::new(data.clone()),
            starts: starts.clone(),
        })
        .unwrap();
        starts.lock().unwrap().clear();

        let transport = MockTransport::new();
        transport.push_response(Ok(()));
        transport.push_response(Err(TransportError::Transient("reset".into())));
        let orch = UploadOrchestrator::new(&transport).with_retry(RetryConfig::immediate(2));

        let result = orch.run(session(2 * MIB), reader, 1).await.unwrap();

        assert!(result.success());
        assert_eq!(transport.part_numbers(), vec![1, 2, 2]);
        // Sequential reads need no seek; only the retry of part 2 rewinds.
        assert_eq!(*starts.lock().unwrap(), vec![MIB]);
        let bodies = transport.bodies.lock().unwrap();
        assert_eq!(bodies[1], bodies[2]);
        assert_eq!(bodies[2], &data[MIB as usize..]);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_reaches_total() {
        let data = archive(2 * MIB + 500);
        let transport = MockTransport {
            progress_steps: 4,
            ..MockTransport::default()
        };
        transport.push_response(Err(TransportError::Transient("reset".into())));
        let events = Mutex::new(Vec::<ProgressEvent>::new());
        let observer = |e: &ProgressEvent| events.lock().unwrap().push(e.clone());
        let orch = UploadOrchestrator::new(&transport)
            .with_retry(RetryConfig::immediate(3))
            .with_observer(&observer);

        let result = orch
            .run(session(data.len() as u64), source(&data), 1)
            .await
            .unwrap();
        assert!(result.success());

        let events = events.lock().unwrap();
        assert!(!events.is_empty());
        for pair in events.windows(2) {
            assert!(pair[1].bytes_transferred >= pair[0].bytes_transferred);
            assert!(pair[1].position >= pair[0].position);
        }
        let last = events.last().unwrap();
        assert_eq!(last.bytes_transferred, data.len() as u64);
        assert!(last.part_finished());
        assert_eq!(last.part_number, 3);
    }

    #[tokio::test]
    async fn panicking_observer_does_not_stop_upload() {
        let data = archive(2 * MIB);
        let transport = MockTransport {
            progress_steps: 2,
            ..MockTransport::default()
        };
        let observer = |e: &ProgressEvent| {
            if e.part_bytes_transferred > 0 {
                panic!("display crashed");
            }
        };
        let orch = UploadOrchestrator::new(&transport).with_observer(&observer);

        let result = orch.run(session(2 * MIB), source(&data), 1).await.unwrap();
        assert!(result.success());
        assert_eq!(result.transferred_parts(), 2);
    }
}
