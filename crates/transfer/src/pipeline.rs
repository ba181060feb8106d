//! Two-stage fetch/drain pipeline joined by a bounded buffer.
//!
//! The fetch stage pulls chunks from the source in offset order and pushes
//! them into an `mpsc` channel whose capacity is the buffer size in chunks;
//! a full channel suspends fetching. The drain stage pops chunks, checks
//! contiguity, writes them to the sink, and hashes what was written.
//!
//! Each stage retries its own operation independently, so a rate-limited
//! fetch does not stall writes of already-buffered chunks and vice versa.
//! Both stages run on the caller's task via `tokio::join!`; a stage that
//! fails cancels its sibling through a child token.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SinkError, SourceError, TransferError};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::retry::{OperationClass, RetryContext, RetryDecision, RetryPolicy};
use crate::sink::DestinationSink;
use crate::source::ChunkSource;
use crate::state::StateTracker;
use crate::types::{Chunk, Stage, TransferSpec};

/// Result of a pipeline run that reached the final chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutput {
    /// Declared size, or the size learned from the source during the run.
    pub total_size: Option<u64>,
    /// Hex SHA-256 of every byte written to the sink.
    pub sha256: String,
}

/// Counters snapshot. Valid during and after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub bytes_fetched: u64,
    pub bytes_written: u64,
    pub chunks_written: u64,
    pub fetch_retries: u32,
    pub drain_retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_fetched: AtomicU64,
    bytes_written: AtomicU64,
    chunks_written: AtomicU64,
    fetch_retries: AtomicU32,
    drain_retries: AtomicU32,
    backoff_nanos: AtomicU64,
}

pub struct TransferPipeline<'a> {
    spec: &'a TransferSpec,
    policy: &'a RetryPolicy,
    io_timeout: Duration,
    reporter: &'a dyn ProgressReporter,
    state: &'a StateTracker,
    cancel: CancellationToken,
    counters: Counters,
}

impl<'a> TransferPipeline<'a> {
    pub fn new(
        spec: &'a TransferSpec,
        policy: &'a RetryPolicy,
        io_timeout: Duration,
        reporter: &'a dyn ProgressReporter,
        state: &'a StateTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            policy,
            io_timeout,
            reporter,
            state,
            cancel,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            bytes_fetched: c.bytes_fetched.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            chunks_written: c.chunks_written.load(Ordering::Relaxed),
            fetch_retries: c.fetch_retries.load(Ordering::Relaxed),
            drain_retries: c.drain_retries.load(Ordering::Relaxed),
            backoff: Duration::from_nanos(c.backoff_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Runs both stages to completion.
    ///
    /// Returns `Cancelled` if the session token fired. Otherwise the first
    /// real failure wins; a stage that only stopped because its sibling
    /// failed never masks the sibling's error.
    pub async fn run(
        &self,
        source: &dyn ChunkSource,
        sink: &mut dyn DestinationSink,
    ) -> Result<PipelineOutput, TransferError> {
        let (tx, rx) = mpsc::channel::<Chunk>(self.spec.buffer_chunks.max(1));
        let stages = self.cancel.child_token();

        let fetch = async {
            let result = self.fetch_stage(source, tx, &stages).await;
            if result.is_err() {
                stages.cancel();
            }
            result
        };
        let drain = async {
            let result = self.drain_stage(sink, rx, &stages).await;
            if result.is_err() {
                stages.cancel();
            }
            result
        };
        let (fetched, drained) = tokio::join!(fetch, drain);

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        match (fetched, drained) {
            (Ok(total_size), Ok(sha256)) => Ok(PipelineOutput { total_size, sha256 }),
            (Err(e), _) if !e.is_cancellation() => Err(e),
            (_, Err(e)) if !e.is_cancellation() => Err(e),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Fetch stage
    // -----------------------------------------------------------------------

    async fn fetch_stage(
        &self,
        source: &dyn ChunkSource,
        tx: mpsc::Sender<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<Option<u64>, TransferError> {
        let chunk_size = self.spec.chunk_size;
        let mut total = self.spec.total_size;
        let mut offset = 0u64;
        let mut retry = RetryContext::new(OperationClass::Chunk);

        loop {
            let length = match total {
                Some(t) => t.saturating_sub(offset).min(chunk_size),
                None => chunk_size,
            };
            let (chunk, attempts) = if length == 0 {
                // Declared size already reached (only possible for an empty
                // object): emit the terminating chunk without a request.
                (Chunk::final_chunk(offset, Bytes::new()), 0)
            } else {
                self.fetch_with_retry(source, offset, length, &mut retry, cancel)
                    .await?
            };

            if chunk.offset != offset {
                return Err(TransferError::OutOfOrder {
                    expected: offset,
                    actual: chunk.offset,
                });
            }
            if chunk.len() > length {
                return Err(TransferError::Source {
                    offset,
                    attempts,
                    source: SourceError::Permanent(format!(
                        "source returned {} bytes for a {length}-byte request",
                        chunk.len()
                    )),
                });
            }
            if let (Some(declared), Some(reported)) = (total, chunk.total_size)
                && declared != reported
            {
                return Err(TransferError::SizeMismatch {
                    expected: declared,
                    actual: reported,
                });
            }
            if total.is_none() {
                total = chunk.total_size;
            }

            let end = chunk.end();
            let is_final =
                chunk.is_final || chunk.len() < length || total.is_some_and(|t| end >= t);
            let chunk = Chunk {
                is_final,
                total_size: total,
                ..chunk
            };

            let fetched = self
                .counters
                .bytes_fetched
                .fetch_add(chunk.len(), Ordering::Relaxed)
                + chunk.len();
            self.reporter
                .report(ProgressEvent::new(Stage::Fetch, fetched, total));
            debug!(offset, len = chunk.len(), is_final, "chunk fetched");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                sent = tx.send(chunk) => {
                    if sent.is_err() {
                        // Drain stage is gone; its own error explains why.
                        return Err(TransferError::Cancelled);
                    }
                }
            }

            if is_final {
                return Ok(total);
            }
            offset = end;
        }
    }

    async fn fetch_with_retry(
        &self,
        source: &dyn ChunkSource,
        offset: u64,
        length: u64,
        retry: &mut RetryContext,
        cancel: &CancellationToken,
    ) -> Result<(Chunk, u32), TransferError> {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                r = tokio::time::timeout(self.io_timeout, source.fetch(offset, length)) => r,
            };
            let err = match outcome {
                Ok(Ok(chunk)) => {
                    let attempts = retry.attempts() + 1;
                    self.recovered(retry, Stage::Fetch, offset);
                    return Ok((chunk, attempts));
                }
                Ok(Err(e)) => e,
                Err(_) => SourceError::Transient(format!(
                    "fetch timed out after {:?}",
                    self.io_timeout
                )),
            };

            let failure = err.failure();
            retry.record_failure(failure);
            match self.policy.next_delay(retry, failure) {
                RetryDecision::Retry(delay) => {
                    if retry.attempts() == 1 {
                        self.state.enter_retrying();
                    }
                    self.counters.fetch_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        stage = %Stage::Fetch,
                        offset,
                        attempt = retry.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk fetch failed, retrying"
                    );
                    self.backoff(delay, cancel).await?;
                    retry.record_wait(delay);
                }
                RetryDecision::GiveUp => {
                    return Err(TransferError::Source {
                        offset,
                        attempts: retry.attempts(),
                        source: err,
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Drain stage
    // -----------------------------------------------------------------------

    async fn drain_stage(
        &self,
        sink: &mut dyn DestinationSink,
        mut rx: mpsc::Receiver<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<String, TransferError> {
        let mut expected = 0u64;
        let mut hasher = Sha256::new();
        let mut retry = RetryContext::new(OperationClass::Chunk);

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                next = rx.recv() => match next {
                    Some(chunk) => chunk,
                    // Fetch stage ended without a final chunk; its error wins.
                    None => return Err(TransferError::Cancelled),
                },
            };

            if chunk.offset != expected {
                return Err(TransferError::OutOfOrder {
                    expected,
                    actual: chunk.offset,
                });
            }

            if !chunk.is_empty() {
                self.write_with_retry(sink, &chunk, &mut retry, cancel)
                    .await?;
                hasher.update(&chunk.data);
            }
            expected = chunk.end();

            self.counters
                .bytes_written
                .store(expected, Ordering::Relaxed);
            self.counters.chunks_written.fetch_add(1, Ordering::Relaxed);
            self.reporter
                .report(ProgressEvent::new(Stage::Drain, expected, chunk.total_size));

            if chunk.is_final {
                debug!(bytes = expected, "drain complete");
                return Ok(hex::encode(hasher.finalize()));
            }
        }
    }

    async fn write_with_retry(
        &self,
        sink: &mut dyn DestinationSink,
        chunk: &Chunk,
        retry: &mut RetryContext,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                r = tokio::time::timeout(
                    self.io_timeout,
                    sink.write_at(chunk.offset, chunk.data.clone()),
                ) => r,
            };
            let err = match attempt {
                Ok(Ok(())) => {
                    self.recovered(retry, Stage::Drain, chunk.offset);
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("write timed out after {:?}", self.io_timeout),
                )),
            };

            let failure = err.failure();
            retry.record_failure(failure);
            match self.policy.next_delay(retry, failure) {
                RetryDecision::Retry(delay) => {
                    if retry.attempts() == 1 {
                        self.state.enter_retrying();
                    }
                    self.counters.drain_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        stage = %Stage::Drain,
                        offset = chunk.offset,
                        attempt = retry.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chunk write failed, retrying"
                    );
                    self.backoff(delay, cancel).await?;
                    retry.record_wait(delay);
                }
                RetryDecision::GiveUp => {
                    return Err(TransferError::Sink {
                        offset: chunk.offset,
                        attempts: retry.attempts(),
                        source: err,
                    });
                }
            }
        }
    }

    /// Commits the sink, retrying transient failures on the chunk budget.
    pub async fn finalize(&self, sink: &mut dyn DestinationSink) -> Result<(), TransferError> {
        let mut retry = RetryContext::new(OperationClass::Chunk);
        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                r = tokio::time::timeout(self.io_timeout, sink.finalize()) => r,
            };
            let err = match attempt {
                Ok(Ok(())) => {
                    if retry.attempts() > 0 {
                        self.state.leave_retrying();
                    }
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => SinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("finalize timed out after {:?}", self.io_timeout),
                )),
            };

            let failure = err.failure();
            retry.record_failure(failure);
            match self.policy.next_delay(&retry, failure) {
                RetryDecision::Retry(delay) => {
                    if retry.attempts() == 1 {
                        self.state.enter_retrying();
                    }
                    self.counters.drain_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        address = %sink.address(),
                        attempt = retry.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "finalize failed, retrying"
                    );
                    self.backoff(delay, &self.cancel).await?;
                    retry.record_wait(delay);
                }
                RetryDecision::GiveUp => {
                    return Err(TransferError::Finalize {
                        attempts: retry.attempts(),
                        source: err,
                    });
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    fn recovered(&self, retry: &mut RetryContext, stage: Stage, offset: u64) {
        if retry.attempts() > 0 {
            debug!(
                stage = %stage,
                offset,
                attempts = retry.attempts(),
                waited_ms = retry.waited().as_millis() as u64,
                "recovered after retry"
            );
            self.state.leave_retrying();
        }
        retry.reset();
    }

    async fn backoff(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), TransferError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = tokio::time::sleep(delay) => {
                self.counters
                    .backoff_nanos
                    .fetch_add(delay.as_nanos() as u64, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}
