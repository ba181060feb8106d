//! Transfer session: one object, one destination, one outcome.
//!
//! A session resolves the object size, opens source and sink, runs the
//! pipeline, verifies what was written, and either finalizes or aborts the
//! sink. It is consumed by running it; observe it beforehand through
//! [`TransferSession::state`] and control it through
//! [`TransferSession::cancel_token`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ConfigError, SourceError, TransferError};
use crate::pipeline::{PipelineOutput, PipelineStats, TransferPipeline};
use crate::progress::{NoopReporter, ProgressReporter};
use crate::retry::{OperationClass, RetryError, RetryPolicy, run_with_retry};
use crate::sink::{DestinationSink, SinkFactory};
use crate::source::{ChunkSource, MetadataSource, SourceOpener};
use crate::state::StateTracker;
use crate::types::{TransferFailure, TransferReport, TransferSpec, TransferState};

pub struct TransferSession {
    id: Uuid,
    spec: TransferSpec,
    config: EngineConfig,
    policy: RetryPolicy,
    cancel: CancellationToken,
    state: StateTracker,
    reporter: Arc<dyn ProgressReporter>,
}

impl TransferSession {
    pub fn new(spec: TransferSpec, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        spec.validate()?;
        Ok(Self {
            id: Uuid::new_v4(),
            policy: RetryPolicy::new(config.retry),
            spec,
            config,
            cancel: CancellationToken::new(),
            state: StateTracker::new(),
            reporter: Arc::new(NoopReporter),
        })
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Ties this session to an outer token; cancelling `parent` cancels the session.
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &TransferSpec {
        &self.spec
    }

    /// Returns a cancellation token for this session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Subscribes to state changes.
    pub fn state(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    /// Resolves size, opens source and sink, and transfers.
    pub async fn run(
        mut self,
        metadata: &dyn MetadataSource,
        sources: &dyn SourceOpener,
        sinks: &SinkFactory,
    ) -> Result<TransferReport, TransferFailure> {
        let started = Instant::now();
        info!(
            session = %self.id,
            object = %self.spec.object_id,
            destination = %self.spec.destination,
            "starting transfer"
        );

        if self.spec.total_size.is_none() {
            match self.resolve_size(metadata).await {
                Ok(size) => self.spec.total_size = size,
                Err(e) => return Err(self.fail(e, &PipelineStats::default(), started)),
            }
        }

        let source = match sources.open(&self.spec.object_id) {
            Ok(source) => source,
            Err(e) => {
                return Err(self.fail(
                    TransferError::SourceOpen(e),
                    &PipelineStats::default(),
                    started,
                ));
            }
        };
        let mut sink = match sinks.open(&self.spec.destination).await {
            Ok(sink) => sink,
            Err(e) => {
                return Err(self.fail(
                    TransferError::Destination(e),
                    &PipelineStats::default(),
                    started,
                ));
            }
        };

        self.execute(source.as_ref(), sink.as_mut(), started).await
    }

    /// Transfers between an already-open source and sink.
    ///
    /// The declared `total_size` is used as-is; no metadata lookup happens.
    pub async fn transfer(
        self,
        source: &dyn ChunkSource,
        sink: &mut dyn DestinationSink,
    ) -> Result<TransferReport, TransferFailure> {
        let started = Instant::now();
        info!(
            session = %self.id,
            object = %self.spec.object_id,
            destination = %sink.address(),
            "starting transfer"
        );
        self.execute(source, sink, started).await
    }

    async fn resolve_size(&self, metadata: &dyn MetadataSource) -> Result<Option<u64>, TransferError> {
        let object_id = self.spec.object_id.as_str();
        let result = run_with_retry(
            &self.policy,
            OperationClass::Metadata,
            &self.cancel,
            |e: &SourceError| e.failure(),
            move || metadata.resolve_size(object_id),
        )
        .await;
        match result {
            Ok(size) => {
                info!(session = %self.id, size = ?size, "resolved object size");
                Ok(size)
            }
            Err(RetryError::Cancelled) => Err(TransferError::Cancelled),
            Err(RetryError::Exhausted { attempts, last, .. }) => Err(TransferError::Metadata {
                attempts,
                source: last,
            }),
        }
    }

    async fn execute(
        &self,
        source: &dyn ChunkSource,
        sink: &mut dyn DestinationSink,
        started: Instant,
    ) -> Result<TransferReport, TransferFailure> {
        if self.cancel.is_cancelled() {
            sink.abort().await;
            return Err(self.fail(TransferError::Cancelled, &PipelineStats::default(), started));
        }
        self.state.transition(TransferState::Running);

        let pipeline = TransferPipeline::new(
            &self.spec,
            &self.policy,
            self.config.io_timeout(),
            self.reporter.as_ref(),
            &self.state,
            self.cancel.clone(),
        );

        let work = async {
            let output = pipeline.run(source, &mut *sink).await?;
            self.verify(&pipeline.stats(), &output)?;
            pipeline.finalize(&mut *sink).await?;
            Ok::<_, TransferError>(output)
        }
        .instrument(info_span!("transfer", session = %self.id));
        let result = match self.config.session_timeout() {
            None => work.await,
            Some(limit) => {
                tokio::pin!(work);
                tokio::select! {
                    r = &mut work => r,
                    _ = tokio::time::sleep(limit) => {
                        warn!(
                            session = %self.id,
                            limit_ms = limit.as_millis() as u64,
                            "session timeout reached, cancelling"
                        );
                        self.cancel.cancel();
                        work.await.map_err(|_| TransferError::TimedOut(limit))
                    }
                }
            }
        };

        let stats = pipeline.stats();
        match result {
            Ok(output) => Ok(self.complete(sink.address(), output, &stats, started)),
            Err(e) => {
                sink.abort().await;
                Err(self.fail(e, &stats, started))
            }
        }
    }

    fn verify(&self, stats: &PipelineStats, output: &PipelineOutput) -> Result<(), TransferError> {
        if let Some(expected) = output.total_size
            && stats.bytes_written != expected
        {
            return Err(TransferError::SizeMismatch {
                expected,
                actual: stats.bytes_written,
            });
        }
        if let Some(expected) = &self.spec.expected_sha256
            && !expected.eq_ignore_ascii_case(&output.sha256)
        {
            return Err(TransferError::ChecksumMismatch {
                expected: expected.clone(),
                actual: output.sha256.clone(),
            });
        }
        Ok(())
    }

    fn complete(
        &self,
        destination: &str,
        output: PipelineOutput,
        stats: &PipelineStats,
        started: Instant,
    ) -> TransferReport {
        self.state.transition(TransferState::Completed);
        let report = TransferReport {
            session_id: self.id,
            object_id: self.spec.object_id.clone(),
            destination: destination.to_string(),
            bytes_transferred: stats.bytes_written,
            chunks: stats.chunks_written,
            elapsed: started.elapsed(),
            sha256: output.sha256,
            fetch_retries: stats.fetch_retries,
            drain_retries: stats.drain_retries,
            backoff: stats.backoff,
        };
        info!(
            session = %self.id,
            object = %report.object_id,
            destination = %report.destination,
            bytes = report.bytes_transferred,
            elapsed_ms = report.elapsed.as_millis() as u64,
            retries = report.fetch_retries + report.drain_retries,
            "transfer completed"
        );
        report
    }

    fn fail(&self, error: TransferError, stats: &PipelineStats, started: Instant) -> TransferFailure {
        let state = if error.is_cancellation() {
            TransferState::Cancelled
        } else {
            TransferState::Failed
        };
        self.state.transition(state);

        if state == TransferState::Cancelled {
            warn!(
                session = %self.id,
                object = %self.spec.object_id,
                bytes = stats.bytes_written,
                reason = %error,
                "transfer cancelled"
            );
        } else {
            error!(
                session = %self.id,
                object = %self.spec.object_id,
                kind = %error.kind(),
                attempts = error.attempts(),
                offset = ?error.offset(),
                error = %error,
                "transfer failed"
            );
        }

        TransferFailure {
            session_id: self.id,
            state,
            attempts: error.attempts(),
            bytes_written: stats.bytes_written,
            backoff: stats.backoff,
            elapsed: started.elapsed(),
            error,
        }
    }
}
