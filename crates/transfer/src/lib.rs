//! Resilient streaming transfer engine.
//!
//! Reads a remote object in chunks through a [`ChunkSource`], buffers at most
//! a fixed number of chunks, and drains them in offset order into a
//! [`DestinationSink`]. Rate limits and transient faults are absorbed per
//! chunk by a [`RetryPolicy`]; a single [`CancellationToken`] stops every
//! suspension point.
//!
//! # Pipeline
//!
//! 1. **Resolve**: ask the [`MetadataSource`] for the object size
//! 2. **Fetch**: pull chunks into the bounded buffer (backpressure point)
//! 3. **Drain**: write buffered chunks to the sink, hashing as they land
//! 4. **Verify**: compare written bytes (and optional SHA-256) with the declaration
//! 5. **Finalize**: commit the sink, or abort it on any failure
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

use std::future::Future;
use std::pin::Pin;

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod session;
pub mod sink;
pub mod source;
pub mod state;
pub mod types;
pub mod validation;

pub use config::{BufferCapacity, EngineConfig, RetryConfig};
pub use error::{ConfigError, ErrorKind, Failure, SinkError, SourceError, TokenError, TransferError};
pub use pipeline::{PipelineOutput, PipelineStats, TransferPipeline};
pub use progress::{
    ChannelReporter, LogReporter, NoopReporter, ProgressEvent, ProgressReporter, SpeedCalculator,
};
pub use retry::{OperationClass, RetryContext, RetryDecision, RetryError, RetryPolicy, run_with_retry};
pub use session::TransferSession;
pub use sink::{
    CompletedPart, DestinationAddress, DestinationSink, LocalFileSink, MemorySink, MemoryStore,
    MultipartBackend, ObjectStoreSink, SinkFactory, StoreKind,
};
pub use source::{ChunkSource, MetadataSource, SourceOpener, StaticToken, TokenProvider};
pub use state::StateTracker;
pub use types::{Chunk, Stage, TransferFailure, TransferReport, TransferSpec, TransferState};
pub use validation::validate_destination_path;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default bounded-buffer capacity, in chunks.
pub const DEFAULT_BUFFER_CHUNKS: usize = 8;

/// Boxed, sendable future returned by the object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
