//! Error taxonomy for the transfer engine.
//!
//! Collaborator errors ([`SourceError`], [`SinkError`]) classify themselves
//! into a [`Failure`] that the retry policy acts on. Session-level
//! [`TransferError`] carries the offset and attempt count of the operation
//! that gave up.

use std::time::Duration;

/// Retry classification of a single failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Server asked us to slow down, optionally saying for how long.
    RateLimited { retry_after: Option<Duration> },
    /// Network hiccup, 5xx, timeout, sink I/O error.
    Transient,
    /// Never retried.
    Permanent,
}

impl Failure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Failure::RateLimited { .. } => ErrorKind::RateLimited,
            Failure::Transient => ErrorKind::Transient,
            Failure::Permanent => ErrorKind::Permanent,
        }
    }
}

/// Coarse error category exposed on every terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    Transient,
    Permanent,
    SizeMismatch,
    ChecksumMismatch,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::SizeMismatch => "size-mismatch",
            ErrorKind::ChecksumMismatch => "checksum-mismatch",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors returned by a [`ChunkSource`](crate::ChunkSource) or
/// [`MetadataSource`](crate::MetadataSource). Never retried internally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient source error: {0}")]
    Transient(String),

    #[error("permanent source error: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn failure(&self) -> Failure {
        match self {
            SourceError::RateLimited { retry_after } => Failure::RateLimited {
                retry_after: *retry_after,
            },
            SourceError::Transient(_) => Failure::Transient,
            SourceError::Permanent(_) => Failure::Permanent,
        }
    }
}

impl From<TokenError> for SourceError {
    fn from(e: TokenError) -> Self {
        SourceError::Permanent(e.to_string())
    }
}

/// Errors produced by a [`DestinationSink`](crate::DestinationSink) or the sink factory.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("non-sequential write: expected offset {expected}, got {actual}")]
    NonSequential { expected: u64, actual: u64 },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage backend rejected request: {0}")]
    Rejected(String),

    #[error("unsupported destination scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid destination address: {0}")]
    InvalidAddress(String),

    #[error("sink already closed")]
    Closed,
}

impl SinkError {
    /// Sink I/O and backend hiccups are retried; addressing and contract
    /// violations are not.
    pub fn failure(&self) -> Failure {
        match self {
            SinkError::Io(_) | SinkError::Backend(_) => Failure::Transient,
            _ => Failure::Permanent,
        }
    }
}

/// Credential acquisition failure reported by a [`TokenProvider`](crate::TokenProvider).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("token acquisition failed: {0}")]
pub struct TokenError(pub String);

/// Invalid engine configuration or transfer description.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Session-level error. Every terminal failure carries exactly one of these.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("fetch failed at offset {offset} after {attempts} attempt(s): {source}")]
    Source {
        offset: u64,
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("write failed at offset {offset} after {attempts} attempt(s): {source}")]
    Sink {
        offset: u64,
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("size lookup failed after {attempts} attempt(s): {source}")]
    Metadata {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("cannot open source: {0}")]
    SourceOpen(#[source] SourceError),

    #[error("cannot open destination: {0}")]
    Destination(#[source] SinkError),

    #[error("finalize failed after {attempts} attempt(s): {source}")]
    Finalize {
        attempts: u32,
        #[source]
        source: SinkError,
    },

    #[error("size mismatch: expected {expected} bytes, wrote {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("chunk out of order: expected offset {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },

    #[error("invalid transfer: {0}")]
    Config(#[from] ConfigError),

    #[error("cancelled")]
    Cancelled,

    #[error("session timed out after {0:?}")]
    TimedOut(Duration),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Source { source, .. }
            | TransferError::Metadata { source, .. }
            | TransferError::SourceOpen(source) => source.failure().kind(),
            TransferError::Sink { source, .. }
            | TransferError::Finalize { source, .. }
            | TransferError::Destination(source) => source.failure().kind(),
            TransferError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            TransferError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            TransferError::OutOfOrder { .. } | TransferError::Config(_) => ErrorKind::Permanent,
            TransferError::Cancelled | TransferError::TimedOut(_) => ErrorKind::Cancelled,
        }
    }

    /// Attempts made by the operation that produced this error.
    pub fn attempts(&self) -> u32 {
        match self {
            TransferError::Source { attempts, .. }
            | TransferError::Sink { attempts, .. }
            | TransferError::Metadata { attempts, .. }
            | TransferError::Finalize { attempts, .. } => *attempts,
            TransferError::Cancelled | TransferError::TimedOut(_) => 0,
            _ => 1,
        }
    }

    /// Byte offset of the failed chunk, when the failure is tied to one.
    pub fn offset(&self) -> Option<u64> {
        match self {
            TransferError::Source { offset, .. } | TransferError::Sink { offset, .. } => {
                Some(*offset)
            }
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransferError::Cancelled | TransferError::TimedOut(_))
    }
}
