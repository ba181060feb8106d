use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{ConfigError, ErrorKind, TransferError};

/// Immutable description of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSpec {
    /// Identifier the source and metadata collaborators understand.
    pub object_id: String,
    /// Declared size in bytes, if known up front.
    #[serde(default)]
    pub total_size: Option<u64>,
    pub chunk_size: u64,
    /// Bounded-buffer capacity, in chunks.
    pub buffer_chunks: usize,
    /// Destination address (`file://`, `memory://`, `s3://`, ...).
    pub destination: String,
    /// Hex SHA-256 of the whole object, verified before finalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_sha256: Option<String>,
}

impl TransferSpec {
    /// Builds a transfer description using the chunk size and buffer capacity from `config`.
    pub fn new(
        object_id: impl Into<String>,
        destination: impl Into<String>,
        config: &EngineConfig,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            object_id: object_id.into(),
            total_size: None,
            chunk_size: config.chunk_size,
            buffer_chunks: config.buffer_chunks()?,
            destination: destination.into(),
            expected_sha256: None,
        })
    }

    pub fn with_total_size(mut self, total_size: Option<u64>) -> Self {
        self.total_size = total_size;
        self
    }

    pub fn with_expected_sha256(mut self, digest: impl Into<String>) -> Self {
        self.expected_sha256 = Some(digest.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.object_id.is_empty() {
            return Err(ConfigError::Invalid("object id is empty".into()));
        }
        if self.destination.is_empty() {
            return Err(ConfigError::Invalid("destination is empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk size must be positive".into()));
        }
        if self.buffer_chunks == 0 {
            return Err(ConfigError::Invalid(
                "buffer capacity must hold at least one chunk".into(),
            ));
        }
        if let Some(digest) = &self.expected_sha256
            && (digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()))
        {
            return Err(ConfigError::Invalid(format!(
                "expected SHA-256 is not a 64-digit hex string: {digest}"
            )));
        }
        Ok(())
    }

    /// Upper bound on bytes held in memory by the buffer.
    pub fn max_buffered_bytes(&self) -> u64 {
        self.chunk_size.saturating_mul(self.buffer_chunks as u64)
    }
}

/// A contiguous slice of the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset within the object.
    pub offset: u64,
    pub data: Bytes,
    /// No bytes follow this chunk.
    pub is_final: bool,
    /// Whole-object size if the source learned it (e.g. from `Content-Range`).
    pub total_size: Option<u64>,
}

impl Chunk {
    pub fn new(offset: u64, data: Bytes) -> Self {
        Self {
            offset,
            data,
            is_final: false,
            total_size: None,
        }
    }

    pub fn final_chunk(offset: u64, data: Bytes) -> Self {
        Self {
            is_final: true,
            ..Self::new(offset, data)
        }
    }

    pub fn with_total_size(mut self, total_size: Option<u64>) -> Self {
        self.total_size = total_size;
        self
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.len()
    }
}

/// Session lifecycle.
///
/// `Idle -> Running <-> Retrying -> {Completed | Failed | Cancelled}`.
/// A session may also fail or be cancelled straight from `Idle`
/// (size lookup or open failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Idle,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Failed)
                | (Idle, Cancelled)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Running | Retrying, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::Idle => "idle",
            TransferState::Running => "running",
            TransferState::Retrying => "retrying",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Pipeline stage, used to tag progress events and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Drain,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetch => f.write_str("fetch"),
            Stage::Drain => f.write_str("drain"),
        }
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub session_id: Uuid,
    pub object_id: String,
    pub destination: String,
    pub bytes_transferred: u64,
    pub chunks: u64,
    pub elapsed: Duration,
    /// Hex SHA-256 of the bytes written.
    pub sha256: String,
    pub fetch_retries: u32,
    pub drain_retries: u32,
    /// Total time spent sleeping between attempts.
    pub backoff: Duration,
}

impl TransferReport {
    /// Average throughput in bytes per second over the whole session.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }
}

/// Terminal failure of a session.
#[derive(Debug, thiserror::Error)]
#[error("transfer {state}: {error}")]
pub struct TransferFailure {
    pub session_id: Uuid,
    /// `Failed` or `Cancelled`.
    pub state: TransferState,
    #[source]
    pub error: TransferError,
    /// Attempts made by the operation that gave up.
    pub attempts: u32,
    pub bytes_written: u64,
    pub backoff: Duration,
    pub elapsed: Duration,
}

impl TransferFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TransferSpec {
        TransferSpec {
            object_id: "obj".into(),
            total_size: Some(10),
            chunk_size: 4,
            buffer_chunks: 2,
            destination: "memory://out".into(),
            expected_sha256: None,
        }
    }

    #[test]
    fn spec_validation() {
        assert!(spec().validate().is_ok());

        let mut s = spec();
        s.chunk_size = 0;
        assert!(s.validate().is_err());

        let mut s = spec();
        s.buffer_chunks = 0;
        assert!(s.validate().is_err());

        let s = spec().with_expected_sha256("not-hex");
        assert!(s.validate().is_err());

        let s = spec().with_expected_sha256("a".repeat(64));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn spec_from_config() {
        let config = EngineConfig::default();
        let s = TransferSpec::new("obj", "memory://x", &config).unwrap();
        assert_eq!(s.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(s.buffer_chunks, crate::DEFAULT_BUFFER_CHUNKS);
        assert_eq!(s.max_buffered_bytes(), 8 * 1024 * 1024);
        assert_eq!(s.total_size, None);
    }

    #[test]
    fn chunk_geometry() {
        let c = Chunk::new(100, Bytes::from_static(b"abcd"));
        assert_eq!(c.len(), 4);
        assert_eq!(c.end(), 104);
        assert!(!c.is_final);

        let f = Chunk::final_chunk(104, Bytes::new());
        assert!(f.is_final);
        assert!(f.is_empty());
        assert_eq!(f.end(), 104);
    }

    #[test]
    fn state_transitions() {
        use TransferState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Running));
        assert!(Retrying.can_transition_to(Failed));
        assert!(Idle.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Retrying));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Failed));

        assert!(Completed.is_terminal());
        assert!(!Retrying.is_terminal());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&TransferState::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
    }

    #[test]
    fn report_throughput() {
        let report = TransferReport {
            session_id: Uuid::new_v4(),
            object_id: "o".into(),
            destination: "memory://o".into(),
            bytes_transferred: 2000,
            chunks: 2,
            elapsed: Duration::from_secs(2),
            sha256: String::new(),
            fetch_retries: 0,
            drain_retries: 0,
            backoff: Duration::ZERO,
        };
        assert!((report.throughput() - 1000.0).abs() < f64::EPSILON);
    }
}
