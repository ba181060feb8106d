//! Engine configuration.
//!
//! Stored as JSON. Every field has a default, so a partial file (or `{}`)
//! is valid:
//!
//! ```json
//! {
//!   "chunk_size": 1048576,
//!   "buffer": { "chunks": 8 },
//!   "retry": { "chunk_max_attempts": 5, "base_delay_ms": 1000 },
//!   "io_timeout_ms": 60000
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{DEFAULT_BUFFER_CHUNKS, DEFAULT_CHUNK_SIZE};

/// Bounded-buffer capacity, in chunks or bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferCapacity {
    Chunks(usize),
    /// Rounded down to whole chunks.
    Bytes(u64),
}

impl Default for BufferCapacity {
    fn default() -> Self {
        BufferCapacity::Chunks(DEFAULT_BUFFER_CHUNKS)
    }
}

impl BufferCapacity {
    /// Capacity in chunks for the given chunk size.
    pub fn chunk_count(&self, chunk_size: u64) -> Result<usize, ConfigError> {
        let count = match *self {
            BufferCapacity::Chunks(n) => n,
            BufferCapacity::Bytes(bytes) => {
                if chunk_size == 0 {
                    return Err(ConfigError::Invalid("chunk size must be positive".into()));
                }
                usize::try_from(bytes / chunk_size).unwrap_or(usize::MAX)
            }
        };
        if count == 0 {
            return Err(ConfigError::Invalid(format!(
                "buffer capacity {self:?} holds less than one {chunk_size}-byte chunk"
            )));
        }
        Ok(count)
    }
}

/// Retry budgets and backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per chunk fetch, chunk write, or finalize.
    pub chunk_max_attempts: u32,
    /// Attempts per size lookup / listing call.
    pub metadata_max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on a server-supplied `Retry-After`.
    pub rate_limit_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            chunk_max_attempts: 5,
            metadata_max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            rate_limit_cap_ms: 120_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn rate_limit_cap(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cap_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunk_size: u64,
    pub buffer: BufferCapacity,
    pub retry: RetryConfig,
    /// Per-operation timeout for a single fetch, write, or finalize.
    pub io_timeout_ms: u64,
    /// Wall-clock limit for a whole session. `None` means unlimited.
    pub session_timeout_ms: Option<u64>,
    /// Minimum spacing of [`LogReporter`](crate::LogReporter) lines.
    pub progress_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            buffer: BufferCapacity::default(),
            retry: RetryConfig::default(),
            io_timeout_ms: 60_000,
            session_timeout_ms: None,
            progress_interval_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Loads a config file, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to load engine config, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        self.buffer.chunk_count(self.chunk_size)?;
        if self.retry.chunk_max_attempts == 0 || self.retry.metadata_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry budgets must allow at least one attempt".into(),
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::Invalid("io_timeout_ms must be positive".into()));
        }
        if self.session_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "session_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }

    pub fn buffer_chunks(&self) -> Result<usize, ConfigError> {
        self.buffer.chunk_count(self.chunk_size)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout_ms.map(Duration::from_millis)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
