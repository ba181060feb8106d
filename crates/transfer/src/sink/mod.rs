//! Destination sinks and address resolution.
//!
//! A sink accepts contiguous writes in offset order and exposes two terminal
//! operations: `finalize` commits the object, `abort` discards partial data.
//! Writes of an already-accepted range are idempotent so the engine can
//! retry a write whose outcome is unknown.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::BoxFuture;
use crate::error::SinkError;
use crate::validation::{validate_destination_path, validate_object_key};

mod local;
mod memory;
mod multipart;

pub use local::LocalFileSink;
pub use memory::{MemorySink, MemoryStore};
pub use multipart::{CompletedPart, DEFAULT_PART_SIZE, MultipartBackend, ObjectStoreSink};

/// Receives drained chunks and owns the committed result.
pub trait DestinationSink: Send {
    fn write_at(&mut self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), SinkError>>;

    /// Makes the written bytes visible at the destination. Retryable.
    fn finalize(&mut self) -> BoxFuture<'_, Result<(), SinkError>>;

    /// Discards partial output. Best effort; never fails.
    fn abort(&mut self) -> BoxFuture<'_, ()>;

    fn address(&self) -> &str;
}

/// Object-store family selected by the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    S3,
    Gcs,
    Azure,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::S3 => f.write_str("s3"),
            StoreKind::Gcs => f.write_str("gcs"),
            StoreKind::Azure => f.write_str("azure"),
        }
    }
}

/// Parsed destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationAddress {
    /// `file:///path` or a bare path.
    Local(PathBuf),
    /// `memory://name`.
    Memory(String),
    /// `s3://bucket/key`, `gs://bucket/key`, `az://container/key`, ...
    ObjectStore {
        kind: StoreKind,
        bucket: String,
        key: String,
    },
}

impl DestinationAddress {
    pub fn parse(address: &str) -> Result<Self, SinkError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SinkError::InvalidAddress("empty destination".into()));
        }

        let Some((scheme, rest)) = address.split_once("://") else {
            let path = PathBuf::from(address);
            validate_destination_path(&path)?;
            return Ok(DestinationAddress::Local(path));
        };

        let kind = match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                let path = PathBuf::from(rest);
                validate_destination_path(&path)?;
                return Ok(DestinationAddress::Local(path));
            }
            "memory" | "mem" => {
                if rest.is_empty() {
                    return Err(SinkError::InvalidAddress(format!(
                        "memory destination needs a name: {address}"
                    )));
                }
                return Ok(DestinationAddress::Memory(rest.to_string()));
            }
            "s3" | "s3a" => StoreKind::S3,
            "gs" | "gcs" => StoreKind::Gcs,
            "az" | "abfs" | "abfss" => StoreKind::Azure,
            other => return Err(SinkError::UnsupportedScheme(other.to_string())),
        };

        let Some((bucket, key)) = rest.split_once('/') else {
            return Err(SinkError::InvalidAddress(format!(
                "object-store destination needs bucket and key: {address}"
            )));
        };
        if bucket.is_empty() {
            return Err(SinkError::InvalidAddress(format!(
                "empty bucket in destination: {address}"
            )));
        }
        validate_object_key(key)?;
        Ok(DestinationAddress::ObjectStore {
            kind,
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl fmt::Display for DestinationAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationAddress::Local(path) => write!(f, "file://{}", path.display()),
            DestinationAddress::Memory(name) => write!(f, "memory://{name}"),
            DestinationAddress::ObjectStore { kind, bucket, key } => {
                write!(f, "{kind}://{bucket}/{key}")
            }
        }
    }
}

/// Opens sinks from destination addresses.
///
/// Object-store schemes need a [`MultipartBackend`] registered for their
/// [`StoreKind`]; without one the scheme is reported as unsupported.
pub struct SinkFactory {
    backends: HashMap<StoreKind, Arc<dyn MultipartBackend>>,
    memory: MemoryStore,
    part_size: usize,
}

impl Default for SinkFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkFactory {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            memory: MemoryStore::default(),
            part_size: DEFAULT_PART_SIZE,
        }
    }

    pub fn with_backend(mut self, kind: StoreKind, backend: Arc<dyn MultipartBackend>) -> Self {
        self.backends.insert(kind, backend);
        self
    }

    pub fn with_memory_store(mut self, store: MemoryStore) -> Self {
        self.memory = store;
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Store that finalized `memory://` sinks publish into.
    pub fn memory_store(&self) -> &MemoryStore {
        &self.memory
    }

    pub async fn open(&self, address: &str) -> Result<Box<dyn DestinationSink>, SinkError> {
        match DestinationAddress::parse(address)? {
            DestinationAddress::Local(path) => Ok(Box::new(LocalFileSink::create(path).await?)),
            DestinationAddress::Memory(name) => {
                Ok(Box::new(MemorySink::new(name, self.memory.clone())))
            }
            DestinationAddress::ObjectStore { kind, bucket, key } => {
                let backend = self
                    .backends
                    .get(&kind)
                    .ok_or_else(|| SinkError::UnsupportedScheme(format!("{kind} (no backend)")))?;
                Ok(Box::new(ObjectStoreSink::new(
                    Arc::clone(backend),
                    kind,
                    bucket,
                    key,
                    self.part_size,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_paths() {
        assert_eq!(
            DestinationAddress::parse("/tmp/out.bin").unwrap(),
            DestinationAddress::Local(PathBuf::from("/tmp/out.bin"))
        );
        assert_eq!(
            DestinationAddress::parse("file:///tmp/out.bin").unwrap(),
            DestinationAddress::Local(PathBuf::from("/tmp/out.bin"))
        );
        assert!(DestinationAddress::parse("file:///tmp/../etc/passwd").is_err());
    }

    #[test]
    fn parses_memory_and_object_stores() {
        assert_eq!(
            DestinationAddress::parse("memory://report").unwrap(),
            DestinationAddress::Memory("report".into())
        );
        assert_eq!(
            DestinationAddress::parse("s3://bucket/reports/q1.csv").unwrap(),
            DestinationAddress::ObjectStore {
                kind: StoreKind::S3,
                bucket: "bucket".into(),
                key: "reports/q1.csv".into(),
            }
        );
        assert!(matches!(
            DestinationAddress::parse("gs://b/k").unwrap(),
            DestinationAddress::ObjectStore {
                kind: StoreKind::Gcs,
                ..
            }
        ));
        assert!(matches!(
            DestinationAddress::parse("abfss://container@acct.dfs.core.windows.net/k").unwrap(),
            DestinationAddress::ObjectStore {
                kind: StoreKind::Azure,
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(matches!(
            DestinationAddress::parse("ftp://host/file"),
            Err(SinkError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(DestinationAddress::parse("").is_err());
        assert!(DestinationAddress::parse("s3://bucket").is_err());
        assert!(DestinationAddress::parse("s3:///key").is_err());
        assert!(DestinationAddress::parse("memory://").is_err());
    }

    #[test]
    fn display_round_trips_scheme() {
        let addr = DestinationAddress::parse("s3://b/k.bin").unwrap();
        assert_eq!(addr.to_string(), "s3://b/k.bin");
    }

    #[tokio::test]
    async fn factory_without_backend_rejects_object_store() {
        let factory = SinkFactory::new();
        let err = match factory.open("s3://bucket/key").await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, SinkError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn factory_opens_memory_sink() {
        let factory = SinkFactory::new();
        let mut sink = factory.open("memory://greeting").await.unwrap();
        sink.write_at(0, Bytes::from_static(b"hello")).await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(
            factory.memory_store().get("greeting").unwrap(),
            Bytes::from_static(b"hello")
        );
    }
}
