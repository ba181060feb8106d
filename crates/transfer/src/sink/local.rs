use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::error::SinkError;
use crate::sink::DestinationSink;
use crate::validation::validate_destination_path;

/// Writes into a hidden staging file next to the target, then fsyncs and
/// renames it into place on finalize. The target is never partially written.
pub struct LocalFileSink {
    target: PathBuf,
    staging: PathBuf,
    address: String,
    file: Option<File>,
    written: u64,
    committed: bool,
}

impl LocalFileSink {
    /// Creates parent directories and the staging file.
    pub async fn create(target: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let target = target.into();
        validate_destination_path(&target)?;

        if let Some(parent) = target.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::metadata(&target)
            .await
            .is_ok_and(|meta| meta.is_dir())
        {
            return Err(SinkError::InvalidAddress(format!(
                "destination is a directory: {}",
                target.display()
            )));
        }

        let staging = staging_path(&target);
        let file = File::create(&staging).await?;
        debug!(
            target = %target.display(),
            staging = %staging.display(),
            "opened local sink"
        );
        Ok(Self {
            address: format!("file://{}", target.display()),
            target,
            staging,
            file: Some(file),
            written: 0,
            committed: false,
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging
    }
}

fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tag = uuid::Uuid::new_v4().simple().to_string();
    target.with_file_name(format!(".{name}.{}.part", &tag[..12]))
}

impl DestinationSink for LocalFileSink {
    fn write_at(&mut self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if offset > self.written {
                return Err(SinkError::NonSequential {
                    expected: self.written,
                    actual: offset,
                });
            }
            let file = self.file.as_mut().ok_or(SinkError::Closed)?;
            // Rewriting an accepted range with identical bytes is harmless.
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            self.written = self.written.max(offset + data.len() as u64);
            Ok(())
        })
    }

    fn finalize(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if self.committed {
                return Ok(());
            }
            if let Some(file) = self.file.as_mut() {
                file.flush().await?;
                file.sync_all().await?;
            }
            // Keep the handle until the rename lands so a failed rename can be retried.
            tokio::fs::rename(&self.staging, &self.target).await?;
            self.file = None;
            self.committed = true;
            debug!(
                target = %self.target.display(),
                bytes = self.written,
                "local sink committed"
            );
            Ok(())
        })
    }

    fn abort(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.file = None;
            if self.committed {
                return;
            }
            match tokio::fs::remove_file(&self.staging).await {
                Ok(()) => debug!(staging = %self.staging.display(), "removed staging file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    staging = %self.staging.display(),
                    error = %e,
                    "failed to remove staging file"
                ),
            }
        })
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_renames_staging_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/out.bin");

        let mut sink = LocalFileSink::create(&target).await.unwrap();
        let staging = sink.staging_path().to_path_buf();
        assert!(staging.exists());
        assert!(!target.exists());

        sink.write_at(0, Bytes::from_static(b"hello ")).await.unwrap();
        sink.write_at(6, Bytes::from_static(b"world")).await.unwrap();
        // Retried write of the same chunk.
        sink.write_at(6, Bytes::from_static(b"world")).await.unwrap();
        assert!(!target.exists());

        sink.finalize().await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        assert!(!staging.exists());

        // Finalize is idempotent once committed.
        sink.finalize().await.unwrap();
        sink.abort().await;
        assert!(target.exists());
    }

    #[tokio::test]
    async fn abort_removes_staging_and_leaves_target_alone() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        std::fs::write(&target, b"previous").unwrap();

        let mut sink = LocalFileSink::create(&target).await.unwrap();
        let staging = sink.staging_path().to_path_buf();
        sink.write_at(0, Bytes::from_static(b"partial")).await.unwrap();
        sink.abort().await;

        assert!(!staging.exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"previous");
        assert!(matches!(
            sink.write_at(7, Bytes::from_static(b"x")).await,
            Err(SinkError::Closed)
        ));
    }

    #[tokio::test]
    async fn rejects_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = LocalFileSink::create(dir.path().join("gap.bin")).await.unwrap();
        let err = sink.write_at(100, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, SinkError::NonSequential { expected: 0, actual: 100 }));
        sink.abort().await;
    }

    #[tokio::test]
    async fn rejects_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let err = match LocalFileSink::create(dir.path().to_path_buf()).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, SinkError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn empty_object_commits_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("empty.bin");
        let mut sink = LocalFileSink::create(&target).await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(std::fs::metadata(&target).unwrap().len(), 0);
    }
}
