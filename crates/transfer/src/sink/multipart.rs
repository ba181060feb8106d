use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::error::SinkError;
use crate::sink::{DestinationSink, StoreKind};

/// Default multipart part size: 8 MiB.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// A part acknowledged by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Multipart-upload API of an object store (S3, GCS, Azure block blobs).
///
/// Re-uploading a part number replaces it, so part uploads are safe to
/// retry. Nothing is visible at the key until `complete_upload` succeeds.
pub trait MultipartBackend: Send + Sync {
    fn create_upload<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<String, SinkError>>;

    fn upload_part<'a>(
        &'a self,
        upload_id: &'a str,
        part_number: u32,
        data: Bytes,
    ) -> BoxFuture<'a, Result<CompletedPart, SinkError>>;

    fn complete_upload<'a>(
        &'a self,
        upload_id: &'a str,
        parts: Vec<CompletedPart>,
    ) -> BoxFuture<'a, Result<(), SinkError>>;

    fn abort_upload<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), SinkError>>;
}

/// Buffers drained bytes into fixed-size parts and uploads each as it fills.
pub struct ObjectStoreSink {
    backend: Arc<dyn MultipartBackend>,
    bucket: String,
    key: String,
    address: String,
    part_size: usize,
    upload_id: Option<String>,
    pending: BytesMut,
    accepted: u64,
    parts: Vec<CompletedPart>,
    committed: bool,
    closed: bool,
}

impl ObjectStoreSink {
    pub fn new(
        backend: Arc<dyn MultipartBackend>,
        kind: StoreKind,
        bucket: impl Into<String>,
        key: impl Into<String>,
        part_size: usize,
    ) -> Self {
        let bucket = bucket.into();
        let key = key.into();
        Self {
            address: format!("{kind}://{bucket}/{key}"),
            backend,
            bucket,
            key,
            part_size: part_size.max(1),
            upload_id: None,
            pending: BytesMut::new(),
            accepted: 0,
            parts: Vec::new(),
            committed: false,
            closed: false,
        }
    }

    async fn ensure_upload(&mut self) -> Result<String, SinkError> {
        if let Some(id) = &self.upload_id {
            return Ok(id.clone());
        }
        let id = self.backend.create_upload(&self.bucket, &self.key).await?;
        debug!(address = %self.address, upload_id = %id, "multipart upload created");
        self.upload_id = Some(id.clone());
        Ok(id)
    }

    /// Uploads the first `len` pending bytes as the next part.
    async fn upload_next_part(&mut self, len: usize) -> Result<(), SinkError> {
        let upload_id = self.ensure_upload().await?;
        let part_number = self.parts.len() as u32 + 1;
        let data = Bytes::copy_from_slice(&self.pending[..len]);
        let part = self
            .backend
            .upload_part(&upload_id, part_number, data)
            .await?;
        // Only drop the bytes once the backend has them.
        self.pending.advance(len);
        self.parts.push(part);
        Ok(())
    }

    async fn flush_full_parts(&mut self) -> Result<(), SinkError> {
        while self.pending.len() >= self.part_size {
            self.upload_next_part(self.part_size).await?;
        }
        Ok(())
    }
}

impl DestinationSink for ObjectStoreSink {
    fn write_at(&mut self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if self.closed {
                return Err(SinkError::Closed);
            }
            if offset > self.accepted {
                return Err(SinkError::NonSequential {
                    expected: self.accepted,
                    actual: offset,
                });
            }
            let end = offset + data.len() as u64;
            if end > self.accepted {
                let skip = (self.accepted - offset) as usize;
                self.pending.extend_from_slice(&data[skip..]);
                self.accepted = end;
            }
            // A failed part upload keeps its bytes pending; the retried
            // write lands here again and flushes them.
            self.flush_full_parts().await
        })
    }

    fn finalize(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if self.committed {
                return Ok(());
            }
            if self.closed {
                return Err(SinkError::Closed);
            }
            self.flush_full_parts().await?;
            if !self.pending.is_empty() || self.parts.is_empty() {
                self.upload_next_part(self.pending.len()).await?;
            }
            let upload_id = self.ensure_upload().await?;
            self.backend
                .complete_upload(&upload_id, self.parts.clone())
                .await?;
            self.committed = true;
            self.closed = true;
            debug!(
                address = %self.address,
                parts = self.parts.len(),
                bytes = self.accepted,
                "multipart upload completed"
            );
            Ok(())
        })
    }

    fn abort(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed = true;
            self.pending.clear();
            if self.committed {
                return;
            }
            if let Some(upload_id) = self.upload_id.take()
                && let Err(e) = self.backend.abort_upload(&upload_id).await
            {
                warn!(
                    address = %self.address,
                    upload_id = %upload_id,
                    error = %e,
                    "failed to abort multipart upload"
                );
            }
        })
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeStore {
        uploads: Mutex<HashMap<String, Vec<(u32, Bytes)>>>,
        objects: Mutex<HashMap<String, Bytes>>,
        keys: Mutex<HashMap<String, String>>,
        aborted: Mutex<Vec<String>>,
        fail_next_parts: AtomicU32,
        next_id: AtomicU32,
    }

    impl MultipartBackend for FakeStore {
        fn create_upload<'a>(
            &'a self,
            bucket: &'a str,
            key: &'a str,
        ) -> BoxFuture<'a, Result<String, SinkError>> {
            Box::pin(async move {
                let id = format!("up-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                self.uploads.lock().unwrap().insert(id.clone(), Vec::new());
                self.keys
                    .lock()
                    .unwrap()
                    .insert(id.clone(), format!("{bucket}/{key}"));
                Ok(id)
            })
        }

        fn upload_part<'a>(
            &'a self,
            upload_id: &'a str,
            part_number: u32,
            data: Bytes,
        ) -> BoxFuture<'a, Result<CompletedPart, SinkError>> {
            Box::pin(async move {
                let remaining = self.fail_next_parts.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.fail_next_parts.store(remaining - 1, Ordering::SeqCst);
                    return Err(SinkError::Backend("503 slow down".into()));
                }
                let mut uploads = self.uploads.lock().unwrap();
                let parts = uploads
                    .get_mut(upload_id)
                    .ok_or_else(|| SinkError::Rejected("no such upload".into()))?;
                parts.retain(|(n, _)| *n != part_number);
                parts.push((part_number, data));
                Ok(CompletedPart {
                    part_number,
                    etag: format!("etag-{part_number}"),
                })
            })
        }

        fn complete_upload<'a>(
            &'a self,
            upload_id: &'a str,
            parts: Vec<CompletedPart>,
        ) -> BoxFuture<'a, Result<(), SinkError>> {
            Box::pin(async move {
                let mut stored = self
                    .uploads
                    .lock()
                    .unwrap()
                    .remove(upload_id)
                    .ok_or_else(|| SinkError::Rejected("no such upload".into()))?;
                stored.sort_by_key(|(n, _)| *n);
                assert_eq!(stored.len(), parts.len());
                let mut object = BytesMut::new();
                for (_, data) in stored {
                    object.extend_from_slice(&data);
                }
                let key = self.keys.lock().unwrap()[upload_id].clone();
                self.objects.lock().unwrap().insert(key, object.freeze());
                Ok(())
            })
        }

        fn abort_upload<'a>(&'a self, upload_id: &'a str) -> BoxFuture<'a, Result<(), SinkError>> {
            Box::pin(async move {
                self.uploads.lock().unwrap().remove(upload_id);
                self.aborted.lock().unwrap().push(upload_id.to_string());
                Ok(())
            })
        }
    }

    fn sink(store: &Arc<FakeStore>, part_size: usize) -> ObjectStoreSink {
        let backend: Arc<dyn MultipartBackend> = store.clone();
        ObjectStoreSink::new(backend, StoreKind::S3, "bucket", "dir/obj.bin", part_size)
    }

    #[tokio::test]
    async fn uploads_parts_and_completes() {
        let store = Arc::new(FakeStore::default());
        let mut sink = sink(&store, 4);
        assert_eq!(sink.address(), "s3://bucket/dir/obj.bin");

        sink.write_at(0, Bytes::from_static(b"abcdef")).await.unwrap();
        assert_eq!(sink.parts.len(), 1);
        sink.write_at(6, Bytes::from_static(b"ghij")).await.unwrap();
        assert_eq!(sink.parts.len(), 2);
        assert!(store.objects.lock().unwrap().is_empty());

        sink.finalize().await.unwrap();
        assert_eq!(sink.parts.len(), 3);
        assert_eq!(
            store.objects.lock().unwrap()["bucket/dir/obj.bin"],
            Bytes::from_static(b"abcdefghij")
        );
    }

    #[tokio::test]
    async fn failed_part_is_retried_by_rewrite() {
        let store = Arc::new(FakeStore::default());
        let mut sink = sink(&store, 4);
        store.fail_next_parts.store(1, Ordering::SeqCst);

        let err = sink.write_at(0, Bytes::from_static(b"abcd")).await.unwrap_err();
        assert!(matches!(err, SinkError::Backend(_)));
        // Engine retries the same write; the range is already buffered.
        sink.write_at(0, Bytes::from_static(b"abcd")).await.unwrap();
        sink.finalize().await.unwrap();
        assert_eq!(
            store.objects.lock().unwrap()["bucket/dir/obj.bin"],
            Bytes::from_static(b"abcd")
        );
    }

    #[tokio::test]
    async fn abort_discards_upload() {
        let store = Arc::new(FakeStore::default());
        let mut sink = sink(&store, 2);
        sink.write_at(0, Bytes::from_static(b"abc")).await.unwrap();
        sink.abort().await;

        assert!(store.objects.lock().unwrap().is_empty());
        assert_eq!(store.aborted.lock().unwrap().len(), 1);
        assert!(store.uploads.lock().unwrap().is_empty());
        assert!(matches!(sink.finalize().await, Err(SinkError::Closed)));
    }

    #[tokio::test]
    async fn abort_before_any_part_touches_nothing() {
        let store = Arc::new(FakeStore::default());
        let mut sink = sink(&store, 8);
        sink.write_at(0, Bytes::from_static(b"abc")).await.unwrap();
        sink.abort().await;
        assert!(store.aborted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_object_uploads_single_empty_part() {
        let store = Arc::new(FakeStore::default());
        let mut sink = sink(&store, 8);
        sink.finalize().await.unwrap();
        assert_eq!(store.objects.lock().unwrap()["bucket/dir/obj.bin"].len(), 0);
    }
}
