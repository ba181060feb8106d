use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};

use crate::BoxFuture;
use crate::error::SinkError;
use crate::sink::DestinationSink;

/// Shared map of finalized in-memory objects, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.lock().get(name).cloned()
    }

    pub fn take(&self, name: &str) -> Option<Bytes> {
        self.lock().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn insert(&self, name: String, data: Bytes) {
        self.lock().insert(name, data);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Bytes>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accumulates the object in memory; publishes to a [`MemoryStore`] on finalize.
pub struct MemorySink {
    name: String,
    address: String,
    buf: BytesMut,
    store: MemoryStore,
    closed: bool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>, store: MemoryStore) -> Self {
        let name = name.into();
        Self {
            address: format!("memory://{name}"),
            name,
            buf: BytesMut::new(),
            store,
            closed: false,
        }
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.buf.len() as u64
    }
}

impl DestinationSink for MemorySink {
    fn write_at(&mut self, offset: u64, data: Bytes) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if self.closed {
                return Err(SinkError::Closed);
            }
            let accepted = self.buf.len() as u64;
            let end = offset + data.len() as u64;
            if offset > accepted {
                return Err(SinkError::NonSequential {
                    expected: accepted,
                    actual: offset,
                });
            }
            if end > accepted {
                let skip = (accepted - offset) as usize;
                self.buf.extend_from_slice(&data[skip..]);
            }
            Ok(())
        })
    }

    fn finalize(&mut self) -> BoxFuture<'_, Result<(), SinkError>> {
        Box::pin(async move {
            if self.closed {
                return Err(SinkError::Closed);
            }
            let data = std::mem::take(&mut self.buf).freeze();
            self.store.insert(self.name.clone(), data);
            self.closed = true;
            Ok(())
        })
    }

    fn abort(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.buf.clear();
            self.closed = true;
        })
    }

    fn address(&self) -> &str {
        &self.address
    }
}
