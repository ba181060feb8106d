//! Collaborator seams on the read side.

use std::sync::Arc;

use crate::BoxFuture;
use crate::error::{SourceError, TokenError};
use crate::types::Chunk;

/// Ranged reader over one remote object.
///
/// Implementations perform a single attempt per call and classify failures
/// as [`SourceError`]; the engine owns all retrying. A call may return fewer
/// than `length` bytes only at end of object.
pub trait ChunkSource: Send + Sync {
    fn fetch(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Chunk, SourceError>>;
}

/// Resolves the size of an object before the pipeline starts.
pub trait MetadataSource: Send + Sync {
    /// `Ok(None)` means the size is unknown and the pipeline runs until a
    /// short or final chunk.
    fn resolve_size<'a>(
        &'a self,
        object_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<u64>, SourceError>>;
}

/// Opens a [`ChunkSource`] for an object id.
pub trait SourceOpener: Send + Sync {
    fn open(&self, object_id: &str) -> Result<Box<dyn ChunkSource>, SourceError>;
}

/// Supplies bearer tokens to HTTP-backed sources.
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> BoxFuture<'_, Result<String, TokenError>>;
}

impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    fn token(&self) -> BoxFuture<'_, Result<String, TokenError>> {
        (**self).token()
    }
}

/// A fixed, pre-acquired access token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> BoxFuture<'_, Result<String, TokenError>> {
        Box::pin(async move {
            if self.0.is_empty() {
                Err(TokenError("empty access token".into()))
            } else {
                Ok(self.0.clone())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_token_returns_value() {
        let token = StaticToken::new("abc123");
        assert_eq!(token.token().await.unwrap(), "abc123");
        assert_eq!(format!("{token:?}"), "StaticToken(***)");
    }

    #[tokio::test]
    async fn empty_static_token_fails() {
        let token: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(""));
        assert!(token.token().await.is_err());
    }
}
