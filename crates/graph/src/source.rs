//! Ranged content reads.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, HeaderMap, RANGE};
use spfetch_transfer::{BoxFuture, Chunk, ChunkSource, Failure, SourceError, TokenProvider};
use tracing::trace;

use crate::error::{classify_status, error_body, parse_retry_after, reqwest_failure};

/// Fetches byte ranges of one object with `Range` requests.
///
/// One request per call; the engine decides whether to retry.
pub struct HttpChunkSource {
    http: reqwest::Client,
    url: String,
    token: Arc<dyn TokenProvider>,
}

impl HttpChunkSource {
    pub fn new(http: reqwest::Client, url: impl Into<String>, token: Arc<dyn TokenProvider>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_range(&self, offset: u64, length: u64) -> Result<Chunk, SourceError> {
        if length == 0 {
            return Ok(Chunk::final_chunk(offset, Bytes::new()));
        }
        let token = self.token.token().await?;
        let last = offset + length - 1;
        let mut resp = self
            .http
            .get(&self.url)
            .bearer_auth(token)
            .header(RANGE, format!("bytes={offset}-{last}"))
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status();
        trace!(url = %self.url, offset, length, status = status.as_u16(), "range response");

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = content_range_total(resp.headers());
                let Some(data) = read_body_limited(&mut resp, length)
                    .await
                    .map_err(transport_error)?
                else {
                    return Err(SourceError::Permanent(format!(
                        "server sent more than {length} bytes for the range at offset {offset}"
                    )));
                };
                let len = data.len() as u64;
                let is_final = len < length || total.is_some_and(|t| offset + len >= t);
                Ok(Chunk {
                    offset,
                    data,
                    is_final,
                    total_size: total,
                })
            }
            StatusCode::OK => {
                if offset != 0 {
                    return Err(SourceError::Permanent(format!(
                        "server ignored range request at offset {offset}"
                    )));
                }
                let Some(data) = read_body_limited(&mut resp, length)
                    .await
                    .map_err(transport_error)?
                else {
                    return Err(SourceError::Permanent(format!(
                        "server ignored range request and sent an object larger than {length} bytes"
                    )));
                };
                let len = data.len() as u64;
                Ok(Chunk::final_chunk(offset, data).with_total_size(Some(len)))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let total = content_range_total(resp.headers());
                Ok(Chunk::final_chunk(offset, Bytes::new()).with_total_size(total))
            }
            _ => {
                let retry_after = parse_retry_after(resp.headers());
                let body = error_body(resp).await;
                Err(status_error(status, retry_after, &body))
            }
        }
    }
}

impl ChunkSource for HttpChunkSource {
    fn fetch(&self, offset: u64, length: u64) -> BoxFuture<'_, Result<Chunk, SourceError>> {
        Box::pin(self.fetch_range(offset, length))
    }
}

/// Reads the body, stopping once it exceeds `limit` bytes.
///
/// `Ok(None)` means the body is longer than `limit`; at most one network
/// read past the limit is buffered before giving up.
async fn read_body_limited(
    resp: &mut reqwest::Response,
    limit: u64,
) -> Result<Option<Bytes>, reqwest::Error> {
    if resp.content_length().is_some_and(|n| n > limit) {
        return Ok(None);
    }
    let mut buf = BytesMut::new();
    while let Some(piece) = resp.chunk().await? {
        if (buf.len() + piece.len()) as u64 > limit {
            return Ok(None);
        }
        buf.extend_from_slice(&piece);
    }
    Ok(Some(buf.freeze()))
}

fn transport_error(e: reqwest::Error) -> SourceError {
    match reqwest_failure(&e) {
        Failure::Permanent => SourceError::Permanent(e.to_string()),
        _ => SourceError::Transient(e.to_string()),
    }
}

fn status_error(
    status: StatusCode,
    retry_after: Option<std::time::Duration>,
    body: &str,
) -> SourceError {
    let snippet: String = body.chars().take(200).collect();
    match classify_status(status, retry_after) {
        Failure::RateLimited { retry_after } => SourceError::RateLimited { retry_after },
        Failure::Transient => SourceError::Transient(format!("HTTP {status}: {snippet}")),
        Failure::Permanent => SourceError::Permanent(format!("HTTP {status}: {snippet}")),
    }
}

/// Total length from `Content-Range: bytes a-b/total` or `bytes */total`.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}
