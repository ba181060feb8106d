use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use spfetch_transfer::{ConfigError, Failure, SourceError, TokenError, TransferFailure};

/// Errors from the Graph adapter.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<GraphError>,
    },

    #[error(transparent)]
    Transfer(#[from] TransferFailure),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GraphError {
    /// Retry classification of this error.
    pub fn failure(&self) -> Failure {
        match self {
            Self::Http(e) => reqwest_failure(e),
            Self::Api {
                status,
                retry_after,
                ..
            } => match StatusCode::from_u16(*status) {
                Ok(status) => classify_status(status, *retry_after),
                Err(_) => Failure::Permanent,
            },
            Self::Exhausted { source, .. } => source.failure(),
            Self::Json(_)
            | Self::Token(_)
            | Self::Protocol(_)
            | Self::Cancelled
            | Self::Transfer(_)
            | Self::Config(_) => Failure::Permanent,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Exhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<GraphError> for SourceError {
    fn from(e: GraphError) -> Self {
        match e.failure() {
            Failure::RateLimited { retry_after } => SourceError::RateLimited { retry_after },
            Failure::Transient => SourceError::Transient(e.to_string()),
            Failure::Permanent => SourceError::Permanent(e.to_string()),
        }
    }
}

/// 429 is rate limiting, 408 and 5xx are transient, anything else is permanent.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Failure {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Failure::RateLimited { retry_after }
    } else if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        Failure::Transient
    } else {
        Failure::Permanent
    }
}

pub(crate) fn reqwest_failure(e: &reqwest::Error) -> Failure {
    if e.is_builder() {
        Failure::Permanent
    } else {
        Failure::Transient
    }
}

/// Bytes of an error body kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 4096;

/// Leading part of an error response body, lossily decoded.
pub(crate) async fn error_body(mut resp: reqwest::Response) -> String {
    let mut buf = Vec::new();
    while buf.len() < ERROR_BODY_LIMIT {
        match resp.chunk().await {
            Ok(Some(piece)) => buf.extend_from_slice(&piece),
            _ => break,
        }
    }
    buf.truncate(ERROR_BODY_LIMIT);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Reads `Retry-After` as whole or fractional seconds.
///
/// HTTP-date values are ignored; the caller falls back to backoff.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = value.parse().ok()?;
    // Out-of-range values fall back to backoff.
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn retry_after(value: &str) -> Option<Duration> {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        parse_retry_after(&headers)
    }

    #[test]
    fn retry_after_seconds() {
        assert_eq!(retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(retry_after("0.1"), Some(Duration::from_millis(100)));
        assert_eq!(retry_after(" 2 "), Some(Duration::from_secs(2)));
    }

    #[test]
    fn retry_after_rejects_dates_and_negatives() {
        assert_eq!(retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
        assert_eq!(retry_after("-1"), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn retry_after_rejects_unrepresentable_values() {
        assert_eq!(retry_after("1e30"), None);
        assert_eq!(retry_after("inf"), None);
        assert_eq!(retry_after("NaN"), None);
    }

    #[test]
    fn status_classification() {
        let hint = Some(Duration::from_secs(1));
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, hint),
            Failure::RateLimited { retry_after: hint }
        );
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT, None), Failure::Transient);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY, None), Failure::Transient);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE, None), Failure::Transient);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED, None), Failure::Permanent);
        assert_eq!(classify_status(StatusCode::FORBIDDEN, None), Failure::Permanent);
        assert_eq!(classify_status(StatusCode::NOT_FOUND, None), Failure::Permanent);
    }

    #[test]
    fn api_error_converts_to_source_error() {
        let err = GraphError::Api {
            status: 429,
            body: String::new(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            SourceError::from(err),
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );

        let err = GraphError::Api {
            status: 503,
            body: "busy".into(),
            retry_after: None,
        };
        assert!(matches!(SourceError::from(err), SourceError::Transient(_)));

        let err = GraphError::Protocol("folder".into());
        assert!(matches!(SourceError::from(err), SourceError::Permanent(_)));
    }

    #[test]
    fn exhausted_keeps_inner_classification() {
        let err = GraphError::Exhausted {
            attempts: 3,
            source: Box::new(GraphError::Api {
                status: 500,
                body: String::new(),
                retry_after: None,
            }),
        };
        assert_eq!(err.failure(), Failure::Transient);
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("3 attempts"));
    }
}
