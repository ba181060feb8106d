//! Retry policy: a pure function from (context, failure) to a decision.
//!
//! The policy never sleeps. Callers record the failure in a [`RetryContext`],
//! ask [`RetryPolicy::next_delay`], and wait (cancellably) themselves.
//! [`run_with_retry`] wraps that loop for operations that only borrow shared
//! state.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::Failure;

/// Which retry budget applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Size lookups, listings, id resolution.
    Metadata,
    /// Chunk fetches, chunk writes, finalize.
    Chunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Per-operation retry bookkeeping. Reset after every success.
#[derive(Debug, Clone)]
pub struct RetryContext {
    class: OperationClass,
    attempts: u32,
    waited: Duration,
    last_failure: Option<Failure>,
}

impl RetryContext {
    pub fn new(class: OperationClass) -> Self {
        Self {
            class,
            attempts: 0,
            waited: Duration::ZERO,
            last_failure: None,
        }
    }

    pub fn record_failure(&mut self, failure: Failure) {
        self.attempts += 1;
        self.last_failure = Some(failure);
    }

    pub fn record_wait(&mut self, delay: Duration) {
        self.waited += delay;
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.waited = Duration::ZERO;
        self.last_failure = None;
    }

    pub fn class(&self) -> OperationClass {
        self.class
    }

    /// Failed attempts recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn last_failure(&self) -> Option<Failure> {
        self.last_failure
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self, class: OperationClass) -> u32 {
        match class {
            OperationClass::Metadata => self.config.metadata_max_attempts,
            OperationClass::Chunk => self.config.chunk_max_attempts,
        }
    }

    /// Decides what to do after `failure`, which must already be recorded in `ctx`.
    ///
    /// Permanent failures give up at once. Otherwise the operation gives up
    /// when `ctx.attempts()` reaches the class budget. A rate-limit hint wins
    /// over exponential backoff but is clamped to `rate_limit_cap`.
    pub fn next_delay(&self, ctx: &RetryContext, failure: Failure) -> RetryDecision {
        if failure == Failure::Permanent {
            return RetryDecision::GiveUp;
        }
        if ctx.attempts() >= self.max_attempts(ctx.class()) {
            return RetryDecision::GiveUp;
        }
        match failure {
            Failure::RateLimited {
                retry_after: Some(hint),
            } => RetryDecision::Retry(hint.min(self.config.rate_limit_cap())),
            _ => RetryDecision::Retry(self.backoff(ctx.attempts())),
        }
    }

    /// `base * 2^(attempt-1)` plus up to one `base` of jitter, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(62) as i32;
        let base = self.config.base_delay().as_secs_f64();
        let jitter = if base > 0.0 {
            rand::thread_rng().gen_range(0.0..base)
        } else {
            0.0
        };
        let secs = base * 2f64.powi(exp) + jitter;
        Duration::from_secs_f64(secs.min(self.config.max_delay().as_secs_f64()))
    }
}

/// Why [`run_with_retry`] stopped without a value.
#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted {
        attempts: u32,
        waited: Duration,
        last: E,
    },
}

/// Runs `op` until it succeeds, the policy gives up, or `cancel` fires.
///
/// Backoff sleeps race the cancellation token, so a cancel during a wait
/// returns promptly.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    class: OperationClass,
    cancel: &CancellationToken,
    classify: impl Fn(&E) -> Failure,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut ctx = RetryContext::new(class);
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            r = op() => r,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let failure = classify(&err);
        ctx.record_failure(failure);
        match policy.next_delay(&ctx, failure) {
            RetryDecision::Retry(delay) => {
                warn!(
                    class = ?class,
                    attempt = ctx.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                ctx.record_wait(delay);
            }
            RetryDecision::GiveUp => {
                return Err(RetryError::Exhausted {
                    attempts: ctx.attempts(),
                    waited: ctx.waited(),
                    last: err,
                });
            }
        }
    }
}
