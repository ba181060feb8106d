//! Progress events and reporters.
//!
//! Reporters are invoked inline from the pipeline stages, so they must return
//! quickly and never block on a slow consumer.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::Stage;

/// Cumulative progress of one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub stage: Stage,
    /// Bytes completed by this stage so far. Never decreases.
    pub bytes_so_far: u64,
    pub total_bytes: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, bytes_so_far: u64, total_bytes: Option<u64>) -> Self {
        Self {
            stage,
            bytes_so_far,
            total_bytes,
            timestamp: Utc::now(),
        }
    }

    /// Completion percentage, when the total is known.
    pub fn percentage(&self) -> Option<f64> {
        match self.total_bytes {
            Some(0) => Some(100.0),
            Some(total) => Some(self.bytes_so_far as f64 / total as f64 * 100.0),
            None => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes.is_some_and(|t| self.bytes_so_far >= t)
    }
}

/// Receives progress events. Must not block.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

/// Forwards events into a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ChannelReporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    /// Creates a reporter and the receiving half of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, event: ProgressEvent) {
        // Progress is advisory; a lagging consumer just misses events.
        let _ = self.tx.try_send(event);
    }
}

/// Emits throttled `tracing` lines with rate and ETA per stage.
pub struct LogReporter {
    label: String,
    interval: Duration,
    fetch: Mutex<StageMeter>,
    drain: Mutex<StageMeter>,
}

struct StageMeter {
    speed: SpeedCalculator,
    last_emit: Option<Instant>,
}

impl LogReporter {
    pub fn new(label: impl Into<String>, interval: Duration) -> Self {
        let meter = || {
            Mutex::new(StageMeter {
                speed: SpeedCalculator::new(None, None),
                last_emit: None,
            })
        };
        Self {
            label: label.into(),
            interval,
            fetch: meter(),
            drain: meter(),
        }
    }
}

impl ProgressReporter for LogReporter {
    fn report(&self, event: ProgressEvent) {
        let meter = match event.stage {
            Stage::Fetch => &self.fetch,
            Stage::Drain => &self.drain,
        };
        let mut meter = meter.lock().unwrap_or_else(PoisonError::into_inner);
        meter.speed.add_sample(event.bytes_so_far);

        let now = Instant::now();
        let due = meter
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.interval);
        if !due && !event.is_complete() {
            return;
        }
        meter.last_emit = Some(now);

        let rate = meter.speed.bytes_per_second();
        let eta_secs = event
            .total_bytes
            .and_then(|t| meter.speed.eta(t.saturating_sub(event.bytes_so_far)))
            .map(|d| d.as_secs());
        tracing::info!(
            transfer = %self.label,
            stage = %event.stage,
            bytes = event.bytes_so_far,
            total = ?event.total_bytes,
            percent = ?event.percentage().map(|p| p.round() as u64),
            rate_bps = rate as u64,
            eta_secs = ?eta_secs,
            "transfer progress"
        );
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    position: u64,
    timestamp: Instant,
}

/// Throughput over a sliding window of cumulative byte positions.
pub struct SpeedCalculator {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window: Duration,
}

impl SpeedCalculator {
    /// `window` defaults to 5 s, `max_samples` to 100.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            samples: VecDeque::new(),
            max_samples: max_samples.unwrap_or(100).max(2),
            window: window.unwrap_or(Duration::from_secs(5)),
        }
    }

    /// Records that `position` bytes have been processed as of now.
    pub fn add_sample(&mut self, position: u64) {
        self.add_sample_at(position, Instant::now());
    }

    fn add_sample_at(&mut self, position: u64, timestamp: Instant) {
        self.samples.push_back(SpeedSample {
            position,
            timestamp,
        });
        while let Some(front) = self.samples.front() {
            let stale = timestamp.duration_since(front.timestamp) > self.window;
            if (stale && self.samples.len() > 2) || self.samples.len() > self.max_samples {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Average bytes/second across the window. 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        last.position.saturating_sub(first.position) as f64 / elapsed.as_secs_f64()
    }

    /// Time to move `remaining` more bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn percentage_and_completion() {
        let e = ProgressEvent::new(Stage::Drain, 50, Some(200));
        assert_eq!(e.percentage(), Some(25.0));
        assert!(!e.is_complete());

        let e = ProgressEvent::new(Stage::Drain, 0, Some(0));
        assert_eq!(e.percentage(), Some(100.0));
        assert!(e.is_complete());

        let e = ProgressEvent::new(Stage::Fetch, 10, None);
        assert_eq!(e.percentage(), None);
        assert!(!e.is_complete());
    }

    #[test]
    fn closure_reporter_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let reporter = move |e: ProgressEvent| sink.lock().unwrap().push(e.bytes_so_far);
        reporter.report(ProgressEvent::new(Stage::Fetch, 10, None));
        reporter.report(ProgressEvent::new(Stage::Fetch, 20, None));
        assert_eq!(*seen.lock().unwrap(), vec![10, 20]);
    }

    #[tokio::test]
    async fn channel_reporter_drops_when_full() {
        let (reporter, mut rx) = ChannelReporter::channel(2);
        for i in 0..5 {
            reporter.report(ProgressEvent::new(Stage::Drain, i, Some(5)));
        }
        assert_eq!(rx.recv().await.unwrap().bytes_so_far, 0);
        assert_eq!(rx.recv().await.unwrap().bytes_so_far, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn log_reporter_does_not_panic() {
        let reporter = LogReporter::new("obj", Duration::from_millis(0));
        reporter.report(ProgressEvent::new(Stage::Fetch, 0, Some(10)));
        reporter.report(ProgressEvent::new(Stage::Fetch, 10, Some(10)));
        reporter.report(ProgressEvent::new(Stage::Drain, 10, None));
    }

    #[test]
    fn speed_calculator_needs_two_samples() {
        let mut calc = SpeedCalculator::new(None, None);
        assert_eq!(calc.bytes_per_second(), 0.0);
        calc.add_sample(100);
        assert_eq!(calc.bytes_per_second(), 0.0);
        assert!(calc.eta(1000).is_none());
    }

    #[test]
    fn speed_calculator_rate_and_eta() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(10)), None);
        let t0 = Instant::now();
        calc.add_sample_at(0, t0);
        calc.add_sample_at(1_000, t0 + Duration::from_millis(500));
        calc.add_sample_at(2_000, t0 + Duration::from_secs(1));

        assert!((calc.bytes_per_second() - 2_000.0).abs() < 1e-6);
        let eta = calc.eta(4_000).unwrap();
        assert!((eta.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn speed_calculator_prunes_old_samples() {
        let mut calc = SpeedCalculator::new(Some(Duration::from_secs(1)), Some(5));
        let t0 = Instant::now();
        for i in 0..20u64 {
            calc.add_sample_at(i * 100, t0 + Duration::from_millis(i * 10));
        }
        assert!(calc.samples.len() <= 5);

        calc.add_sample_at(10_000, t0 + Duration::from_secs(30));
        assert_eq!(calc.samples.len(), 2);

        calc.reset();
        assert_eq!(calc.bytes_per_second(), 0.0);
    }
}
