//! Progress monitor: samples the queue depth on a fixed interval and logs an
//! ETA once enough samples have been seen.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::queue::{QueueHead, WorkQueue};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonitorSettings {
    #[serde(with = "crate::config::duration_secs")]
    pub interval: Duration,
    pub window: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Eta {
    Unknown,
    Remaining(Duration),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Unknown => f.write_str("unknown"),
            Eta::Remaining(d) => {
                let secs = d.as_secs_f64().round() as u64;
                write!(f, "{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
            }
        }
    }
}

/// Sliding window over queue-depth deltas between consecutive samples.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    interval: Duration,
    window: usize,
    deltas: VecDeque<f64>,
    last_remaining: Option<usize>,
}

impl ThroughputEstimator {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            interval: settings.interval,
            window: settings.window.max(1),
            deltas: VecDeque::with_capacity(settings.window.max(1)),
            last_remaining: None,
        }
    }

    /// Records a sample and returns the current estimate. The first sample
    /// only seeds the baseline.
    pub fn record(&mut self, remaining: usize) -> Eta {
        if let Some(last) = self.last_remaining.replace(remaining) {
            if self.deltas.len() == self.window {
                self.deltas.pop_front();
            }
            self.deltas.push_back(last as f64 - remaining as f64);
        }
        self.eta(remaining)
    }

    /// Items drained per second over the window, once the window is full.
    pub fn throughput(&self) -> Option<f64> {
        if self.deltas.len() < self.window || self.interval.is_zero() {
            return None;
        }
        let per_sample = self.deltas.iter().sum::<f64>() / self.window as f64;
        Some(per_sample / self.interval.as_secs_f64())
    }

    fn eta(&self, remaining: usize) -> Eta {
        match self.throughput() {
            Some(rate) if rate > 0.0 => {
                Eta::Remaining(Duration::from_secs_f64(remaining as f64 / rate))
            }
            _ => Eta::Unknown,
        }
    }
}

pub struct Monitor {
    queue: Arc<WorkQueue>,
    settings: MonitorSettings,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(queue: Arc<WorkQueue>, settings: MonitorSettings, cancel: CancellationToken) -> Self {
        Self {
            queue,
            settings,
            cancel,
        }
    }

    /// Samples until the queue head is the terminate signal or the run is cancelled.
    pub async fn run(&self) {
        let mut estimator = ThroughputEstimator::new(self.settings);
        loop {
            if self.queue.peek() == Some(QueueHead::Terminate) {
                break;
            }
            let remaining = self.queue.len();
            let eta = estimator.record(remaining);
            info!(remaining, eta = %eta, "Remaining {} documents. ETA {}", remaining, eta);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!("Shutting down monitor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(interval_secs: u64) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(interval_secs),
            window: DEFAULT_WINDOW,
        }
    }

    #[test]
    fn unknown_until_window_is_full() {
        let mut est = ThroughputEstimator::new(settings(1));
        // Baseline plus nine deltas: window not yet full.
        for i in 0..10 {
            assert_eq!(est.record(1000 - i * 7), Eta::Unknown);
        }
        // Tenth delta fills the window.
        assert!(matches!(est.record(1000 - 70), Eta::Remaining(_)));
    }

    #[test]
    fn constant_rate_gives_remaining_over_rate() {
        let rate = 4usize;
        let mut est = ThroughputEstimator::new(settings(1));
        let mut remaining = 2000usize;
        let mut eta = Eta::Unknown;
        for _ in 0..=DEFAULT_WINDOW {
            eta = est.record(remaining);
            remaining -= rate;
        }
        let last = remaining + rate;
        match eta {
            Eta::Remaining(d) => {
                let expected = last as f64 / rate as f64;
                assert!((d.as_secs_f64() - expected).abs() < 1e-6, "got {d:?}, expected {expected}s");
            }
            Eta::Unknown => panic!("window should be full"),
        }
    }

    #[test]
    fn eta_scales_with_interval() {
        let mut est = ThroughputEstimator::new(settings(5));
        let mut eta = Eta::Unknown;
        for i in 0..=DEFAULT_WINDOW {
            eta = est.record(1000 - i * 10);
        }
        // 10 items per 5s sample = 2/s; 900 left -> 450s.
        assert_eq!(eta, Eta::Remaining(Duration::from_secs(450)));
        assert_eq!(eta.to_string(), "00:07:30");
    }

    #[test]
    fn stalled_or_growing_queue_is_unknown() {
        let mut est = ThroughputEstimator::new(settings(1));
        let mut eta = Eta::Remaining(Duration::ZERO);
        for i in 0..=DEFAULT_WINDOW {
            eta = est.record(100 + i);
        }
        assert_eq!(eta, Eta::Unknown);
    }

    #[tokio::test]
    async fn monitor_stops_on_terminate() {
        let queue = Arc::new(WorkQueue::unbounded());
        queue.close();
        let monitor = Monitor::new(queue, settings(60), CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(1), monitor.run())
            .await
            .expect("monitor should stop immediately on terminate");
    }

    #[tokio::test]
    async fn monitor_stops_on_cancel() {
        let queue = Arc::new(WorkQueue::unbounded());
        let cancel = CancellationToken::new();
        let monitor = Monitor::new(queue, settings(60), cancel.clone());
        let handle = tokio::spawn(async move { monitor.run().await });
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop on cancellation")
            .unwrap();
    }
}
