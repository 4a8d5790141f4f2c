//! Pipeline counters and gauges
//!
//! Shared via `Arc` by workers, the queue and the updater. Counters are
//! lock-free; the processing-time average sits behind a small mutex.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Smoothing factor for the processing-time moving average
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    processed: AtomicU64,
    valid: AtomicU64,
    invalid: AtomicU64,
    anomalies: AtomicU64,
    submit_success: AtomicU64,
    submit_failure: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
    last_block: AtomicU64,
    last_update_time: AtomicI64,
    avg_processing_us: Mutex<Option<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub valid: u64,
    pub invalid: u64,
    pub anomalies: u64,
    pub submit_success: u64,
    pub submit_failure: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub last_block: u64,
    /// Unix seconds of the last confirmed contract update, 0 if none
    pub last_update_time: i64,
    pub avg_processing_us: f64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);

        let sample = elapsed.as_secs_f64() * 1_000_000.0;
        let mut avg = self.avg_processing_us.lock().unwrap_or_else(|p| p.into_inner());
        *avg = Some(match *avg {
            Some(prev) => prev + EMA_ALPHA * (sample - prev),
            None => sample,
        });
    }

    pub fn record_valid(&self) {
        self.valid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_submit_success(&self, at: i64) {
        self.submit_success.fetch_add(1, Ordering::Relaxed);
        self.last_update_time.fetch_max(at, Ordering::Relaxed);
    }

    pub fn record_submit_failure(&self) {
        self.submit_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, count: u64) {
        self.dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::Relaxed);
    }

    /// Gauge only moves forward
    pub fn observe_block(&self, block: u64) {
        self.last_block.fetch_max(block, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            submit_success: self.submit_success.load(Ordering::Relaxed),
            submit_failure: self.submit_failure.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            last_block: self.last_block.load(Ordering::Relaxed),
            last_update_time: self.last_update_time.load(Ordering::Relaxed),
            avg_processing_us: self
                .avg_processing_us
                .lock()
                .map(|avg| avg.unwrap_or(0.0))
                .unwrap_or(0.0),
        }
    }
}
