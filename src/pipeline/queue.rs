//! Aggregation queue
//!
//! Buffers `CreditDimensionUpdate`s between the address workers and the
//! contract updater.
//!
//! Modes:
//! - Real-time: every enqueue submits whatever is pending right away; the
//!   drain timer retries a failed batch every `retry_interval`
//! - Batched: FIFO drained by `run_drain_timer` every `batch_interval`, or
//!   immediately once `batch_size` updates are waiting
//!
//! A batch stays at the head of the queue until its submission succeeds, so
//! a failed (or cancelled) submit leaves the same elements in the same order.
//! Drains are serialized so two batches never overlap.
//!
//! After `shutdown()` the queue is closed: late updates go straight to the
//! dead-letter path instead of a queue nobody drains any more.

use super::metrics::PipelineMetrics;
use super::types::CreditDimensionUpdate;
use crate::error::PipelineResult;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};

/// Downstream consumer of drained batches
#[async_trait]
pub trait BatchSubmitter: Send + Sync {
    /// `Err` means "nothing was durably handled, re-queue the batch"
    async fn submit(&self, batch: &[CreditDimensionUpdate]) -> PipelineResult<()>;

    /// Last resort at shutdown, and for updates arriving after it
    async fn dead_letter(&self, batch: &[CreditDimensionUpdate], reason: &str) -> PipelineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    RealTime,
    Batched { batch_size: usize, interval: Duration },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub submitted: usize,
    pub dead_lettered: usize,
}

/// Real-time retry tick unless overridden
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct AggregationQueue {
    pending: Mutex<VecDeque<CreditDimensionUpdate>>,
    drain_lock: Mutex<()>,
    closed: AtomicBool,
    submitter: Arc<dyn BatchSubmitter>,
    metrics: Arc<PipelineMetrics>,
    mode: QueueMode,
    retry_interval: Duration,
}

impl AggregationQueue {
    pub fn new(mode: QueueMode, submitter: Arc<dyn BatchSubmitter>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            drain_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            submitter,
            metrics,
            mode,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub async fn enqueue(&self, update: CreditDimensionUpdate) {
        let len = {
            let mut pending = self.pending.lock().await;
            // Checked under the lock `shutdown()` closes with
            if self.is_closed() {
                drop(pending);
                self.reject_closed(update).await;
                return;
            }
            pending.push_back(update);
            pending.len()
        };

        let should_drain = match self.mode {
            QueueMode::RealTime => true,
            QueueMode::Batched { batch_size, .. } => len >= batch_size,
        };

        if should_drain {
            if let Err(e) = self.drain_once().await {
                log::warn!("⚠️  Drain failed, batch kept at head ({} pending): {}", self.len().await, e);
            }
        }
    }

    /// Submit one batch from the head of the queue. Returns how many updates
    /// were handed off; on failure the batch is still at the head.
    pub async fn drain_once(&self) -> PipelineResult<usize> {
        let _drain = self.drain_lock.lock().await;

        let batch = self.peek_batch().await;
        if batch.is_empty() {
            return Ok(0);
        }

        match self.submitter.submit(&batch).await {
            Ok(()) => {
                self.pop_front(batch.len()).await;
                Ok(batch.len())
            }
            Err(e) => {
                self.metrics.record_requeued();
                Err(e)
            }
        }
    }

    /// Batched: drains every `batch_interval`. Real-time: retries whatever a
    /// failed submit left behind every `retry_interval`. Exits when
    /// `shutdown` flips to true; the final flush is `shutdown()`'s job.
    pub async fn run_drain_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let every = match self.mode {
            QueueMode::Batched { batch_size, interval: every } => {
                log::info!("⏱️  Starting aggregation drain timer");
                log::info!("   ├─ Batch size: {}", batch_size);
                log::info!("   └─ Interval: {}ms", every.as_millis());
                every
            }
            QueueMode::RealTime => {
                log::info!("⏱️  Starting real-time retry timer");
                log::info!("   └─ Interval: {}ms", self.retry_interval.as_millis());
                self.retry_interval
            }
        };

        let mut timer = interval(every);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match self.drain_once().await {
                        Ok(0) => {}
                        Ok(n) => log::debug!("📤 Drained {} updates", n),
                        Err(e) => log::warn!("⚠️  Timed drain failed, batch kept at head: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("✅ Drain timer stopped");
    }

    /// Drain everything synchronously. A batch that still fails is handed to
    /// the submitter's dead-letter path; if even that fails it is put back
    /// and the error returned.
    pub async fn shutdown(&self) -> PipelineResult<ShutdownReport> {
        let _drain = self.drain_lock.lock().await;
        let mut report = ShutdownReport::default();

        let pending = {
            let pending = self.pending.lock().await;
            self.closed.store(true, Ordering::SeqCst);
            pending.len()
        };
        log::info!("🔄 Flushing aggregation queue ({} pending)...", pending);

        loop {
            let batch = self.peek_batch().await;
            if batch.is_empty() {
                break;
            }

            match self.submitter.submit(&batch).await {
                Ok(()) => report.submitted += batch.len(),
                Err(e) => {
                    log::warn!("⚠️  Final submit of {} updates failed: {}", batch.len(), e);
                    let reason = format!("shutdown: {}", e);
                    if let Err(dl_err) = self.submitter.dead_letter(&batch, &reason).await {
                        log::error!("❌ Could not dead-letter {} updates: {}", batch.len(), dl_err);
                        return Err(dl_err);
                    }
                    report.dead_lettered += batch.len();
                }
            }
            self.pop_front(batch.len()).await;
        }

        log::info!(
            "✅ Queue flushed: {} submitted, {} dead-lettered",
            report.submitted,
            report.dead_lettered
        );
        Ok(report)
    }

    async fn reject_closed(&self, update: CreditDimensionUpdate) {
        log::warn!(
            "⚠️  Queue closed, dead-lettering late update for {} ({})",
            update.user_address(),
            update.dimension()
        );
        if let Err(e) = self.submitter.dead_letter(&[update], "enqueued after shutdown").await {
            log::error!("❌ Could not dead-letter late update: {}", e);
        }
    }

    /// Copy of the next batch; it leaves the queue only once handled
    async fn peek_batch(&self) -> Vec<CreditDimensionUpdate> {
        let pending = self.pending.lock().await;
        let n = match self.mode {
            QueueMode::RealTime => pending.len(),
            QueueMode::Batched { batch_size, .. } => batch_size.max(1).min(pending.len()),
        };
        pending.iter().take(n).cloned().collect()
    }

    /// Only drains (under `drain_lock`) remove from the head, so the first
    /// `n` are still the batch that was peeked
    async fn pop_front(&self, n: usize) {
        let mut pending = self.pending.lock().await;
        let len = pending.len();
        pending.drain(..n.min(len));
    }

    #[cfg(test)]
    async fn snapshot(&self) -> Vec<CreditDimensionUpdate> {
        self.pending.lock().await.iter().cloned().collect()
    }
}
