//! Per-address worker
//!
//! One long-lived task per watched address:
//!
//! 1. Backfill: fetch history, process it oldest first
//! 2. Stream: process transactions pushed by the block watcher, in arrival order
//!
//! Each transaction runs classify -> validate -> update history -> enqueue.
//! The worker owns the address's validation history, so anomaly scoring
//! always sees that user's transactions in order.

use super::classifier::TransactionClassifier;
use super::metrics::PipelineMetrics;
use super::queue::AggregationQueue;
use super::summary::{summarize, ActivitySummary};
use super::types::{CreditDimensionUpdate, Transaction};
use super::validation::{ValidationConfig, ValidationGate};
use crate::error::PipelineResult;
use crate::history::fetcher::{FetchSource, HistoryFetcher};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Hash already processed by this worker
    Duplicate,
    Invalid(Vec<String>),
    Accepted { updates: usize, anomalous: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub accepted: u64,
    pub invalid: u64,
    pub duplicates: u64,
    pub anomalous: u64,
    pub out_of_order: u64,
}

pub struct AddressWorker {
    address: String,
    classifier: Arc<TransactionClassifier>,
    gate: ValidationGate,
    queue: Arc<AggregationQueue>,
    metrics: Arc<PipelineMetrics>,
    seen: HashSet<String>,
    high_water: Option<(i64, u64)>,
    stats: WorkerStats,
}

impl AddressWorker {
    pub fn new(
        address: &str,
        classifier: Arc<TransactionClassifier>,
        validation: ValidationConfig,
        queue: Arc<AggregationQueue>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            address: address.trim().to_lowercase(),
            classifier,
            gate: ValidationGate::new(validation),
            queue,
            metrics,
            seen: HashSet::new(),
            high_water: None,
            stats: WorkerStats::default(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Fetch and process up to `max_count` historical transactions
    pub async fn backfill(&mut self, fetcher: &HistoryFetcher, max_count: usize) -> PipelineResult<ActivitySummary> {
        let result = fetcher.fetch(&self.address, max_count).await?;
        if let FetchSource::RpcFallback { partial } = result.source {
            log::warn!(
                "⚠️  Backfill for {} came from RPC scan (partial: {})",
                self.address,
                partial
            );
        }

        let summary = summarize(&self.address, &result.transactions, &self.classifier);
        for tx in result.transactions {
            self.process(tx).await;
        }

        log::info!("📚 Backfill complete for {}", self.address);
        log::info!("   ├─ Transactions: {}", summary.total_transactions);
        log::info!("   ├─ Protocols: {}", summary.protocols_used.len());
        log::info!("   ├─ Staking / DeFi: {} / {}", summary.staking_transactions, summary.defi_transactions);
        log::info!("   └─ Accepted: {}, invalid: {}", self.stats.accepted, self.stats.invalid);

        Ok(summary)
    }

    pub async fn process(&mut self, mut tx: Transaction) -> ProcessOutcome {
        let started = Instant::now();

        if !self.seen.insert(tx.hash.clone()) {
            self.stats.duplicates += 1;
            return ProcessOutcome::Duplicate;
        }

        let position = (tx.timestamp, tx.block_number);
        match self.high_water {
            Some(mark) if position < mark => {
                self.stats.out_of_order += 1;
                log::debug!("Out-of-order tx {} for {} (behind high-water mark)", tx.hash, self.address);
            }
            _ => self.high_water = Some(position),
        }

        let classification = self.classifier.classify(&tx);
        classification.apply_to(&mut tx);

        let validation = self.gate.validate(&self.address, &tx);
        if !validation.is_valid {
            log::warn!("🚫 Dropping {} for {}: {}", tx.hash, self.address, validation.errors.join("; "));
            self.metrics.record_invalid();
            self.metrics.record_processed(started.elapsed());
            self.stats.invalid += 1;
            return ProcessOutcome::Invalid(validation.errors);
        }

        self.metrics.record_valid();
        let anomalous = validation.is_anomalous();
        if anomalous {
            for warning in &validation.warnings {
                log::warn!("🔍 {}", warning);
            }
            self.metrics.record_anomaly();
            self.stats.anomalous += 1;
        }
        self.gate.update_user_history(&self.address, &tx);

        let mut updates = 0;
        for contribution in &classification.contributions {
            // Flagged transactions count for half
            let weight = if anomalous {
                (contribution.weight / 2).max(1)
            } else {
                contribution.weight
            };
            let update = CreditDimensionUpdate::single(&self.address, contribution.dimension, contribution.raw_value, weight);
            self.queue.enqueue(update).await;
            updates += 1;
        }

        self.metrics.observe_block(tx.block_number);
        self.metrics.record_processed(started.elapsed());
        self.stats.accepted += 1;

        ProcessOutcome::Accepted { updates, anomalous }
    }

    /// Backfill, then process the inbox until the watcher drops its sender.
    /// Never returns early on upstream failure.
    pub async fn run(
        mut self,
        fetcher: Arc<HistoryFetcher>,
        max_count: usize,
        mut inbox: mpsc::Receiver<Transaction>,
    ) -> WorkerStats {
        log::info!("👷 Worker started for {}", self.address);

        if let Err(e) = self.backfill(&fetcher, max_count).await {
            log::error!("❌ Backfill failed for {}: {} (continuing with live stream)", self.address, e);
        }

        while let Some(tx) = inbox.recv().await {
            self.process(tx).await;
        }

        log::info!(
            "✅ Worker for {} stopped (accepted {}, invalid {}, duplicates {})",
            self.address,
            self.stats.accepted,
            self.stats.invalid,
            self.stats.duplicates
        );
        self.stats
    }
}
