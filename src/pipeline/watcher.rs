//! Block watcher
//!
//! Polls the provider pool for new blocks and pushes every transaction that
//! touches a watched address into that address's worker inbox. This is the
//! upstream notification source for the per-address workers.
//!
//! The watcher owns the inbox senders; when it stops they are dropped, which
//! is what tells the workers to wind down.
//!
//! The first poll starts `ANCHOR_LOOKBACK` blocks behind the head. The indexer
//! the backfill reads usually trails the chain by a few blocks, so the two
//! overlap; workers drop the duplicates by hash.

use super::types::Transaction;
use crate::error::PipelineError;
use crate::provider::pool::ProviderPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};

/// Catch-up bound per poll so one tick never scans unbounded ranges
pub const MAX_BLOCKS_PER_POLL: u64 = 50;

/// Blocks re-read behind the head on the first poll
pub const ANCHOR_LOOKBACK: u64 = 12;

pub struct BlockWatcher {
    pool: Arc<ProviderPool>,
    inboxes: HashMap<String, mpsc::Sender<Transaction>>,
    poll_interval: Duration,
    next_block: Option<u64>,
}

impl BlockWatcher {
    pub fn new(pool: Arc<ProviderPool>, poll_interval: Duration) -> Self {
        Self {
            pool,
            inboxes: HashMap::new(),
            poll_interval,
            next_block: None,
        }
    }

    /// Route transactions touching `address` to `inbox`
    pub fn subscribe(&mut self, address: &str, inbox: mpsc::Sender<Transaction>) {
        self.inboxes.insert(address.trim().to_lowercase(), inbox);
    }

    /// Start after this block instead of at the chain head
    pub fn start_after(&mut self, block: u64) {
        self.next_block = Some(block + 1);
    }

    pub fn subscriptions(&self) -> usize {
        self.inboxes.len()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("👀 Starting block watcher");
        log::info!("   ├─ Addresses: {}", self.inboxes.len());
        log::info!("   └─ Poll interval: {}ms", self.poll_interval.as_millis());

        let mut timer = interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Some(pause) = self.poll_once().await {
                        // Breaker open: sit out the cooldown instead of probing every tick
                        tokio::select! {
                            _ = sleep(pause) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            if self.inboxes.is_empty() {
                log::warn!("⚠️  No live workers left, stopping block watcher");
                break;
            }
        }

        // Dropping the senders closes every worker inbox
        self.inboxes.clear();
        log::info!("✅ Block watcher stopped");
    }

    /// One poll. Returns a pause when the circuit breaker is open.
    pub async fn poll_once(&mut self) -> Option<Duration> {
        let selected = match self.pool.get_provider().await {
            Ok(selected) => selected,
            Err(PipelineError::CircuitOpen { remaining }) => {
                log::warn!("🚫 Provider circuit open, pausing watcher for {}ms", remaining.as_millis());
                return Some(remaining);
            }
            Err(e) => {
                log::warn!("⚠️  No provider for block poll: {}", e);
                return None;
            }
        };

        let head = selected.latest_block;
        let from = *self
            .next_block
            .get_or_insert_with(|| head.saturating_sub(ANCHOR_LOOKBACK - 1));
        if from > head {
            return None;
        }
        let to = head.min(from + MAX_BLOCKS_PER_POLL - 1);

        for number in from..=to {
            self.pool.limiter().wait_if_needed().await;
            let block = match selected.provider.get_block_with_txs(number).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    log::debug!("Block {} not available yet", number);
                    break;
                }
                Err(e) => {
                    log::warn!("⚠️  Failed to load block {}: {}", number, e);
                    break;
                }
            };

            for tx in block.transactions {
                self.dispatch(tx).await;
            }
            self.next_block = Some(number + 1);
        }

        None
    }

    async fn dispatch(&mut self, tx: Transaction) {
        let mut targets: Vec<String> = Vec::new();
        if self.inboxes.contains_key(&tx.from) {
            targets.push(tx.from.clone());
        }
        if let Some(to) = &tx.to {
            if to != &tx.from && self.inboxes.contains_key(to) {
                targets.push(to.clone());
            }
        }

        for address in targets {
            let Some(inbox) = self.inboxes.get(&address) else {
                continue;
            };
            // Bounded inbox: a slow worker back-pressures the watcher
            if inbox.send(tx.clone()).await.is_err() {
                log::warn!("⚠️  Worker for {} is gone, unsubscribing", address);
                self.inboxes.remove(&address);
            }
        }
    }
}
