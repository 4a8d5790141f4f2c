//! History fetcher
//!
//! Pulls up to `max_count` transactions for an address: the oldest half
//! (ascending pages) and the newest half (descending pages), so long-lived
//! wallets get both their origin and their recent activity. Every page goes
//! through the indexer rate limiter, the request cache and a bounded retry.
//!
//! When the indexer is exhausted the fetcher scans the most recent
//! `rpc_scan_depth` blocks through the provider pool instead. That result is
//! marked partial.

use super::indexer::{IndexerApi, PageQuery, SortOrder};
use crate::error::PipelineResult;
use crate::pipeline::types::Transaction;
use crate::provider::backoff::{retry_with_backoff, ExponentialBackoff};
use crate::provider::cache::RequestCache;
use crate::provider::pool::ProviderPool;
use crate::provider::rate_limiter::RateLimiter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Attempts per indexer page
pub const PAGE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Indexer,
    RpcFallback { partial: bool },
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    /// Unique by hash, ascending by (timestamp, block_number)
    pub transactions: Vec<Transaction>,
    pub source: FetchSource,
}

pub struct HistoryFetcher {
    indexer: Arc<dyn IndexerApi>,
    limiter: Arc<RateLimiter>,
    cache: Arc<RequestCache<Vec<Transaction>>>,
    pool: Arc<ProviderPool>,
    page_size: u32,
    rpc_scan_depth: u64,
    backoff: ExponentialBackoff,
}

impl HistoryFetcher {
    pub fn new(
        indexer: Arc<dyn IndexerApi>,
        limiter: Arc<RateLimiter>,
        cache: Arc<RequestCache<Vec<Transaction>>>,
        pool: Arc<ProviderPool>,
        page_size: u32,
        rpc_scan_depth: u64,
    ) -> Self {
        Self {
            indexer,
            limiter,
            cache,
            pool,
            page_size: page_size.max(1),
            rpc_scan_depth,
            backoff: ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(4), PAGE_ATTEMPTS),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn fetch(&self, address: &str, max_count: usize) -> PipelineResult<FetchResult> {
        let address = address.trim().to_lowercase();
        if max_count == 0 {
            return Ok(FetchResult {
                transactions: Vec::new(),
                source: FetchSource::Indexer,
            });
        }

        let oldest_count = max_count.div_ceil(2);
        let newest_count = max_count - oldest_count;

        let indexed = async {
            let oldest = self.fetch_side(&address, SortOrder::Asc, oldest_count).await?;
            let newest = self.fetch_side(&address, SortOrder::Desc, newest_count).await?;
            PipelineResult::Ok((oldest, newest))
        }
        .await;

        match indexed {
            Ok((oldest, newest)) => {
                let transactions = merge_history(oldest, newest, max_count);
                log::debug!("📚 Fetched {} transactions for {} from indexer", transactions.len(), address);
                Ok(FetchResult {
                    transactions,
                    source: FetchSource::Indexer,
                })
            }
            Err(e) => {
                log::warn!(
                    "⚠️  Indexer exhausted for {} ({}), scanning last {} blocks via RPC",
                    address,
                    e,
                    self.rpc_scan_depth
                );
                let scanned = self.rpc_scan(&address, max_count).await?;
                Ok(FetchResult {
                    transactions: merge_history(scanned, Vec::new(), max_count),
                    source: FetchSource::RpcFallback { partial: true },
                })
            }
        }
    }

    async fn fetch_side(&self, address: &str, sort: SortOrder, count: usize) -> PipelineResult<Vec<Transaction>> {
        let mut collected = Vec::new();
        if count == 0 {
            return Ok(collected);
        }

        let pages = count.div_ceil(self.page_size as usize) as u32;
        for page in 1..=pages {
            let query = PageQuery {
                address: address.to_string(),
                page,
                offset: self.page_size,
                sort,
            };
            let rows = self.fetch_page(&query).await?;
            let short_page = rows.len() < self.page_size as usize;
            collected.extend(rows);
            if short_page || collected.len() >= count {
                break;
            }
        }

        collected.truncate(count);
        Ok(collected)
    }

    async fn fetch_page(&self, query: &PageQuery) -> PipelineResult<Vec<Transaction>> {
        let key = query.cache_key();
        if let Some(rows) = self.cache.get(&key) {
            log::debug!("💾 Cache hit {}", key);
            return Ok(rows);
        }

        let limiter = &self.limiter;
        let indexer = &self.indexer;
        let rows = retry_with_backoff("indexer page", PAGE_ATTEMPTS, self.backoff.clone(), move || async move {
            limiter.wait_if_needed().await;
            indexer.fetch_page(query).await
        })
        .await?;

        self.cache.set_default(key, rows.clone());
        Ok(rows)
    }

    /// Newest-first block scan. Blocks that fail to load are skipped.
    async fn rpc_scan(&self, address: &str, max_count: usize) -> PipelineResult<Vec<Transaction>> {
        let selected = self.pool.get_provider().await?;
        let latest = selected.latest_block;
        let lowest = latest.saturating_sub(self.rpc_scan_depth.saturating_sub(1));

        let mut found = Vec::new();
        let mut skipped = 0u64;
        for number in (lowest..=latest).rev() {
            self.pool.limiter().wait_if_needed().await;
            let block = match selected.provider.get_block_with_txs(number).await {
                Ok(Some(block)) => block,
                Ok(None) => continue,
                Err(e) => {
                    skipped += 1;
                    log::debug!("Skipping block {}: {}", number, e);
                    continue;
                }
            };

            found.extend(block.transactions.into_iter().filter(|tx| tx.involves(address)));
            if found.len() >= max_count {
                break;
            }
        }

        log::info!(
            "🔎 RPC scan of {} via {}: {} matches in blocks {}..={} ({} skipped)",
            address,
            selected.provider.name(),
            found.len(),
            lowest,
            latest,
            skipped
        );
        Ok(found)
    }
}

/// Oldest then newest, first occurrence of each hash wins, capped at
/// `max_count`, then sorted ascending by (timestamp, block_number)
pub fn merge_history(oldest: Vec<Transaction>, newest: Vec<Transaction>, max_count: usize) -> Vec<Transaction> {
    let mut seen = HashSet::new();
    let mut merged: Vec<Transaction> = oldest
        .into_iter()
        .chain(newest)
        .filter(|tx| seen.insert(tx.hash.clone()))
        .take(max_count)
        .collect();
    merged.sort_by_key(|tx| (tx.timestamp, tx.block_number));
    merged
}
