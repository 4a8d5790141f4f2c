//! credflow runtime
//!
//! Wires the pipeline together and runs it until CTRL+C:
//! - Provider pool (primary + optional fallback RPC) behind a circuit breaker
//! - History fetcher (indexer with RPC fallback)
//! - One worker per watched address, fed by the block watcher
//! - Aggregation queue + contract updater with dead-letter store
//! - Health endpoint
//!
//! Usage:
//!   cargo run --release --bin credflow
//!
//! Configuration comes from the environment (or `.env`); see
//! `PipelineConfig::from_env` for the full list.

use credflow::config::PipelineConfig;
use credflow::health::{self, HealthState};
use credflow::history::{EtherscanIndexer, HistoryFetcher};
use credflow::pipeline::{
    AddressWorker, AggregationQueue, BlockWatcher, ContractUpdater, EthScoringContract, PipelineMetrics,
    QueueMode, SqliteDeadLetterStore, TransactionClassifier, ValidationConfig,
};
use credflow::provider::{ChainRpc, HttpRpcProvider, ProviderPool, RateLimited, RateLimiter, RequestCache};
use dotenv::dotenv;
use ethers::providers::{Http, Provider};
use log::{error, info, warn};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Per-worker inbox size
const WORKER_INBOX_CAPACITY: usize = 1_000;
/// Dead letters retried on startup
const STARTUP_REPLAY_LIMIT: usize = 100;
/// Timeout for a single HTTP request to RPC or indexer
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 credflow - on-chain credit ingestion pipeline");
    info!("   └─ Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match PipelineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            return Err(e.into());
        }
    };

    info!("✅ Configuration loaded");
    info!("   ├─ Fallback RPC: {}", if config.fallback_rpc_url.is_some() { "configured" } else { "none" });
    info!("   ├─ Rate limit: {} req / {}ms", config.max_requests_per_window, config.window_ms);
    info!("   ├─ Circuit: threshold {}, cooldown {}ms", config.circuit_threshold, config.circuit_cooldown_ms);
    info!(
        "   ├─ Queue: {}",
        if config.realtime_mode {
            "real-time".to_string()
        } else {
            format!("batched ({} every {}ms)", config.batch_size, config.batch_interval_ms)
        }
    );
    info!("   ├─ Contract: {}", config.contract_address);
    info!("   └─ Watching: {} addresses", config.watch_addresses.len());

    // Providers
    let metrics = Arc::new(PipelineMetrics::new());
    let rpc_limiter = Arc::new(RateLimiter::new(config.max_requests_per_window, config.window()));
    let primary: Arc<dyn ChainRpc> = Arc::new(HttpRpcProvider::new("primary", &config.primary_rpc_url, HTTP_TIMEOUT)?);
    let fallback: Option<Arc<dyn ChainRpc>> = match &config.fallback_rpc_url {
        Some(url) => {
            let provider: Arc<dyn ChainRpc> = Arc::new(HttpRpcProvider::new("fallback", url, HTTP_TIMEOUT)?);
            Some(provider)
        }
        None => None,
    };
    let pool = Arc::new(
        ProviderPool::new(
            primary,
            fallback,
            rpc_limiter.clone(),
            config.circuit_threshold,
            config.circuit_cooldown(),
            config.liveness_timeout(),
        )
        .with_metrics(metrics.clone()),
    );

    // History
    let indexer_limiter = Arc::new(RateLimiter::new(config.max_requests_per_window, config.window()));
    let cache = Arc::new(RequestCache::new(config.cache_ttl()));
    let indexer = Arc::new(EtherscanIndexer::new(&config.indexer_url, &config.indexer_api_key, HTTP_TIMEOUT)?);
    let fetcher = Arc::new(HistoryFetcher::new(
        indexer,
        indexer_limiter,
        cache.clone(),
        pool.clone(),
        config.indexer_page_size as u32,
        config.rpc_scan_depth,
    ));

    // Submission shares the primary's limiter: same node, same budget
    let dead_letters = Arc::new(SqliteDeadLetterStore::open(&config.dead_letter_db_path)?);
    let contract_client = Arc::new(Provider::new(RateLimited::new(
        Http::from_str(&config.primary_rpc_url)?,
        rpc_limiter,
    )));
    let contract = Arc::new(EthScoringContract::new(
        contract_client,
        &config.contract_address,
        &config.submitter_address,
        config.confirmation_timeout(),
    )?);
    let updater = Arc::new(ContractUpdater::new(
        contract,
        dead_letters,
        metrics.clone(),
        config.submit_max_attempts,
    ));

    match updater.replay_dead_letters(STARTUP_REPLAY_LIMIT).await {
        Ok(outcome) if outcome.still_failing > 0 => {
            warn!("⚠️  {} dead letters still failing after startup replay", outcome.still_failing)
        }
        Ok(_) => {}
        Err(e) => warn!("⚠️  Dead-letter replay skipped: {}", e),
    }

    let mode = if config.realtime_mode {
        QueueMode::RealTime
    } else {
        QueueMode::Batched {
            batch_size: config.batch_size,
            interval: config.batch_interval(),
        }
    };
    let queue = Arc::new(
        AggregationQueue::new(mode, updater.clone(), metrics.clone()).with_retry_interval(config.batch_interval()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = Arc::new(AtomicBool::new(false));

    info!("🚀 Spawning background tasks...");

    let drain_handle = tokio::spawn(queue.clone().run_drain_timer(shutdown_rx.clone()));
    info!("   ├─ ✅ Drain timer");

    let health_state = HealthState {
        running: running.clone(),
        queue: queue.clone(),
        pool: pool.clone(),
        cache,
        metrics: metrics.clone(),
    };
    let health_addr = config.health_bind_addr.clone();
    let health_rx = shutdown_rx.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health::serve(&health_addr, health_state, health_rx).await {
            error!("❌ Health endpoint failed: {}", e);
        }
    });
    info!("   ├─ ✅ Health endpoint");

    let classifier = Arc::new(TransactionClassifier::default());
    let mut watcher = BlockWatcher::new(pool.clone(), config.poll_interval());
    let mut worker_handles = Vec::with_capacity(config.watch_addresses.len());
    for address in &config.watch_addresses {
        let (inbox_tx, inbox_rx) = mpsc::channel(WORKER_INBOX_CAPACITY);
        watcher.subscribe(address, inbox_tx);
        let worker = AddressWorker::new(
            address,
            classifier.clone(),
            ValidationConfig::default(),
            queue.clone(),
            metrics.clone(),
        );
        worker_handles.push(tokio::spawn(worker.run(fetcher.clone(), config.max_tx_per_fetch, inbox_rx)));
    }
    info!("   ├─ ✅ {} address workers", worker_handles.len());

    if config.watch_addresses.is_empty() {
        warn!("⚠️  WATCH_ADDRESSES is empty, block watcher not started");
    }
    let watcher_handle = (!config.watch_addresses.is_empty()).then(|| tokio::spawn(watcher.run(shutdown_rx.clone())));
    info!("   └─ ✅ Block watcher");

    running.store(true, Ordering::SeqCst);
    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    // 1. Stop notifications; the watcher drops every worker inbox sender
    running.store(false, Ordering::SeqCst);
    let _ = shutdown_tx.send(true);
    if let Some(handle) = watcher_handle {
        let _ = handle.await;
    }

    // 2. Let workers finish in-flight fetches, bounded; stragglers are aborted
    //    so nothing enqueues behind the final flush
    let workers_done = tokio::time::timeout(config.shutdown_timeout(), async {
        for handle in worker_handles.iter_mut() {
            let _ = handle.await;
        }
    })
    .await;
    if workers_done.is_err() {
        let stragglers = worker_handles.iter().filter(|h| !h.is_finished()).count();
        warn!(
            "⚠️  {} workers did not finish within {}ms, aborting",
            stragglers, config.shutdown_timeout_ms
        );
        for handle in &worker_handles {
            handle.abort();
        }
        // Finished handles may already have been awaited above
        for handle in worker_handles.into_iter().filter(|h| !h.is_finished()) {
            let _ = handle.await;
        }
    }

    // 3. Flush the queue
    let _ = drain_handle.await;
    match queue.shutdown().await {
        Ok(report) => info!(
            "✅ Final flush: {} submitted, {} dead-lettered",
            report.submitted, report.dead_lettered
        ),
        Err(e) => error!("❌ Final flush incomplete: {}", e),
    }

    let _ = health_handle.await;

    let snapshot = metrics.snapshot();
    info!("📊 Final counters");
    info!("   ├─ Processed: {} (valid {}, invalid {})", snapshot.processed, snapshot.valid, snapshot.invalid);
    info!("   ├─ Anomalies: {}", snapshot.anomalies);
    info!("   ├─ Submitted: {} ok / {} failed", snapshot.submit_success, snapshot.submit_failure);
    info!("   └─ Dead-lettered: {}", snapshot.dead_lettered);
    info!("✅ credflow stopped");
    Ok(())
}
