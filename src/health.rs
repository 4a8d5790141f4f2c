//! Health endpoint
//!
//! `GET /health` returns a JSON snapshot: running flag, queue depth, provider
//! breaker state, cache stats and the pipeline counters.

use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pipeline::queue::AggregationQueue;
use crate::pipeline::types::Transaction;
use crate::provider::cache::{CacheStats, RequestCache};
use crate::provider::pool::{ProviderPool, ProviderState};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct HealthState {
    pub running: Arc<AtomicBool>,
    pub queue: Arc<AggregationQueue>,
    pub pool: Arc<ProviderPool>,
    pub cache: Arc<RequestCache<Vec<Transaction>>>,
    pub metrics: Arc<PipelineMetrics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub is_running: bool,
    pub queue_size: usize,
    pub provider_state: ProviderState,
    pub cache_stats: CacheStats,
    pub counters: MetricsSnapshot,
}

impl HealthState {
    pub async fn report(&self) -> HealthReport {
        HealthReport {
            is_running: self.running.load(Ordering::SeqCst),
            queue_size: self.queue.len().await,
            provider_state: self.pool.state().await,
            cache_stats: self.cache.stats(),
            counters: self.metrics.snapshot(),
        }
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> Json<HealthReport> {
    Json(state.report().await)
}

/// Serve until `shutdown` flips to true
pub async fn serve(bind_addr: &str, state: HealthState, mut shutdown: watch::Receiver<bool>) -> PipelineResult<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .map_err(|e| PipelineError::Config(format!("cannot bind health endpoint to {}: {}", bind_addr, e)))?;

    log::info!("🩺 Health endpoint listening on http://{}/health", bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| PipelineError::TransientNetwork(format!("health server: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineResult;
    use crate::pipeline::queue::{BatchSubmitter, QueueMode};
    use crate::pipeline::types::CreditDimensionUpdate;
    use crate::provider::rate_limiter::RateLimiter;
    use crate::provider::rpc::{ChainRpc, RpcBlock};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StaticRpc;

    #[async_trait]
    impl ChainRpc for StaticRpc {
        fn name(&self) -> &str {
            "static"
        }

        async fn get_block_number(&self) -> PipelineResult<u64> {
            Ok(7)
        }

        async fn get_block_with_txs(&self, _number: u64) -> PipelineResult<Option<RpcBlock>> {
            Ok(None)
        }

        async fn get_balance(&self, _address: &str) -> PipelineResult<u128> {
            Ok(0)
        }
    }

    struct NullSubmitter;

    #[async_trait]
    impl BatchSubmitter for NullSubmitter {
        async fn submit(&self, _batch: &[CreditDimensionUpdate]) -> PipelineResult<()> {
            Ok(())
        }

        async fn dead_letter(&self, _batch: &[CreditDimensionUpdate], _reason: &str) -> PipelineResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_health_report_shape() {
        let metrics = Arc::new(PipelineMetrics::new());
        metrics.record_valid();
        let state = HealthState {
            running: Arc::new(AtomicBool::new(true)),
            queue: Arc::new(AggregationQueue::new(
                QueueMode::Batched {
                    batch_size: 10,
                    interval: Duration::from_secs(30),
                },
                Arc::new(NullSubmitter),
                metrics.clone(),
            )),
            pool: Arc::new(ProviderPool::new(
                Arc::new(StaticRpc),
                None,
                Arc::new(RateLimiter::new(5, Duration::from_secs(1))),
                3,
                Duration::from_secs(60),
                Duration::from_secs(5),
            )),
            cache: Arc::new(RequestCache::new(Duration::from_secs(60))),
            metrics,
        };
        state
            .queue
            .enqueue(CreditDimensionUpdate::single(
                "0x9999999999999999999999999999999999999999",
                crate::pipeline::types::CreditDimension::DefiReliability,
                1,
                100,
            ))
            .await;

        let Json(report) = health(State(state)).await;
        assert!(report.is_running);
        assert_eq!(report.queue_size, 1);
        assert_eq!(report.counters.valid, 1);

        let json = serde_json::to_value(&report).unwrap();
        for key in ["is_running", "queue_size", "provider_state", "cache_stats", "counters"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["provider_state"]["circuit"], "closed");
    }
}
