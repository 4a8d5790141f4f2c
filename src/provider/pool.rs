//! Circuit-breaking provider pool
//!
//! ## State machine
//!
//! ```text
//! CLOSED --(failure_count >= threshold)--> OPEN
//! OPEN   --(cooldown elapsed)-----------> HALF-OPEN (next call re-checks)
//! HALF-OPEN --(primary check ok)--------> CLOSED (failure_count = 0)
//! HALF-OPEN --(check fails)-------------> OPEN (last_failure_time = now)
//! ```
//!
//! A fallback success serves the call but does NOT close the breaker: the
//! primary is still degraded and keeps accumulating failures.

use super::rate_limiter::RateLimiter;
use super::rpc::ChainRpc;
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::metrics::PipelineMetrics;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{timeout, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderRole {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    pub threshold: u32,
    pub cooldown: Duration,
    /// Which provider served the last successful selection
    active: Option<ProviderRole>,
}

impl CircuitState {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_count: 0,
            last_failure_time: None,
            threshold: threshold.max(1),
            cooldown,
            active: None,
        }
    }

    /// Remaining cooldown if the breaker is open right now
    fn open_for(&self, now: Instant) -> Option<Duration> {
        if self.failure_count < self.threshold {
            return None;
        }
        let last = self.last_failure_time?;
        let elapsed = now.duration_since(last);
        if elapsed < self.cooldown {
            Some(self.cooldown - elapsed)
        } else {
            None
        }
    }

    fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure_time = Some(now);
    }

    fn status(&self, now: Instant) -> CircuitStatus {
        if self.failure_count < self.threshold {
            CircuitStatus::Closed
        } else if self.open_for(now).is_some() {
            CircuitStatus::Open
        } else {
            CircuitStatus::HalfOpen
        }
    }
}

/// Snapshot for the health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ProviderState {
    pub circuit: CircuitStatus,
    pub failure_count: u32,
    pub active: Option<ProviderRole>,
    pub cooldown_remaining_ms: u64,
    pub rate_window_load: usize,
}

/// Result of a successful selection
#[derive(Clone)]
pub struct SelectedProvider {
    pub provider: Arc<dyn ChainRpc>,
    pub role: ProviderRole,
    /// Block height returned by the liveness check
    pub latest_block: u64,
}

pub struct ProviderPool {
    primary: Arc<dyn ChainRpc>,
    fallback: Option<Arc<dyn ChainRpc>>,
    limiter: Arc<RateLimiter>,
    state: Mutex<CircuitState>,
    liveness_timeout: Duration,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl ProviderPool {
    pub fn new(
        primary: Arc<dyn ChainRpc>,
        fallback: Option<Arc<dyn ChainRpc>>,
        limiter: Arc<RateLimiter>,
        threshold: u32,
        cooldown: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            limiter,
            state: Mutex::new(CircuitState::new(threshold, cooldown)),
            liveness_timeout,
            metrics: None,
        }
    }

    /// Successful liveness checks feed the `last_block` gauge
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Pick a live provider, or fail fast while the breaker is open
    pub async fn get_provider(&self) -> PipelineResult<SelectedProvider> {
        let open_for = self.lock_state().open_for(Instant::now());
        if let Some(remaining) = open_for {
            log::debug!("🚫 Circuit open, {}ms remaining", remaining.as_millis());
            return Err(PipelineError::CircuitOpen { remaining });
        }

        match self.check_liveness(&self.primary).await {
            Ok(latest_block) => {
                let mut state = self.lock_state();
                if state.failure_count > 0 {
                    log::info!(
                        "✅ Primary provider {} recovered, resetting breaker ({} failures)",
                        self.primary.name(),
                        state.failure_count
                    );
                }
                state.failure_count = 0;
                state.active = Some(ProviderRole::Primary);
                return Ok(SelectedProvider {
                    provider: self.primary.clone(),
                    role: ProviderRole::Primary,
                    latest_block,
                });
            }
            Err(e) => {
                let mut state = self.lock_state();
                state.record_failure(Instant::now());
                log::warn!(
                    "⚠️  Primary provider {} liveness check failed ({}/{}): {}",
                    self.primary.name(),
                    state.failure_count,
                    state.threshold,
                    e
                );
            }
        }

        if let Some(fallback) = &self.fallback {
            match self.check_liveness(fallback).await {
                Ok(latest_block) => {
                    self.lock_state().active = Some(ProviderRole::Fallback);
                    log::info!("↪️  Serving from fallback provider {}", fallback.name());
                    return Ok(SelectedProvider {
                        provider: fallback.clone(),
                        role: ProviderRole::Fallback,
                        latest_block,
                    });
                }
                Err(e) => {
                    log::warn!("⚠️  Fallback provider {} liveness check failed: {}", fallback.name(), e);
                }
            }
        }

        let mut state = self.lock_state();
        state.record_failure(Instant::now());
        state.active = None;
        log::error!(
            "❌ All providers unavailable (failure_count={})",
            state.failure_count
        );
        Err(PipelineError::AllProvidersUnavailable)
    }

    pub async fn state(&self) -> ProviderState {
        let rate_window_load = self.limiter.current_load().await;
        let now = Instant::now();
        let state = self.lock_state();
        ProviderState {
            circuit: state.status(now),
            failure_count: state.failure_count,
            active: state.active,
            cooldown_remaining_ms: state.open_for(now).map(|d| d.as_millis() as u64).unwrap_or(0),
            rate_window_load,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    async fn check_liveness(&self, provider: &Arc<dyn ChainRpc>) -> PipelineResult<u64> {
        self.limiter.wait_if_needed().await;
        let head = match timeout(self.liveness_timeout, provider.get_block_number()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(PipelineError::TransientNetwork(format!(
                    "{} liveness check timed out after {}ms",
                    provider.name(),
                    self.liveness_timeout.as_millis()
                )))
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.observe_block(head);
        }
        Ok(head)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::rpc::RpcBlock;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::advance;

    /// Scriptable provider: healthy flag plus call counter
    pub(crate) struct FakeRpc {
        pub name: String,
        pub healthy: AtomicBool,
        pub calls: AtomicU32,
        pub height: u64,
    }

    impl FakeRpc {
        pub fn new(name: &str, healthy: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                healthy: AtomicBool::new(healthy),
                calls: AtomicU32::new(0),
                height: 100,
            })
        }

        pub fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainRpc for FakeRpc {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_block_number(&self) -> PipelineResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(self.height)
            } else {
                Err(PipelineError::TransientNetwork(format!("{} down", self.name)))
            }
        }

        async fn get_block_with_txs(&self, _number: u64) -> PipelineResult<Option<RpcBlock>> {
            Ok(None)
        }

        async fn get_balance(&self, _address: &str) -> PipelineResult<u128> {
            Ok(0)
        }
    }

    fn pool(primary: Arc<FakeRpc>, fallback: Option<Arc<FakeRpc>>, threshold: u32) -> ProviderPool {
        ProviderPool::new(
            primary,
            fallback.map(|f| f as Arc<dyn ChainRpc>),
            Arc::new(RateLimiter::new(100, Duration::from_secs(1))),
            threshold,
            Duration::from_secs(60),
            Duration::from_secs(5),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_primary_is_selected() {
        let primary = FakeRpc::new("primary", true);
        let pool = pool(primary.clone(), None, 3);

        let selected = pool.get_provider().await.unwrap();
        assert_eq!(selected.role, ProviderRole::Primary);
        assert_eq!(selected.latest_block, 100);
        assert_eq!(pool.state().await.circuit, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_check_updates_last_block() {
        let metrics = Arc::new(PipelineMetrics::new());
        let pool = pool(FakeRpc::new("primary", true), None, 3).with_metrics(metrics.clone());
        assert_eq!(metrics.snapshot().last_block, 0);

        pool.get_provider().await.unwrap();
        assert_eq!(metrics.snapshot().last_block, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_served_without_resetting_failures() {
        let primary = FakeRpc::new("primary", false);
        let fallback = FakeRpc::new("fallback", true);
        let pool = pool(primary, Some(fallback), 5);

        let selected = pool.get_provider().await.unwrap();
        assert_eq!(selected.role, ProviderRole::Fallback);
        pool.get_provider().await.unwrap();

        let state = pool.state().await;
        assert_eq!(state.failure_count, 2);
        assert_eq!(state.active, Some(ProviderRole::Fallback));
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_down_three_checks_opens_then_recovers() {
        // threshold=3, cooldown=60s; fallback keeps the calls served
        let primary = FakeRpc::new("primary", false);
        let fallback = FakeRpc::new("fallback", true);
        let pool = pool(primary.clone(), Some(fallback), 3);

        for _ in 0..3 {
            let selected = pool.get_provider().await.unwrap();
            assert_eq!(selected.role, ProviderRole::Fallback);
        }

        // 4th call within the cooldown fails fast without probing
        let checks_before = primary.calls.load(Ordering::SeqCst);
        match pool.get_provider().await {
            Err(PipelineError::CircuitOpen { remaining }) => {
                assert!(remaining <= Duration::from_secs(60));
                assert!(remaining > Duration::from_secs(59));
            }
            other => panic!("expected CircuitOpen, got {:?}", other.map(|s| s.role)),
        }
        assert_eq!(primary.calls.load(Ordering::SeqCst), checks_before);
        assert_eq!(pool.state().await.circuit, CircuitStatus::Open);

        // After 61s the check succeeds and the breaker resets
        primary.set_healthy(true);
        advance(Duration::from_secs(61)).await;
        assert_eq!(pool.state().await.circuit, CircuitStatus::HalfOpen);

        let selected = pool.get_provider().await.unwrap();
        assert_eq!(selected.role, ProviderRole::Primary);
        assert_eq!(pool.state().await.failure_count, 0);
        assert_eq!(pool.state().await.circuit, CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_down_counts_twice_and_opens() {
        let primary = FakeRpc::new("primary", false);
        let fallback = FakeRpc::new("fallback", false);
        let pool = pool(primary, Some(fallback), 3);

        assert!(matches!(
            pool.get_provider().await,
            Err(PipelineError::AllProvidersUnavailable)
        ));
        assert_eq!(pool.state().await.failure_count, 2);

        assert!(matches!(
            pool.get_provider().await,
            Err(PipelineError::AllProvidersUnavailable)
        ));
        assert!(matches!(
            pool.get_provider().await,
            Err(PipelineError::CircuitOpen { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_half_open_check_reopens() {
        let primary = FakeRpc::new("primary", false);
        let pool = pool(primary, None, 2);

        // No fallback: each call counts twice
        assert!(pool.get_provider().await.is_err());
        assert!(matches!(
            pool.get_provider().await,
            Err(PipelineError::CircuitOpen { .. })
        ));

        advance(Duration::from_secs(61)).await;
        assert!(matches!(
            pool.get_provider().await,
            Err(PipelineError::AllProvidersUnavailable)
        ));
        assert!(matches!(
            pool.get_provider().await,
            Err(PipelineError::CircuitOpen { .. })
        ));
    }
}
