//! Contract updater
//!
//! Takes drained batches from the aggregation queue and writes them to the
//! scoring contract:
//!
//! 1. Merge updates sharing (user, dimension), first-arrival order
//! 2. Make sure every user in the batch has a profile (before any write)
//! 3. `updateDimension` per merged update, with bounded retry
//! 4. Exhausted updates go to the dead-letter store
//!
//! Only infrastructure failures (profile check unreachable, dead-letter store
//! down) fail the whole batch, which makes the queue re-queue it.

use super::contract::ScoringContract;
use super::dead_letter::DeadLetterStore;
use super::metrics::PipelineMetrics;
use super::queue::BatchSubmitter;
use super::types::{current_timestamp, CreditDimension, CreditDimensionUpdate};
use crate::error::{PipelineError, PipelineResult};
use crate::provider::backoff::{default_backoff, retry_with_backoff, ExponentialBackoff};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub submitted: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub still_failing: usize,
}

pub struct ContractUpdater {
    contract: Arc<dyn ScoringContract>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<PipelineMetrics>,
    known_profiles: Mutex<HashSet<String>>,
    max_attempts: u32,
    backoff: ExponentialBackoff,
}

impl ContractUpdater {
    pub fn new(
        contract: Arc<dyn ScoringContract>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<PipelineMetrics>,
        max_attempts: u32,
    ) -> Self {
        Self {
            contract,
            dead_letters,
            metrics,
            known_profiles: Mutex::new(HashSet::new()),
            max_attempts: max_attempts.max(1),
            backoff: default_backoff(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Idempotent: read, create if missing, remember the answer.
    ///
    /// A failed read propagates as-is. A failed create is reported as
    /// `ContractSubmission` so callers can dead-letter that user's updates.
    pub async fn ensure_profile(&self, user: &str) -> PipelineResult<()> {
        let user = user.to_lowercase();
        if self.is_known(&user) {
            return Ok(());
        }

        let contract = &self.contract;
        let address = user.as_str();
        let exists = retry_with_backoff("getProfile", self.max_attempts, self.backoff.clone(), move || {
            contract.get_profile(address)
        })
        .await?;

        if !exists {
            retry_with_backoff("createProfile", self.max_attempts, self.backoff.clone(), move || {
                contract.create_profile(address)
            })
            .await
            .map_err(|e| PipelineError::ContractSubmission(format!("createProfile for {}: {}", user, e)))?;
            log::info!("👤 Created profile for {}", user);
        }

        self.lock_known().insert(user);
        Ok(())
    }

    pub async fn submit_batch(&self, batch: &[CreditDimensionUpdate]) -> PipelineResult<BatchOutcome> {
        let merged = merge_updates(batch);
        let mut outcome = BatchOutcome::default();

        // Profiles first, so an unreachable node fails the batch before any write
        let mut profile_failures: HashMap<String, String> = HashMap::new();
        for user in unique_users(&merged) {
            match self.ensure_profile(&user).await {
                Ok(()) => {}
                Err(PipelineError::ContractSubmission(msg)) => {
                    profile_failures.insert(user, msg);
                }
                Err(e) => return Err(e),
            }
        }

        for update in &merged {
            if let Some(reason) = profile_failures.get(update.user_address()) {
                self.record_exhausted(update, reason, self.max_attempts).await?;
                outcome.dead_lettered += 1;
                continue;
            }

            match self.write_update(update).await {
                Ok(tx_hash) => {
                    outcome.submitted += 1;
                    log::debug!(
                        "📝 {} / {} updated ({} points) in {}",
                        update.user_address(),
                        update.dimension(),
                        update.len(),
                        tx_hash
                    );
                }
                Err(e) => {
                    self.record_exhausted(update, &e.to_string(), self.max_attempts).await?;
                    outcome.dead_lettered += 1;
                }
            }
        }

        log::info!(
            "📦 Batch done: {} updates in, {} merged, {} submitted, {} dead-lettered",
            batch.len(),
            merged.len(),
            outcome.submitted,
            outcome.dead_lettered
        );
        Ok(outcome)
    }

    /// Re-submit up to `limit` stored entries, removing those that succeed
    pub async fn replay_dead_letters(&self, limit: usize) -> PipelineResult<ReplayOutcome> {
        let entries = self.dead_letters.pending(limit).await?;
        let mut outcome = ReplayOutcome::default();

        for entry in entries {
            let result = match self.ensure_profile(entry.update.user_address()).await {
                Ok(()) => self.write_update(&entry.update).await.map(|_| ()),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.dead_letters.remove(entry.id).await?;
                    outcome.replayed += 1;
                }
                Err(e) => {
                    log::warn!("⚠️  Replay of dead letter #{} failed: {}", entry.id, e);
                    outcome.still_failing += 1;
                }
            }
        }

        if outcome.replayed > 0 || outcome.still_failing > 0 {
            log::info!(
                "🔁 Dead-letter replay: {} replayed, {} still failing",
                outcome.replayed,
                outcome.still_failing
            );
        }
        Ok(outcome)
    }

    /// Store every (merged) update without attempting a write
    pub async fn dead_letter_all(&self, batch: &[CreditDimensionUpdate], reason: &str) -> PipelineResult<usize> {
        let merged = merge_updates(batch);
        for update in &merged {
            self.record_exhausted(update, reason, 0).await?;
        }
        Ok(merged.len())
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    async fn write_update(&self, update: &CreditDimensionUpdate) -> PipelineResult<String> {
        let contract = &self.contract;
        let result = retry_with_backoff("updateDimension", self.max_attempts, self.backoff.clone(), move || {
            contract.update_dimension(update)
        })
        .await;

        match &result {
            Ok(_) => self.metrics.record_submit_success(current_timestamp()),
            Err(_) => self.metrics.record_submit_failure(),
        }
        result
    }

    async fn record_exhausted(&self, update: &CreditDimensionUpdate, reason: &str, attempts: u32) -> PipelineResult<()> {
        self.dead_letters.record(update, reason, attempts).await?;
        self.metrics.record_dead_lettered(1);
        Ok(())
    }

    fn is_known(&self, user: &str) -> bool {
        self.lock_known().contains(user)
    }

    fn lock_known(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.known_profiles.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl BatchSubmitter for ContractUpdater {
    async fn submit(&self, batch: &[CreditDimensionUpdate]) -> PipelineResult<()> {
        self.submit_batch(batch).await.map(|_| ())
    }

    async fn dead_letter(&self, batch: &[CreditDimensionUpdate], reason: &str) -> PipelineResult<()> {
        self.dead_letter_all(batch, reason).await.map(|_| ())
    }
}

/// Merge same-(user, dimension) updates. Output order is the first arrival of
/// each key; points within a key keep arrival order.
pub fn merge_updates(batch: &[CreditDimensionUpdate]) -> Vec<CreditDimensionUpdate> {
    let mut index: HashMap<(String, CreditDimension), usize> = HashMap::new();
    let mut merged: Vec<CreditDimensionUpdate> = Vec::new();

    for update in batch {
        match index.get(&update.key()) {
            Some(&i) => merged[i].merge(update),
            None => {
                index.insert(update.key(), merged.len());
                merged.push(update.clone());
            }
        }
    }
    merged
}

fn unique_users(updates: &[CreditDimensionUpdate]) -> Vec<String> {
    let mut seen = HashSet::new();
    updates
        .iter()
        .map(|u| u.user_address().to_string())
        .filter(|u| seen.insert(u.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::contract::DimensionScore;
    use crate::pipeline::dead_letter::SqliteDeadLetterStore;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    const ALICE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[derive(Default)]
    struct FakeContract {
        profiles: Mutex<HashSet<String>>,
        writes: Mutex<Vec<CreditDimensionUpdate>>,
        profile_reads: AtomicU32,
        /// Number of upcoming update_dimension calls that fail
        failing_updates: AtomicU32,
        node_down: AtomicBool,
    }

    #[async_trait]
    impl ScoringContract for FakeContract {
        async fn get_profile(&self, user: &str) -> PipelineResult<bool> {
            self.profile_reads.fetch_add(1, Ordering::SeqCst);
            if self.node_down.load(Ordering::SeqCst) {
                return Err(PipelineError::TransientNetwork("connection refused".into()));
            }
            Ok(self.profiles.lock().unwrap().contains(user))
        }

        async fn create_profile(&self, user: &str) -> PipelineResult<String> {
            self.profiles.lock().unwrap().insert(user.to_string());
            Ok("0xcreate".into())
        }

        async fn update_dimension(&self, update: &CreditDimensionUpdate) -> PipelineResult<String> {
            let remaining = self.failing_updates.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_updates.store(remaining - 1, Ordering::SeqCst);
                return Err(PipelineError::ContractSubmission("reverted".into()));
            }
            self.writes.lock().unwrap().push(update.clone());
            Ok("0xupdate".into())
        }

        async fn get_dimension(&self, _user: &str, _dimension: CreditDimension) -> PipelineResult<DimensionScore> {
            Ok(DimensionScore::default())
        }
    }

    fn updater(contract: Arc<FakeContract>, store: Arc<SqliteDeadLetterStore>) -> ContractUpdater {
        ContractUpdater::new(contract, store, Arc::new(PipelineMetrics::new()), 3).with_backoff(
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(40), 5).without_jitter(),
        )
    }

    fn upd(user: &str, dim: CreditDimension, raw: u128) -> CreditDimensionUpdate {
        CreditDimensionUpdate::single(user, dim, raw, 100)
    }

    #[test]
    fn test_merge_preserves_first_arrival_order() {
        let batch = vec![
            upd(ALICE, CreditDimension::StakingCommitment, 1),
            upd(BOB, CreditDimension::DefiReliability, 2),
            upd(ALICE, CreditDimension::StakingCommitment, 3),
            upd(ALICE, CreditDimension::DefiReliability, 4),
        ];
        let merged = merge_updates(&batch);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].key(), (ALICE.to_string(), CreditDimension::StakingCommitment));
        assert_eq!(merged[0].raw_data_points(), &[1, 3]);
        assert_eq!(merged[0].weights(), &[100, 100]);
        assert_eq!(merged[1].user_address(), BOB);
        assert_eq!(merged[2].raw_data_points(), &[4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_profile_created_once() {
        let contract = Arc::new(FakeContract::default());
        let updater = updater(contract.clone(), Arc::new(SqliteDeadLetterStore::in_memory().unwrap()));

        updater.ensure_profile(ALICE).await.unwrap();
        updater.ensure_profile(ALICE).await.unwrap();

        assert!(contract.profiles.lock().unwrap().contains(ALICE));
        assert_eq!(contract.profile_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_submits_merged_updates() {
        let contract = Arc::new(FakeContract::default());
        let updater = updater(contract.clone(), Arc::new(SqliteDeadLetterStore::in_memory().unwrap()));

        let outcome = updater
            .submit_batch(&[
                upd(ALICE, CreditDimension::TradingConsistency, 1),
                upd(ALICE, CreditDimension::TradingConsistency, 2),
            ])
            .await
            .unwrap();

        assert_eq!(outcome, BatchOutcome { submitted: 1, dead_lettered: 0 });
        let writes = contract.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].raw_data_points(), &[1, 2]);

        let snap = updater.metrics().snapshot();
        assert_eq!(snap.submit_success, 1);
        assert!(snap.last_update_time > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_within_budget() {
        let contract = Arc::new(FakeContract::default());
        contract.failing_updates.store(2, Ordering::SeqCst);
        let updater = updater(contract.clone(), Arc::new(SqliteDeadLetterStore::in_memory().unwrap()));

        let outcome = updater
            .submit_batch(&[upd(ALICE, CreditDimension::DefiReliability, 9)])
            .await
            .unwrap();
        assert_eq!(outcome.submitted, 1);
        assert_eq!(contract.writes.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_update_is_dead_lettered_then_replayed() {
        let contract = Arc::new(FakeContract::default());
        contract.failing_updates.store(3, Ordering::SeqCst);
        let store = Arc::new(SqliteDeadLetterStore::in_memory().unwrap());
        let updater = updater(contract.clone(), store.clone());

        let outcome = updater
            .submit_batch(&[upd(ALICE, CreditDimension::DefiReliability, 9)])
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome { submitted: 0, dead_lettered: 1 });
        assert_eq!(store.count().await.unwrap(), 1);

        let snap = updater.metrics().snapshot();
        assert_eq!(snap.submit_failure, 1);
        assert_eq!(snap.dead_lettered, 1);

        let replay = updater.replay_dead_letters(10).await.unwrap();
        assert_eq!(replay, ReplayOutcome { replayed: 1, still_failing: 0 });
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(contract.writes.lock().unwrap()[0].raw_data_points(), &[9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_node_fails_whole_batch() {
        let contract = Arc::new(FakeContract::default());
        contract.node_down.store(true, Ordering::SeqCst);
        let store = Arc::new(SqliteDeadLetterStore::in_memory().unwrap());
        let updater = updater(contract.clone(), store.clone());

        let result = updater
            .submit_batch(&[upd(BOB, CreditDimension::LiquidityProvision, 5)])
            .await;
        assert!(result.is_err());
        assert!(contract.writes.lock().unwrap().is_empty());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dead_letter_all_stores_merged() {
        let contract = Arc::new(FakeContract::default());
        let store = Arc::new(SqliteDeadLetterStore::in_memory().unwrap());
        let updater = updater(contract, store.clone());

        let stored = updater
            .dead_letter_all(
                &[
                    upd(ALICE, CreditDimension::DefiReliability, 1),
                    upd(ALICE, CreditDimension::DefiReliability, 2),
                    upd(BOB, CreditDimension::DefiReliability, 3),
                ],
                "shutdown",
            )
            .await
            .unwrap();
        assert_eq!(stored, 2);
        assert_eq!(store.count().await.unwrap(), 2);
    }
}
