use crate::error::{PipelineError, PipelineResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    current_attempt: u32,
    jitter: bool,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: retries,
            current_attempt: 0,
            jitter: true,
        }
    }

    /// Deterministic delays, for tests that assert on elapsed time
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next retry, capped at `max_delay`
    pub fn next_delay(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.current_attempt);
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !base.is_zero() {
            // Up to +25%, still capped
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
            (base + Duration::from_millis(extra)).min(self.max_delay)
        } else {
            base
        }
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let delay = self.next_delay();

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

/// Run `op` up to `attempts` times, sleeping with exponential backoff between
/// transient failures. Non-transient errors return immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    attempts: u32,
    mut backoff: ExponentialBackoff,
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                log::warn!("⚠️  {} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                if backoff.sleep().await.is_err() {
                    return Err(e);
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Backoff used for indexer pages and contract writes
pub fn default_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(8), 5)
}

impl From<MaxRetriesExceeded> for PipelineError {
    fn from(_: MaxRetriesExceeded) -> Self {
        PipelineError::TransientNetwork("maximum retry attempts exceeded".to_string())
    }
}
