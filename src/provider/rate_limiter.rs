//! Sliding-window rate limiter
//!
//! One instance is shared (via `Arc`) by every call to a given provider.
//! Callers are serialized through a single async mutex that is held across
//! the wait, so two callers can never both observe a free slot.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    calls: Mutex<VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            calls: Mutex::new(VecDeque::with_capacity(max_requests.max(1))),
            max_requests: max_requests.max(1),
            window,
        }
    }

    /// Suspend the caller until a slot is free inside the trailing window,
    /// then record the call.
    pub async fn wait_if_needed(&self) {
        let mut calls = self.calls.lock().await;

        loop {
            let now = Instant::now();
            purge(&mut calls, now, self.window);

            if calls.len() < self.max_requests {
                calls.push_back(now);
                return;
            }

            // Oldest entry is still inside the window after purge.
            let oldest = calls.front().copied().unwrap_or(now);
            let wait = self.window.saturating_sub(now.duration_since(oldest));
            log::debug!(
                "⏳ Rate limit reached ({}/{}), waiting {}ms",
                calls.len(),
                self.max_requests,
                wait.as_millis()
            );
            sleep(wait).await;
        }
    }

    /// Number of calls recorded inside the current window
    pub async fn current_load(&self) -> usize {
        let mut calls = self.calls.lock().await;
        purge(&mut calls, Instant::now(), self.window);
        calls.len()
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

fn purge(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = calls.front() {
        if now.duration_since(front) >= window {
            calls.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Every trailing window of `window` length holds at most `max` stamps.
    fn assert_window_respected(stamps: &[Instant], max: usize, window: Duration) {
        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < window)
                .count();
            assert!(
                in_window <= max,
                "{} calls inside one window (max {})",
                in_window,
                max
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_under_limit_do_not_wait() {
        let limiter = RateLimiter::new(3, Duration::from_millis(1000));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait_if_needed().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.current_load().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_call_waits_for_oldest_to_expire() {
        let limiter = RateLimiter::new(3, Duration::from_millis(1000));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait_if_needed().await;
        }
        limiter.wait_if_needed().await;

        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_never_exceed_window() {
        let window = Duration::from_millis(500);
        let limiter = RateLimiter::new(4, window);
        let mut stamps = Vec::new();

        for i in 0..25 {
            limiter.wait_if_needed().await;
            stamps.push(Instant::now());
            if i % 3 == 0 {
                sleep(Duration::from_millis(70)).await;
            }
        }

        assert_window_respected(&stamps, 4, window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_are_serialized() {
        let window = Duration::from_millis(1000);
        let limiter = Arc::new(RateLimiter::new(2, window));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            handles.push(tokio::spawn(async move {
                limiter.wait_if_needed().await;
                stamps.lock().await.push(Instant::now());
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut stamps = stamps.lock().await.clone();
        stamps.sort();
        assert_eq!(stamps.len(), 8);
        assert_window_respected(&stamps, 2, window);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_drops_after_window() {
        let limiter = RateLimiter::new(5, Duration::from_millis(200));
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;
        assert_eq!(limiter.current_load().await, 2);

        sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.current_load().await, 0);
    }
}
