//! Sliding-window rate limiter.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Allows at most `max_calls` acquisitions in any rolling `window`.
///
/// Waiting is cooperative: callers sleep until the oldest call in the
/// window expires.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter. A zero budget is raised to one call.
    #[must_use]
    pub fn new(max_calls: usize, window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Take one call slot, waiting for capacity if needed.
    ///
    /// Returns `false` without taking a slot if capacity would only free up
    /// after `deadline`.
    pub async fn acquire(&self, deadline: Option<Instant>) -> bool {
        loop {
            let next_free = {
                let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
                let now = Instant::now();
                while calls.front().is_some_and(|&t| t + self.window <= now) {
                    calls.pop_front();
                }
                if calls.len() < self.max_calls {
                    calls.push_back(now);
                    return true;
                }
                match calls.front() {
                    Some(&oldest) => oldest + self.window,
                    None => now,
                }
            };

            if deadline.is_some_and(|d| next_free > d) {
                debug!("rate budget exhausted before deadline");
                return false;
            }
            debug!(
                wait_ms = next_free.saturating_duration_since(Instant::now()).as_millis(),
                "waiting for rate budget"
            );
            tokio::time::sleep_until(next_free).await;
        }
    }

    /// Calls recorded in the current window.
    #[must_use]
    pub fn in_window(&self) -> usize {
        let calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        calls.iter().filter(|&&t| t + self.window > now).count()
    }

    /// Configured budget per window.
    #[must_use]
    pub const fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// Configured window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_budget_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(limiter.acquire(None).await);
        }
        assert_eq!(limiter.in_window(), 3);

        let start = Instant::now();
        assert!(limiter.acquire(None).await);
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_abandons() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.acquire(None).await);

        let deadline = Instant::now() + Duration::from_secs(10);
        assert!(!limiter.acquire(Some(deadline)).await);
        assert_eq!(limiter.in_window(), 1);

        let later = Instant::now() + Duration::from_secs(120);
        assert!(limiter.acquire(Some(later)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_window_never_exceeded() {
        let window = Duration::from_secs(10);
        let limiter = Arc::new(RateLimiter::new(4, window));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire(None).await;
                Instant::now()
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }
        times.sort();

        for (i, start) in times.iter().enumerate() {
            let in_window = times[i..].iter().filter(|&&t| t < *start + window).count();
            assert!(in_window <= 4, "{in_window} calls within one window");
        }
    }
}
