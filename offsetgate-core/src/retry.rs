//! Bounded exponential backoff for the two places the core retries: latest-position fetches and
//! progress commits.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Delay sequence `base * factor^(n-1)` capped at `max_interval`, with `jitter` spreading each
/// delay over `[1 - jitter, 1 + jitter]`. Yields `max_retries` delays and then ends.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    max_retries: usize,
    attempt: usize,
}

impl Backoff {
    pub fn new(
        base_interval: Duration,
        max_interval: Duration,
        factor: f64,
        jitter: f64,
        max_retries: usize,
    ) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            max_retries,
            attempt: 0,
        }
    }

    /// 100ms doubling up to 5s, 20% jitter.
    pub fn with_retries(max_retries: usize) -> Self {
        Self::new(
            Duration::from_millis(100),
            Duration::from_secs(5),
            2.0,
            0.2,
            max_retries,
        )
    }

    /// Same shape without jitter, handy where timings must be predictable.
    pub fn fixed_factor(base_interval: Duration, max_retries: usize) -> Self {
        Self::new(base_interval, base_interval * 64, 2.0, 0.0, max_retries)
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms = self.base_interval.as_millis() as f64 * self.factor.powi(exp);

        let delay_ms = if self.jitter == 0.0 {
            base_ms
        } else {
            base_ms * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        };

        // `as` saturates for out-of-range floats
        Duration::from_millis(delay_ms as u64).min(self.max_interval)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or `backoff` runs dry. Every
/// wait is abandoned as soon as `cancel` fires. Returns the last error together with the number
/// of attempts made.
pub async fn retry<T, F, Fut>(
    mut backoff: Backoff,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> std::result::Result<T, (Error, usize)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let err = match op().await {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_retryable() => return Err((e, attempts)),
            Err(e) => e,
        };

        let Some(delay) = backoff.next() else {
            return Err((err, attempts));
        };

        debug!(what, attempts, ?delay, error = %err, "Retrying after backoff");
        tokio::select! {
            _ = cancel.cancelled() => return Err((Error::Cancelled, attempts)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
