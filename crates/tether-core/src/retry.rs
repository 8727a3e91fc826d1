//! Backoff pacing for reconnect attempts.
//!
//! The reconnecting wrappers run every connect or accept through
//! [`retry_async`]. The delay doubles after each failure up to a cap, with
//! optional jitter so a fleet of clients does not reconnect in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy between failed attempts.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts before giving up, including the first. `None` never gives up.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after the failed attempt numbered `attempt` (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // Exponent clamped so the multiplier stays finite
        let doubled = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(64) as i32);
        let cap = self.max_delay.as_secs_f64();
        let mut secs = doubled.min(cap);

        if self.jitter {
            // 0.5..1.5 keeps the mean and never lands near zero
            secs = (secs * rand::rng().random_range(0.5..1.5)).min(cap);
        }
        Duration::from_secs_f64(secs)
    }

    fn gives_up_after(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt + 1 >= max)
    }
}

/// Run `attempt` until it succeeds, fails with an error `should_retry`
/// rejects, or the policy runs out of attempts.
///
/// Returns the last result together with the number of attempts made.
pub async fn retry_async<F, Fut, T, E>(
    config: &RetryConfig,
    mut attempt: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failed: u32 = 0;

    loop {
        match attempt().await {
            Ok(value) => {
                if failed > 0 {
                    debug!("Link attempt succeeded after {} failures", failed);
                }
                return (Ok(value), failed + 1);
            }
            Err(e) if !should_retry(&e) || config.gives_up_after(failed) => {
                return (Err(e), failed + 1);
            }
            Err(e) => {
                let delay = config.delay_for(failed);
                warn!("Link attempt {} failed: {}. Next try in {:?}", failed + 1, e, delay);
                tokio::time::sleep(delay).await;
                failed = failed.saturating_add(1);
            }
        }
    }
}
