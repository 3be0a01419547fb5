//! Bounded retry with exponential backoff and jitter
//!
//! Transient failures against the coordination store are retried locally
//! and never surfaced; once the budget is exhausted the last error is
//! returned to the nearest caller.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry policy with exponential backoff.
///
/// Delays are expressed in milliseconds so the policy can be loaded
/// straight from configuration files.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds (default: 100ms)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a single delay in milliseconds (default: 5000ms)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Backoff multiplier between attempts (default: 2.0)
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random jitter as a fraction of the delay (default: 0.2)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Compute the backoff delay before the given retry.
    ///
    /// `attempt` is 1-based: the delay returned for attempt N is slept
    /// after the Nth failure. Jitter keeps independent processes from
    /// retrying in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay_ms as f64);
        let jitter = capped * self.jitter * rand::rng().random_range(-1.0..=1.0);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Run `op` until it succeeds, the error is not retryable, or the
    /// attempt budget is exhausted. The last error is returned verbatim.
    pub async fn run_if<T, E, F, Fut, P>(&self, op_name: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && retryable(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        op_name, attempt, self.max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run `op`, treating every error as retryable.
    pub async fn run<T, E, F, Fut>(&self, op_name: &str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run_if(op_name, op, |_| true).await
    }
}
