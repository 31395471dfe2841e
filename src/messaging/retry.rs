//! Bounded retry with exponential backoff for transport failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{MeshError, Result};

/// What happens to `message_id` when a send is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendIdPolicy {
    /// Every attempt carries the original id; the consumer dedup cache
    /// suppresses a copy that did land before the failure was observed.
    #[default]
    Reuse,
    /// Every attempt carries a new id; only `task_id` links the attempts.
    Fresh,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub resend_id: ResendIdPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            resend_id: config.resend_id,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    error!(op = label, attempts = attempt, error = %e, "Retries exhausted");
                    return Err(MeshError::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
