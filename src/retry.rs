//! Retry with exponential backoff, shared by every dispatch path that is
//! allowed to try again.

use crate::error::GatewayError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff policy: `max_attempts` tries, delays starting at `base` and
/// doubling up to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            multiplier: 2,
        }
    }
}

impl Backoff {
    /// A single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Run `op` up to the policy's attempt budget. The closure receives the
/// 1-based attempt number; the last error is returned when every attempt
/// fails.
pub async fn retry<T, F, Fut>(policy: Backoff, mut op: F) -> Result<T, GatewayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    let mut delay = policy.base;
    let mut last_error = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("attempt {}/{} failed: {}", attempt, policy.max_attempts, err);
                last_error = Some(err);
                if attempt < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * policy.multiplier).min(policy.cap);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| GatewayError::Internal("retry exhausted".to_string())))
}
