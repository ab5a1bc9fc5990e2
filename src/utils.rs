use std::{future::Future, time::Duration};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{clients::store::StatusStore, error::StoreError, models::retry::RetryConfig};

/// Spreads a delay by up to ten percent in either direction.
pub fn with_jitter(delay: Duration) -> Duration {
    let jitter: f64 = rand::random_range(-0.1..=0.1);
    delay.mul_f64(1.0 + jitter)
}

/// Runs `operation` up to `config.max_attempts` times, sleeping with jittered
/// exponential backoff between attempts. Used for synchronous collaborator
/// lookups; delivery retries go through the bus instead.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        attempt,
                        max_attempts = config.max_attempts,
                        "Retry succeeded"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                let delay = with_jitter(config.backoff_for(attempt - 1));

                debug!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retry attempt failed, backing off"
                );

                sleep(delay).await;
            }
        }
    }
}

/// Fixed-window limiter over the shared store. Returns `false` once `identity`
/// has made more than `max` calls in the current window.
pub async fn check_rate_limit(
    store: &dyn StatusStore,
    identity: &str,
    max: i64,
    window: Duration,
) -> Result<bool, StoreError> {
    let key = format!("rate_limit:{}", identity);
    let count = store.increment_counter(&key, window).await?;

    if count > max {
        debug!(identity, count, max, "Rate limit exceeded");
        return Ok(false);
    }

    Ok(true)
}
