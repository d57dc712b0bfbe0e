//! Retry configuration and exponential backoff logic.
//!
//! Broker-based transports use [`retry_with_backoff`] for connection
//! establishment, where the broker may simply not be up yet (container
//! startup ordering, broker restarts). A single failed connect is not a
//! reason to abort a process that could be serving requests a second
//! later.
//!
//! # Retry Strategy
//!
//! - Only retries [`RpcError::TransportRetryable`](crate::RpcError::TransportRetryable) errors
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration with exponential backoff.
///
/// Configure through [`RpcConfig::with_retry()`](crate::RpcConfig::with_retry).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f32,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    /// Reasonable default retry configuration.
    ///
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0 (exponential backoff)
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Executes the operation and retries it according to the retry
/// configuration if it fails with a retryable error. Non-retryable
/// errors fail immediately. If `retry_config` is `None`, the operation
/// executes exactly once.
///
/// # Backoff Algorithm
///
/// - First retry: `initial_delay` (with jitter)
/// - Subsequent retries: `min(current_delay * multiplier, max_delay)` (with jitter)
/// - Jitter: ±25% randomization to prevent synchronized retries
pub(crate) async fn retry_with_backoff<F, Fut, T>(
    retry_config: Option<&RetryConfig>,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let retry_config = match retry_config {
        Some(cfg) => cfg,
        None => {
            // No retry configured, just execute once
            return operation().await;
        }
    };

    let mut attempt = 0;
    let mut current_delay = retry_config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(crate::RpcError::TransportRetryable(details)) => {
                attempt += 1;

                if attempt > retry_config.max_attempts {
                    crate::log_debug!(
                        "retry exhausted after {} attempts, last error: {}",
                        retry_config.max_attempts,
                        details
                    );
                    return Err(crate::RpcError::TransportRetryable(details));
                }

                let jittered_delay = apply_jitter(current_delay);

                crate::log_debug!(
                    "retry attempt {}/{}, waiting {:?} before retry (error: {})",
                    attempt,
                    retry_config.max_attempts,
                    jittered_delay,
                    details
                );

                sleep(jittered_delay).await;

                let next_delay = Duration::from_secs_f64(
                    current_delay.as_secs_f64() * retry_config.multiplier as f64,
                );
                current_delay = next_delay.min(retry_config.max_delay);
            }
            Err(err) => {
                // Non-retryable error, fail immediately
                return Err(err);
            }
        }
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    let random_factor = (hash % 1000) as f64 / 1000.0;
    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
