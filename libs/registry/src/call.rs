//! Bounded registry calls.

use std::future::Future;
use std::time::Duration;

use scf_reconcile::BackoffPolicy;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};

/// Run a registry call under a deadline.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> RegistryResult<T>
where
    F: Future<Output = RegistryResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RegistryError::Timeout(timeout)),
    }
}

/// Run `op` under `timeout`, retrying transient failures with backoff.
///
/// Non-transient errors (conflicts, not-found, ...) are returned immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &BackoffPolicy,
    max_attempts: u32,
    timeout: Duration,
    mut op: F,
) -> RegistryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RegistryResult<T>>,
{
    let mut attempt = 0;
    loop {
        match with_timeout(timeout, op()).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = policy.delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying registry call");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
