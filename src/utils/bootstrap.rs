//! Bootstrap utilities for notifier binaries.
//!
//! Shared initialization code for the worker and publisher binaries.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the NOTIFIER_LOG environment variable.
///
/// Defaults to "info" level if NOTIFIER_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Attempt a connection up to `max_attempts` times with a fixed delay.
///
/// # Arguments
/// * `service_name` - Human-readable name for logging (e.g., "broker")
/// * `max_attempts` - Total attempts, at least one is always made
/// * `delay` - Pause between failed attempts
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connection on success, or `(attempts, last_error)` once the budget is spent.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    max_attempts: u32,
    delay: Duration,
    mut connect: F,
) -> Result<T, (u32, E)>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                tracing::info!(attempt, "Connected to {}", service_name);
                return Ok(client);
            }
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %e,
                    "{} not ready, retrying in {:?}",
                    service_name,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                tracing::error!(
                    attempts = attempt,
                    error = %e,
                    "Failed to connect to {} after retries",
                    service_name
                );
                return Err((attempt, e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connect_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = connect_with_retry("test", 5, Duration::from_millis(1), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("refused")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = connect_with_retry("test", 3, Duration::from_millis(1), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("refused")
            }
        })
        .await;

        let (attempts, error) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert_eq!(error, "refused");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_budget_still_attempts_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = connect_with_retry("test", 0, Duration::from_millis(1), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("refused")
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
