//! Retry utilities: backoff builders for broker reconnection.
//!
//! Uses `backon` for exponential backoff with jitter between reconnect
//! cycles. Retries inside a single connect attempt use a fixed delay
//! (see `bootstrap::connect_with_retry`).

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between reconnect cycles after a connection loss.
///
/// - Min delay: `min_delay`
/// - Max delay: `max_delay`
/// - Unbounded attempts (the supervisor runs for the process lifetime)
/// - Jitter enabled
pub fn reconnect_backoff(min_delay: Duration, max_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay.max(min_delay))
        .without_max_times()
        .with_jitter()
}
