//! Bounded exponential retry with full jitter for remote tier round-trips.
//!
//! Remote adapters wrap every round-trip that may be throttled. The caller
//! supplies the classifier: only errors it accepts are retried, everything
//! else surfaces immediately. Backoff sleeps observe the caller's context.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// Max attempts including the first.
pub const MAX_ATTEMPTS: usize = 5;
/// Base backoff (ms)
const BACKOFF_BASE_MS: u64 = 50;
/// Maximum backoff cap (ms)
const BACKOFF_MAX_MS: u64 = 5_000;

/// HTTP status codes worth retrying: throttling and transient server faults.
pub fn retriable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Run `op`, retrying errors `is_retriable` accepts with exponential
/// full-jitter backoff.
///
/// Non-retriable errors terminate immediately; once the attempt budget is
/// spent the last error surfaces. The backoff sleep is cancellable: when
/// `ctx` fires, the call returns `CacheError::Cancelled`.
pub async fn with_retry<T, F, Fut, R>(
    ctx: &CancellationToken,
    is_retriable: R,
    op: F,
) -> CacheResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
    R: Fn(&CacheError) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_retriable(&err) || attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }

                let backoff_ms = backoff_with_jitter(attempt);
                debug!(
                    "retriable backend error (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_ATTEMPTS, err, backoff_ms
                );

                tokio::select! {
                    _ = ctx.cancelled() => return Err(CacheError::Cancelled),
                    _ = sleep(Duration::from_millis(backoff_ms)) => {}
                }
            }
        }
    }
}

/// Full jitter: random(0, min(BACKOFF_MAX_MS, BACKOFF_BASE_MS * 2^(attempt-1)))
fn backoff_with_jitter(attempt: usize) -> u64 {
    let mut rng = rand::thread_rng();

    let exp_backoff = BACKOFF_BASE_MS
        .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1) as u32));

    rng.gen_range(0..=exp_backoff.min(BACKOFF_MAX_MS))
}
