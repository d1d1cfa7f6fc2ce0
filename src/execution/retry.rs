use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::domain::ExchangeId;
use crate::error::Result;

const MAX_BACKOFF_MS: u64 = 30_000;

/// Bounded retry for order submission.
///
/// Only errors proving the request never reached the matching engine
/// (`HedgeError::is_retryable`) are retried; anything else is returned at
/// once so a possibly-executed order is never resubmitted.
pub async fn submit_with_retry<T, F, Fut>(
    exchange: ExchangeId,
    operation: &str,
    max_retries: u8,
    backoff_ms: u64,
    mut submit: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        match submit().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts <= u32::from(max_retries) => {
                let jitter = rand::thread_rng().gen_range(0..=backoff_ms / 2);
                let factor = 1u64.checked_shl(attempts - 1).unwrap_or(u64::MAX);
                let delay = Duration::from_millis(
                    backoff_ms
                        .saturating_mul(factor)
                        .min(MAX_BACKOFF_MS)
                        .saturating_add(jitter),
                );
                warn!(
                    %exchange,
                    operation,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{} not submitted: {}. Retrying...",
                    operation,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(%exchange, operation, attempts, "{} failed: {}", operation, e);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HedgeError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_only_unsubmitted_failures() {
        let calls = AtomicU32::new(0);
        let result = submit_with_retry(ExchangeId::Bybit, "entry order", 2, 50, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(HedgeError::RateLimited {
                        exchange: ExchangeId::Bybit,
                        reason: "10006".into(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);

        let calls = AtomicU32::new(0);
        let result: Result<()> = submit_with_retry(ExchangeId::Bingx, "entry order", 2, 50, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(HedgeError::Exchange {
                    exchange: ExchangeId::Bingx,
                    reason: "read timeout".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_saturates_instead_of_overflowing() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = submit_with_retry(ExchangeId::Bybit, "entry order", u8::MAX, u64::MAX / 4, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(HedgeError::RateLimited {
                    exchange: ExchangeId::Bybit,
                    reason: "10006".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), u32::from(u8::MAX) + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = submit_with_retry(ExchangeId::Bybit, "close", 2, 10, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(HedgeError::Transient {
                    exchange: ExchangeId::Bybit,
                    reason: "connect refused".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
