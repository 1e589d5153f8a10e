//! Retrier: wraps the rate limiter and HTTP fetcher in a bounded
//! retry loop with jittered exponential backoff.
//!
//! The jitter formula is symmetric rather than one-sided: a coordinator
//! politely sharing one authority's capacity across many callers needs
//! jitter that can lengthen a delay too, or synchronized callers re-collide
//! on the same backoff step. This implements
//! `delay * (1 + U(-0.25, 0.25))`, clamped non-negative.
//!
//! The limiter permit is always released before sleeping for the next
//! attempt's backoff, so a slow retry on one authority doesn't starve
//! unrelated requests to the same authority of their concurrency slot.

use std::time::Duration;

use url::Url;

use crate::http::HttpFetcher;
use crate::http::FetchResponse;
use crate::limiter::Limiter;
use crate::resolved::{EffectiveConfig, ResolvedConfig, RetryPolicy};
use crate::types::WebFetchError;

const JITTER_SPAN: f64 = 0.25;

pub(crate) struct Retrier<'a> {
    limiter: &'a Limiter,
    fetcher: &'a HttpFetcher,
}

impl<'a> Retrier<'a> {
    pub fn new(limiter: &'a Limiter, fetcher: &'a HttpFetcher) -> Self {
        Self { limiter, fetcher }
    }

    /// Fetch `url`, retrying transient failures and retryable status codes
    /// up to `effective.retry.max_retries` times. Each attempt waits on the
    /// per-authority limiter first; a `Retry-After` or adaptive backoff the
    /// limiter already knows about is honored automatically by `wait`.
    pub async fn fetch(
        &self,
        authority: &str,
        url: &Url,
        effective: &EffectiveConfig,
        config: &ResolvedConfig,
        conditional: Option<&str>,
    ) -> Result<FetchResponse, WebFetchError> {
        let mut attempt = 0u32;

        loop {
            let permit = self.limiter.wait(authority, &effective.rate_limit).await?;
            let outcome = self.fetcher.fetch(url, effective, config, conditional).await;
            drop(permit);

            match outcome {
                Ok(resp) => {
                    self.limiter.record_response(authority, resp.status).await;

                    if !effective.retry.retry_on.contains(&resp.status) {
                        return Ok(resp);
                    }

                    if let Some(retry_after) = parse_retry_after(&resp) {
                        self.limiter.note_retry_after(authority, retry_after).await;
                    }

                    if attempt >= effective.retry.max_retries {
                        return Ok(resp);
                    }
                }
                Err(err) => {
                    if !err.retryable || attempt >= effective.retry.max_retries {
                        return Err(err);
                    }
                }
            }

            tokio::time::sleep(backoff_delay(attempt, &effective.retry)).await;
            attempt += 1;
        }
    }
}

/// `delay = min(initial * multiplier^attempt, max) * (1 + U(-0.25, 0.25))`,
/// clamped to zero.
fn backoff_delay(attempt: u32, retry: &RetryPolicy) -> Duration {
    let base = retry.initial_delay.as_secs_f64() * retry.multiplier.powi(attempt as i32);
    let capped = base.min(retry.max_delay.as_secs_f64());
    let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * JITTER_SPAN;
    Duration::from_secs_f64((capped * jitter).max(0.0))
}

/// Parse a `Retry-After` header: either an integer seconds count or an
/// HTTP-date. Returns `None` if absent or unparseable.
fn parse_retry_after(resp: &FetchResponse) -> Option<Duration> {
    let value = resp.header("retry-after")?;
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let target = httpdate::parse_http_date(value.trim()).ok()?;
    let now = std::time::SystemTime::now();
    target.duration_since(now).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(multiplier: f64, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            retry_on: vec![429, 500, 502, 503, 504],
        }
    }

    #[test]
    fn backoff_grows_with_attempt_and_stays_in_jitter_band() {
        let retry = policy(2.0, 500, 30_000);
        for attempt in 0..5 {
            let base = 500.0 * 2f64.powi(attempt as i32);
            let capped = base.min(30_000.0);
            let delay = backoff_delay(attempt, &retry).as_secs_f64() * 1000.0;
            assert!(delay >= capped * 0.75 - 1.0, "attempt {attempt}: {delay} too low for {capped}");
            assert!(delay <= capped * 1.25 + 1.0, "attempt {attempt}: {delay} too high for {capped}");
        }
    }

    #[test]
    fn backoff_never_negative() {
        let retry = policy(2.0, 0, 0);
        for attempt in 0..3 {
            assert!(backoff_delay(attempt, &retry).as_secs_f64() >= 0.0);
        }
    }

    #[test]
    fn backoff_respects_cap() {
        let retry = policy(10.0, 1000, 2000);
        let delay = backoff_delay(5, &retry).as_secs_f64() * 1000.0;
        assert!(delay <= 2000.0 * 1.25 + 1.0);
    }
}
