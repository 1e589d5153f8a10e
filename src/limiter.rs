//! Per-authority rate limiter: token-bucket pacing, a counting semaphore
//! for concurrency, server-advertised back-pressure (`Retry-After`), and an
//! additive adaptive backoff driven by observed response status.
//!
//! Grounded conceptually on the per-domain lazily-created semaphore shape in
//! `cyrup-ai-kodegen-tools-citescrape`'s `domain_limiter.rs` and on the
//! adaptive 429/5xx backoff curve in lychee's `ratelimit/host.rs`, both
//! reimplemented here with plain `tokio::sync::{RwLock,Semaphore}` rather
//! than `governor`/`DashMap` — this crate's rate-limiting state is small and
//! short-lived enough that the extra dependencies buy nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;

use crate::resolved::RateLimitPolicy;
use crate::types::{ErrorCode, WebFetchError};

const BACKOFF_429_SEED: Duration = Duration::from_millis(500);
const BACKOFF_429_CAP: Duration = Duration::from_secs(30);
const BACKOFF_5XX_STEP: Duration = Duration::from_millis(200);
const BACKOFF_5XX_CAP: Duration = Duration::from_secs(10);
const MAX_TRACKED_AUTHORITIES: usize = 10_000;

/// How often the background sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Authorities untouched for longer than this are dropped on a sweep.
const IDLE_GC_THRESHOLD: Duration = Duration::from_secs(30 * 60);

pub(crate) struct Limiter {
    authorities: Arc<RwLock<HashMap<String, Arc<AuthorityState>>>>,
    closed: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct AuthorityState {
    semaphore: Arc<Semaphore>,
    configured_max_concurrent: Mutex<u32>,
    bucket: Mutex<Option<TokenBucket>>,
    retry_after_until: Mutex<Instant>,
    backoff_until: Mutex<Instant>,
    adaptive_backoff: Mutex<Duration>,
    last_access: Mutex<Instant>,
}

/// Holds the concurrency permit for the duration of one in-flight request.
/// Dropping it (including on early return from an `?`) releases the slot.
pub(crate) struct LimiterPermit {
    // `None` when the authority's `max_concurrent` is 0 (unbounded): no
    // semaphore slot is held at all rather than one being manufactured.
    _permit: Option<OwnedSemaphorePermit>,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Refill based on elapsed time, then either consume a token (returning
    /// `None`) or report how long the caller must wait for one (`Some`).
    fn try_consume(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let deficit = 1.0 - self.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }
}

impl Limiter {
    pub fn new() -> Self {
        let authorities = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let sweeper = spawn_sweeper(Arc::clone(&authorities), Arc::clone(&closed));
        Self {
            authorities,
            closed,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Idempotent shutdown: stops the background sweeper and makes every
    /// subsequent `wait()` fail fast instead of acquiring a permit.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }
    }

    async fn state_for(&self, authority: &str) -> Arc<AuthorityState> {
        if let Some(state) = self.authorities.read().await.get(authority) {
            return Arc::clone(state);
        }

        let mut authorities = self.authorities.write().await;
        if let Some(state) = authorities.get(authority) {
            return Arc::clone(state);
        }

        if authorities.len() >= MAX_TRACKED_AUTHORITIES {
            evict_stalest(&mut authorities);
        }

        let now = Instant::now();
        let state = Arc::new(AuthorityState {
            semaphore: Arc::new(Semaphore::new(0)),
            configured_max_concurrent: Mutex::new(0),
            bucket: Mutex::new(None),
            retry_after_until: Mutex::new(now),
            backoff_until: Mutex::new(now),
            adaptive_backoff: Mutex::new(Duration::ZERO),
            last_access: Mutex::new(now),
        });
        authorities.insert(authority.to_string(), Arc::clone(&state));
        state
    }

    /// Wait until `authority` permits a request under `policy`, then hold a
    /// concurrency slot until the returned permit is dropped. Fails
    /// immediately if the limiter has been closed.
    pub async fn wait(&self, authority: &str, policy: &RateLimitPolicy) -> Result<LimiterPermit, WebFetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WebFetchError::new(
                ErrorCode::Internal,
                "fetch coordinator is shut down",
                false,
            ));
        }

        let state = self.state_for(authority).await;
        *state.last_access.lock().await = Instant::now();

        resize_semaphore(&state, policy.max_concurrent).await;

        loop {
            let deadline = {
                let retry_after = *state.retry_after_until.lock().await;
                let backoff = *state.backoff_until.lock().await;
                retry_after.max(backoff)
            };
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
                continue;
            }
            break;
        }

        let permit = if policy.max_concurrent == 0 {
            None
        } else {
            Some(
                Arc::clone(&state.semaphore)
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed while the limiter is alive"),
            )
        };

        loop {
            let wait_for = {
                let mut guard = state.bucket.lock().await;
                let bucket = guard.get_or_insert_with(|| new_bucket(policy));
                bucket.try_consume()
            };
            match wait_for {
                Some(d) => tokio::time::sleep(d).await,
                None => break,
            }
        }

        Ok(LimiterPermit { _permit: permit })
    }

    /// Record a `Retry-After` value observed on a response; the limiter will
    /// not issue another request to this authority before it elapses.
    pub async fn note_retry_after(&self, authority: &str, retry_after: Duration) {
        let state = self.state_for(authority).await;
        let mut until = state.retry_after_until.lock().await;
        let candidate = Instant::now() + retry_after;
        if candidate > *until {
            *until = candidate;
        }
    }

    /// Fold an observed status code into the adaptive backoff curve: `2xx`
    /// resets it, `429` doubles it (seeded at 500ms, capped at 30s), `5xx`
    /// adds a fixed 200ms (capped at 10s).
    pub async fn record_response(&self, authority: &str, status: u16) {
        let state = self.state_for(authority).await;
        let mut backoff = state.adaptive_backoff.lock().await;

        *backoff = if (200..300).contains(&status) {
            Duration::ZERO
        } else if status == 429 {
            if backoff.is_zero() {
                BACKOFF_429_SEED
            } else {
                (*backoff * 2).min(BACKOFF_429_CAP)
            }
        } else if (500..600).contains(&status) {
            (*backoff + BACKOFF_5XX_STEP).min(BACKOFF_5XX_CAP)
        } else {
            *backoff
        };

        let mut until = state.backoff_until.lock().await;
        *until = Instant::now() + *backoff;
    }
}

fn new_bucket(policy: &RateLimitPolicy) -> TokenBucket {
    let rate = if let Some(delay) = policy.delay {
        if delay.is_zero() { f64::INFINITY } else { 1.0 / delay.as_secs_f64() }
    } else if let Some(rps) = policy.requests_per_second {
        rps.max(0.001)
    } else {
        f64::INFINITY
    };
    TokenBucket::new(rate, f64::from(policy.burst.max(1)))
}

/// Resize `state`'s semaphore to `max_concurrent` total permits, tracked
/// against `configured_max_concurrent` rather than `available_permits()` —
/// the available count naturally drops below total while permits are
/// checked out, and comparing against it would inflate capacity by one for
/// every concurrent waiter. `max_concurrent == 0` means unbounded; `wait()`
/// skips acquiring from the semaphore entirely in that case, so its
/// capacity is left untouched here.
async fn resize_semaphore(state: &AuthorityState, max_concurrent: u32) {
    if max_concurrent == 0 {
        return;
    }

    let mut configured = state.configured_max_concurrent.lock().await;
    if *configured == max_concurrent {
        return;
    }

    if max_concurrent > *configured {
        state.semaphore.add_permits((max_concurrent - *configured) as usize);
    } else {
        state.semaphore.forget_permits((*configured - max_concurrent) as usize);
    }
    *configured = max_concurrent;
}

/// Periodically drop authority state that hasn't been touched in
/// `IDLE_GC_THRESHOLD`, so a long-lived coordinator doesn't accumulate
/// unbounded state for every host it has ever fetched from.
fn spawn_sweeper(
    authorities: Arc<RwLock<HashMap<String, Arc<AuthorityState>>>>,
    closed: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            if closed.load(Ordering::SeqCst) {
                return;
            }

            let mut guard = authorities.write().await;
            let mut stale = Vec::new();
            for (key, state) in guard.iter() {
                let idle_for = Instant::now().saturating_duration_since(*state.last_access.lock().await);
                if idle_for >= IDLE_GC_THRESHOLD {
                    stale.push(key.clone());
                }
            }
            for key in stale {
                guard.remove(&key);
            }
        }
    })
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.sweeper.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

fn evict_stalest(authorities: &mut HashMap<String, Arc<AuthorityState>>) {
    let stalest = authorities
        .iter()
        .min_by_key(|(_, state)| state.last_access.try_lock().map(|g| *g).unwrap_or(Instant::now()))
        .map(|(k, _)| k.clone());
    if let Some(key) = stalest {
        authorities.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_concurrent: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            requests_per_second: None,
            delay: None,
            burst: 1,
            max_concurrent,
            respect_retry_after: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_delays_next_wait() {
        let limiter = Limiter::new();
        let _permit = limiter.wait("example.com", &policy(4)).await.unwrap();
        drop(_permit);

        limiter.note_retry_after("example.com", Duration::from_millis(200)).await;

        let start = tokio::time::Instant::now();
        let _permit2 = limiter.wait("example.com", &policy(4)).await.unwrap();
        assert!(tokio::time::Instant::now() - start >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_backoff_grows_and_resets() {
        let limiter = Limiter::new();
        limiter.record_response("example.com", 429).await;
        limiter.record_response("example.com", 429).await;

        let start = tokio::time::Instant::now();
        let _permit = limiter.wait("example.com", &policy(4)).await.unwrap();
        // seeded 500ms then doubled once -> 1000ms
        assert!(tokio::time::Instant::now() - start >= Duration::from_millis(1000));
        drop(_permit);

        limiter.record_response("example.com", 200).await;
        let start2 = tokio::time::Instant::now();
        let _permit2 = limiter.wait("example.com", &policy(4)).await.unwrap();
        assert!(tokio::time::Instant::now() - start2 < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn max_concurrent_limits_parallelism() {
        let limiter = Arc::new(Limiter::new());
        let p1 = limiter.wait("example.com", &policy(1)).await.unwrap();
        let limiter2 = Arc::clone(&limiter);
        let handle = tokio::spawn(async move {
            let _p2 = limiter2.wait("example.com", &policy(1)).await.unwrap();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(p1);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_waits() {
        let limiter = Limiter::new();
        limiter.close().await;
        limiter.close().await;
        let err = limiter.wait("example.com", &policy(1)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }
}
