//! Safe URL fetching for LLM consumption: composes SSRF validation,
//! per-site policy resolution, stale-while-revalidate disk caching,
//! robots.txt enforcement, rate-limited retrying HTTP fetch, content
//! parsing, and token-budgeted truncation/chunking into one `fetch()` entry
//! point.
//!
//! One [`FetchCoordinator`] is meant to live for the lifetime of its owning
//! process: the per-authority rate limiter, the robots.txt cache, and the
//! disk cache's in-memory LRU index all accumulate state across calls that a
//! fresh instance per request would throw away.

#![allow(dead_code)]

mod cache;
mod chunk;
mod http;
mod limiter;
mod parser;
mod resolved;
mod retry;
mod robots;
mod ssrf;
mod token;
mod truncate;
mod types;

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::Mutex as AsyncMutex;
use url::Url;

use cache::{Cache, CacheEntry, CacheLookup, SingleFlight};
use http::HttpFetcher;
use limiter::Limiter;
use parser::ParserRegistry;
use resolved::{CachePolicy, EffectiveConfig, ResolvedConfig, ResolvedRequest};
use retry::Retrier;
use robots::RobotsResult;

pub use types::{
    CacheState, ErrorCode, ErrorDetails, FetchChunk, Note, RangeKind, RangeSpec, RawCachePolicy,
    RawFetchPolicy, RawPolicyBlock, RawRateLimitPolicy, RawRetryPolicy, RewriteKind, RobotsConfig,
    SecurityConfig, SiteOverride, UrlRewriteRule, WebFetchConfig, WebFetchError, WebFetchInput,
    WebFetchOutput,
};

/// Per-chunk token budget used when a request doesn't set
/// `max_tokens`. The chunker's budget is independent of the truncator's
/// overall-body budget — see `crate::chunk`'s module doc.
const DEFAULT_CHUNK_TOKENS: u32 = 2048;

/// Process-wide coordinator: one rate limiter, one HTTP client, one disk
/// cache, shared across every `fetch()` call. Cheap to clone — an `Arc`
/// around shared state — so a facade can hand a copy to each connection
/// handler.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    config: ResolvedConfig,
    limiter: Limiter,
    fetcher: HttpFetcher,
    parser: ParserRegistry,
    cache: Option<AsyncMutex<Cache>>,
    fetch_flight: SingleFlight<FetchOutcome>,
    revalidate_flight: SingleFlight<()>,
}

/// Single-flight payload for the cache-miss path: either a usable cache
/// entry plus the notes its fetch accumulated, or an error, shared verbatim
/// across every caller racing on the same URL.
type FetchOutcome = Result<(CacheEntry, Vec<Note>), WebFetchError>;

impl FetchCoordinator {
    /// Build a coordinator from boundary configuration: compiles site
    /// patterns and URL-rewrite rules once, builds the shared HTTP client,
    /// and opens (creating if necessary) the disk cache directory.
    ///
    /// # Errors
    ///
    /// Returns `WebFetchError` if the configuration is invalid (bad site
    /// pattern, bad regex, ...) or the HTTP client / cache directory fails
    /// to initialize.
    pub fn new(config: &WebFetchConfig) -> Result<Self, WebFetchError> {
        let resolved = ResolvedConfig::from_config(config)?;
        let fetcher = HttpFetcher::new(&resolved.security)?;
        let cache = match &resolved.cache {
            CachePolicy::Disabled => None,
            CachePolicy::Enabled(settings) => Some(AsyncMutex::new(Cache::new(settings)?)),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                config: resolved,
                limiter: Limiter::new(),
                fetcher,
                parser: ParserRegistry::new(),
                cache,
                fetch_flight: SingleFlight::new(),
                revalidate_flight: SingleFlight::new(),
            }),
        })
    }

    /// Shut down the rate limiter's background sweeper. Safe to call more
    /// than once, and safe to skip entirely — dropping the last clone does
    /// the same thing.
    pub async fn close(&self) {
        self.inner.limiter.close().await;
    }

    /// Run one fetch end to end: validate the
    /// URL, resolve the per-site effective policy, consult the cache
    /// (serving stale entries immediately while revalidating them in the
    /// background), enforce robots.txt, fetch with rate-limited retries,
    /// parse the body, and truncate/chunk the result to the caller's token
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns `WebFetchError` for any validation, network, robots, or
    /// extraction failure that the request cannot recover from.
    pub async fn fetch(&self, input: WebFetchInput) -> Result<WebFetchOutput, WebFetchError> {
        let range = input.range;
        let mut request = ResolvedRequest::from_input(&input);
        let mut notes = Vec::new();

        if request.url.scheme() == "http" && !self.inner.config.security.allow_insecure_overrides {
            let mut upgraded = request.url.clone();
            let _ = upgraded.set_scheme("https");
            request.url = upgraded;
            notes.push(Note::HttpUpgradedToHttps);
        }

        ssrf::parse_and_validate(request.url.as_str())?;

        let effective = self.inner.config.effective_for(&request.url)?;
        let key = cache::cache_key(&request.url);

        if !request.no_cache
            && let Some(cache) = &self.inner.cache
        {
            let lookup = cache.lock().await.get(&request.url, &effective.cache);
            match lookup {
                CacheLookup::Fresh(entry) => {
                    notes.push(Note::CacheHit);
                    let cached_at = entry.stored_at.clone();
                    return Ok(self.build_output(
                        request.requested_url,
                        &entry,
                        CacheState::Fresh,
                        Some(cached_at),
                        request.max_tokens,
                        range,
                        notes,
                    ));
                }
                CacheLookup::Stale(entry) => {
                    notes.push(Note::CacheStale);
                    self.spawn_revalidation(key.clone(), request.url.clone(), effective.clone(), entry.clone());
                    let cached_at = entry.stored_at.clone();
                    return Ok(self.build_output(
                        request.requested_url,
                        &entry,
                        CacheState::Stale,
                        Some(cached_at),
                        request.max_tokens,
                        range,
                        notes,
                    ));
                }
                CacheLookup::Miss => {}
            }
        }

        let url_for_fetch = request.url.clone();
        let effective_for_fetch = effective.clone();
        let (entry, mut fetch_notes) = self
            .inner
            .fetch_flight
            .run(&key, || self.perform_fetch(url_for_fetch, effective_for_fetch))
            .await?;
        notes.append(&mut fetch_notes);

        if !request.no_cache
            && let Some(cache) = &self.inner.cache
        {
            let mut guard = cache.lock().await;
            if let Err(e) = guard.put(&request.url, &entry) {
                tracing::warn!(error = %e, url = %request.url, "failed to write cache entry");
                notes.push(Note::CacheWriteFailed);
            }
        }

        let cache_state = if request.no_cache { CacheState::Bypass } else { CacheState::Miss };
        Ok(self.build_output(
            request.requested_url,
            &entry,
            cache_state,
            None,
            request.max_tokens,
            range,
            notes,
        ))
    }

    /// Origin-fetch path run under single-flight: enforce robots.txt, fetch
    /// via the rate-limited retrier, decode and parse the body, and build a
    /// fresh `CacheEntry`.
    async fn perform_fetch(&self, url: Url, effective: EffectiveConfig) -> FetchOutcome {
        let mut notes = Vec::new();

        if effective.fetch.respect_robots_txt {
            self.enforce_robots(&url, &mut notes).await?;
        }

        let authority = http::authority_of(&url);
        let retrier = Retrier::new(&self.inner.limiter, &self.inner.fetcher);
        let resp = retrier.fetch(&authority, &url, &effective, &self.inner.config, None).await?;
        reject_error_status(&resp)?;

        let entry = self.build_cache_entry(&resp)?;
        if entry.1 {
            notes.push(Note::CharsetFallback);
        }

        Ok((entry.0, notes))
    }

    /// Check robots.txt for `url`, pushing `Note::RobotsUnavailableFailOpen`
    /// on a fail-open miss and scheduling the observed crawl-delay (if any)
    /// on the rate limiter.
    async fn enforce_robots(&self, url: &Url, notes: &mut Vec<Note>) -> Result<(), WebFetchError> {
        match robots::check(url, &self.inner.config).await? {
            RobotsResult::Allowed => {}
            RobotsResult::Disallowed { rule } => {
                return Err(WebFetchError::new(
                    ErrorCode::RobotsDisallowed,
                    format!("robots.txt disallows this path: {rule}"),
                    false,
                )
                .with_detail("rule", rule));
            }
            RobotsResult::Unavailable { error } => {
                tracing::debug!(%error, %url, "robots.txt unavailable, failing open");
                notes.push(Note::RobotsUnavailableFailOpen);
            }
        }

        let delay = robots::crawl_delay(url, &self.inner.config).await?;
        if !delay.is_zero() {
            self.inner.limiter.note_retry_after(&http::authority_of(url), delay).await;
        }
        Ok(())
    }

    /// Decode and parse one response into a fresh `CacheEntry`, returning
    /// whether the decode fell back to lossy UTF-8.
    fn build_cache_entry(&self, resp: &http::FetchResponse) -> Result<(CacheEntry, bool), WebFetchError> {
        let content_type = resp.content_type().map(str::to_string);
        let (text, charset_fallback) = http::decode_body(&resp.body, content_type.as_deref());
        let parsed = self.inner.parser.parse(content_type.as_deref(), &text, &resp.final_url)?;
        let now = SystemTime::now();
        let stamp = cache::format_rfc3339(now);

        Ok((
            CacheEntry {
                version: cache::CACHE_VERSION,
                stored_at: stamp.clone(),
                last_accessed_at: stamp,
                final_url: resp.final_url.to_string(),
                status_code: resp.status,
                content_type,
                last_modified: resp.header("last-modified").map(str::to_string),
                title: parsed.title,
                description: parsed.description,
                favicon: parsed.favicon,
                language: parsed.language,
                markdown: parsed.content,
            },
            charset_fallback,
        ))
    }

    /// Schedule a background revalidation of a stale entry, guarded so only
    /// one revalidation per cache key runs at a time. A caller whose
    /// revalidation is already in flight just returns — the stale entry it
    /// already fetched is still a valid response.
    fn spawn_revalidation(&self, key: String, url: Url, effective: EffectiveConfig, prior: CacheEntry) {
        let Some(guard) = self.inner.revalidate_flight.try_start(&key) else {
            return;
        };
        let coordinator = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = coordinator.revalidate(&url, &effective, &prior).await {
                tracing::warn!(error = %err, %url, "background cache revalidation failed");
            }
        });
    }

    /// Issue a conditional (`If-Modified-Since`) request for `prior` and
    /// update the cache: a `304` just refreshes `stored_at`; any other 2xx
    /// replaces the entry outright. Errors and non-2xx/304 statuses leave
    /// the existing entry untouched — a failed revalidation is never worse
    /// than the stale entry the caller already received.
    async fn revalidate(&self, url: &Url, effective: &EffectiveConfig, prior: &CacheEntry) -> Result<(), WebFetchError> {
        if effective.fetch.respect_robots_txt {
            let mut ignored = Vec::new();
            if let Err(err) = self.enforce_robots(url, &mut ignored).await {
                tracing::debug!(error = %err, %url, "revalidation skipped: robots.txt now disallows");
                return Ok(());
            }
        }

        let authority = http::authority_of(url);
        let retrier = Retrier::new(&self.inner.limiter, &self.inner.fetcher);
        let resp = retrier
            .fetch(&authority, url, effective, &self.inner.config, prior.last_modified.as_deref())
            .await?;

        let Some(cache) = &self.inner.cache else {
            return Ok(());
        };

        if resp.status == 304 {
            cache
                .lock()
                .await
                .touch_stored_at(url)
                .map_err(|e| WebFetchError::new(ErrorCode::Internal, format!("cache touch failed: {e}"), false))?;
            return Ok(());
        }

        if resp.status >= 400 {
            return Ok(());
        }

        let (entry, _) = self.build_cache_entry(&resp)?;
        cache
            .lock()
            .await
            .put(url, &entry)
            .map_err(|e| WebFetchError::new(ErrorCode::Internal, format!("cache write failed: {e}"), false))?;
        Ok(())
    }

    /// Assemble a `WebFetchOutput` from a cache entry: slice `content` by
    /// either an explicit `range` or the token-budget truncator, estimate
    /// tokens, chunk, and canonically sort/dedup `notes`.
    fn build_output(
        &self,
        requested_url: String,
        entry: &CacheEntry,
        cache_state: CacheState,
        cached_at: Option<String>,
        max_tokens: Option<u32>,
        range: Option<RangeSpec>,
        mut notes: Vec<Note>,
    ) -> WebFetchOutput {
        let content_type = entry.content_type.clone();

        let (content, truncated, next_offset) = if let Some(range) = range {
            apply_range(&entry.markdown, range)
        } else {
            let result = truncate::truncate(&entry.markdown, content_type.as_deref(), max_tokens);
            (result.content, result.truncated, result.next_offset)
        };

        if truncated {
            notes.push(Note::ContentTruncated);
        }

        let estimated_tokens = truncate::estimate_tokens(&content, content_type.as_deref());
        let chunk_budget = max_tokens.unwrap_or(DEFAULT_CHUNK_TOKENS);
        let chunks = chunk::chunk(&content, chunk_budget);

        notes.sort_by_key(Note::order);
        notes.dedup();

        WebFetchOutput {
            requested_url,
            final_url: entry.final_url.clone(),
            status_code: entry.status_code,
            content_type,
            title: entry.title.clone(),
            description: entry.description.clone(),
            favicon: entry.favicon.clone(),
            language: entry.language.clone(),
            last_modified: entry.last_modified.clone(),
            fetched_at: cache::format_rfc3339(SystemTime::now()),
            cache_state,
            cached_at,
            content,
            chunks,
            estimated_tokens,
            truncated,
            next_offset,
            notes,
        }
    }
}

/// Map a non-2xx/non-3xx response into a structured error. Redirects are
/// already resolved by `HttpFetcher`; anything reaching here is either a
/// final 2xx (not an error) or a 4xx/5xx the caller should see.
fn reject_error_status(resp: &http::FetchResponse) -> Result<(), WebFetchError> {
    if resp.status < 400 {
        return Ok(());
    }
    let code = if resp.status < 500 { ErrorCode::Http4xx } else { ErrorCode::Http5xx };
    Err(WebFetchError::new(
        code,
        format!("upstream responded with status {}", resp.status),
        code.default_retryable(),
    )
    .with_detail("status", resp.status.to_string())
    .with_detail("url", resp.final_url.as_str()))
}

/// Slice `body` by a caller-supplied char/line range, reusing the
/// truncator's char-boundary helper for byte-exact `next_offset`s. Out of
/// range bounds clamp rather than error.
fn apply_range(body: &str, range: RangeSpec) -> (String, bool, Option<usize>) {
    match range.kind {
        RangeKind::Chars => {
            let total_chars = body.chars().count();
            let start = range.start.min(total_chars);
            let end = range.end.min(total_chars);
            let start_byte = truncate::char_to_byte(body, start);
            let end_byte = truncate::char_to_byte(body, end);
            let content = body[start_byte..end_byte].to_string();
            let next_offset = if end < total_chars { Some(end_byte) } else { None };
            (content, end < total_chars, next_offset)
        }
        RangeKind::Lines => {
            let lines: Vec<&str> = body.lines().collect();
            let total_lines = lines.len();
            let start = range.start.min(total_lines);
            let end = range.end.min(total_lines);
            let content = lines[start..end].join("\n");
            let next_offset = if end < total_lines {
                let consumed: usize = lines[..end].iter().map(|l| l.len() + 1).sum();
                Some(consumed.min(body.len()))
            } else {
                None
            };
            (content, end < total_lines, next_offset)
        }
    }
}
