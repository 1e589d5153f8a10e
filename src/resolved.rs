//! Resolved, invariant-safe configuration and request types.
//!
//! This module converts optional, boundary-level configuration into concrete
//! representations suitable for core logic (Invariant-First Architecture).
//! `ResolvedConfig` is built once per `FetchCoordinator`; `EffectiveConfig` is
//! derived from it per request by merging in whichever site override (if any)
//! matches the request's host/path, last-match-wins, field by field.

use std::path::PathBuf;
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use regex::Regex;
use url::Url;

use crate::types::{
    ErrorCode, RawCachePolicy, RawFetchPolicy, RawPolicyBlock, RawRateLimitPolicy,
    RawRetryPolicy, RewriteKind, SiteOverride, UrlRewriteRule, WebFetchConfig, WebFetchError,
    WebFetchInput,
};

pub(crate) const DEFAULT_USER_AGENT: &str = "webfetch/1.0";
pub(crate) const DEFAULT_ALLOWED_PORTS: &[u16] = &[80, 443];

const DEFAULT_TIMEOUT_SECS: u32 = 30;
const DEFAULT_MAX_REDIRECTS: u32 = 10;
const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;
// Alternate-URL formats to try before the original URL: absolute
// paths like "/llms.txt" or extensions like ".md". Empty by default — this
// is an opt-in per-site override, not a content-type filter.
const DEFAULT_CHECK_FORMATS: &[&str] = &[];

const DEFAULT_RATE_LIMIT_BURST: u32 = 1;
const DEFAULT_RATE_LIMIT_MAX_CONCURRENT: u32 = 2;

const DEFAULT_RETRY_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 500;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;
const DEFAULT_RETRY_ON: &[u16] = &[429, 500, 502, 503, 504];

const DEFAULT_CACHE_TTL_SECS: u64 = 300;
const DEFAULT_CACHE_STALE_SECS: u64 = 3600;
const DEFAULT_MAX_CACHE_ENTRIES: u32 = 1000;
const DEFAULT_MAX_CACHE_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct ResolvedRequest {
    pub url: Url,
    pub requested_url: String,
    pub max_tokens: Option<u32>,
    pub no_cache: bool,
}

impl ResolvedRequest {
    pub fn from_input(input: &WebFetchInput) -> Self {
        Self {
            url: input.url().clone(),
            requested_url: input.original_url().to_string(),
            max_tokens: input.max_tokens,
            no_cache: input.no_cache,
        }
    }
}

/// Process-wide resolved configuration, built once per `FetchCoordinator`.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    /// Default (pre-override) timeout. Consumed directly by `robots::check`,
    /// which issues its own requests outside the per-site policy merge.
    pub timeout: Duration,
    /// Default (pre-override) redirect cap, same rationale as `timeout`.
    pub max_redirects: u32,
    pub robots: ResolvedRobotsConfig,
    pub security: ResolvedSecurityConfig,
    pub cache: CachePolicy,
    default_policy: CompiledPolicyBlock,
    sites: Vec<(CompiledSitePattern, SiteOverride)>,
}

impl ResolvedConfig {
    pub fn from_config(config: &WebFetchConfig) -> Result<Self, WebFetchError> {
        let user_agent = config
            .default
            .fetch
            .user_agent
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let timeout = Duration::from_secs(u64::from(
            config.default.fetch.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS),
        ));
        let max_redirects = config
            .default
            .fetch
            .max_redirects
            .unwrap_or(DEFAULT_MAX_REDIRECTS);

        let security = ResolvedSecurityConfig::from_config(config);
        let robots = ResolvedRobotsConfig::from_config(config, &user_agent);
        let cache = CachePolicy::from_config(&config.default.cache);
        let default_policy = CompiledPolicyBlock::compile(&config.default)?;

        let mut sites = Vec::with_capacity(config.sites.len());
        for site in &config.sites {
            let pattern = CompiledSitePattern::compile(&site.pattern)?;
            sites.push((pattern, site.clone()));
        }

        Ok(Self {
            timeout,
            max_redirects,
            robots,
            security,
            cache,
            default_policy,
            sites,
        })
    }

    /// Resolve the effective, per-request policy for `url`: start from the
    /// default block, then apply every matching site override in
    /// declaration order (last match wins, field by field). Pattern
    /// compilation happened once in `from_config`; this only walks the
    /// already-compiled list.
    pub fn effective_for(&self, url: &Url) -> Result<EffectiveConfig, WebFetchError> {
        let host = url.host_str().unwrap_or_default();
        let path = url.path();

        let mut fetch = self.default_policy.fetch.clone();
        let mut rate_limit = self.default_policy.rate_limit.clone();
        let mut retry = self.default_policy.retry.clone();
        let mut cache = self.default_policy.cache.clone();

        for (pattern, site) in &self.sites {
            if !pattern.matches(host, path) {
                continue;
            }
            if let Some(raw) = &site.fetch {
                fetch = merge_fetch(&fetch, raw)?;
            }
            if let Some(raw) = &site.rate_limit {
                rate_limit = merge_rate_limit(&rate_limit, raw)?;
            }
            if let Some(raw) = &site.retry {
                retry = merge_retry(&retry, raw)?;
            }
            if let Some(raw) = &site.cache {
                cache = merge_cache(&cache, raw);
            }
        }

        Ok(EffectiveConfig {
            fetch,
            rate_limit,
            retry,
            cache,
        })
    }
}

/// Per-request effective policy: the default block with every matching site
/// override folded in.
#[derive(Debug, Clone)]
pub(crate) struct EffectiveConfig {
    pub fetch: ResolvedFetchPolicy,
    pub rate_limit: RateLimitPolicy,
    pub retry: RetryPolicy,
    pub cache: EffectiveCachePolicy,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedFetchPolicy {
    pub timeout: Duration,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub check_formats: Vec<String>,
    pub url_rewrites: Vec<CompiledRewrite>,
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub enable_ssrf_protection: bool,
    pub max_body_size: u64,
    pub respect_robots_txt: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledRewrite {
    pub kind: RewriteKind,
    pub regex: Option<Regex>,
    pub pattern: String,
    pub replacement: String,
}

impl CompiledRewrite {
    fn compile(rule: &UrlRewriteRule) -> Result<Self, WebFetchError> {
        let regex = match rule.kind {
            RewriteKind::Regex => Some(Regex::new(&rule.pattern).map_err(|e| {
                WebFetchError::new(
                    ErrorCode::BadArgs,
                    format!("invalid url_rewrites regex: {e}"),
                    false,
                )
                .with_detail("pattern", &rule.pattern)
            })?),
            RewriteKind::Literal => None,
        };
        Ok(Self {
            kind: rule.kind,
            regex,
            pattern: rule.pattern.clone(),
            replacement: rule.replacement.clone(),
        })
    }

    /// Apply this rewrite to `input`, returning the rewritten string.
    pub fn apply(&self, input: &str) -> String {
        match self.kind {
            RewriteKind::Regex => self
                .regex
                .as_ref()
                .map_or_else(|| input.to_string(), |re| re.replace_all(input, self.replacement.as_str()).into_owned()),
            RewriteKind::Literal => input.replace(&self.pattern, &self.replacement),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RateLimitPolicy {
    pub requests_per_second: Option<f64>,
    pub delay: Option<Duration>,
    pub burst: u32,
    pub max_concurrent: u32,
    pub respect_retry_after: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub retry_on: Vec<u16>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EffectiveCachePolicy {
    pub ttl: Duration,
    pub stale: Duration,
}

/// A compiled `default`/site policy block: concrete types, no `Option`,
/// built once in `ResolvedConfig::from_config` and cloned per match during
/// per-request resolution.
#[derive(Debug, Clone)]
struct CompiledPolicyBlock {
    fetch: ResolvedFetchPolicy,
    rate_limit: RateLimitPolicy,
    retry: RetryPolicy,
    cache: EffectiveCachePolicy,
}

impl CompiledPolicyBlock {
    fn compile(block: &RawPolicyBlock) -> Result<Self, WebFetchError> {
        let fetch = merge_fetch(&default_fetch_policy(), &block.fetch)?;
        let rate_limit = merge_rate_limit(&default_rate_limit_policy(), &block.rate_limit)?;
        let retry = merge_retry(&default_retry_policy(), &block.retry)?;
        let cache = merge_cache(&default_cache_policy(), &block.cache);
        Ok(Self {
            fetch,
            rate_limit,
            retry,
            cache,
        })
    }
}

fn default_fetch_policy() -> ResolvedFetchPolicy {
    ResolvedFetchPolicy {
        timeout: Duration::from_secs(u64::from(DEFAULT_TIMEOUT_SECS)),
        user_agent: DEFAULT_USER_AGENT.to_string(),
        headers: Vec::new(),
        check_formats: DEFAULT_CHECK_FORMATS.iter().map(|s| (*s).to_string()).collect(),
        url_rewrites: Vec::new(),
        follow_redirects: true,
        max_redirects: DEFAULT_MAX_REDIRECTS,
        enable_ssrf_protection: true,
        max_body_size: DEFAULT_MAX_BODY_SIZE,
        respect_robots_txt: true,
    }
}

fn default_rate_limit_policy() -> RateLimitPolicy {
    RateLimitPolicy {
        requests_per_second: None,
        delay: None,
        burst: DEFAULT_RATE_LIMIT_BURST,
        max_concurrent: DEFAULT_RATE_LIMIT_MAX_CONCURRENT,
        respect_retry_after: true,
    }
}

fn default_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: DEFAULT_RETRY_MAX_RETRIES,
        initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
        max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        multiplier: DEFAULT_RETRY_MULTIPLIER,
        retry_on: DEFAULT_RETRY_ON.to_vec(),
    }
}

fn default_cache_policy() -> EffectiveCachePolicy {
    EffectiveCachePolicy {
        ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        stale: Duration::from_secs(DEFAULT_CACHE_STALE_SECS),
    }
}

fn merge_fetch(base: &ResolvedFetchPolicy, raw: &RawFetchPolicy) -> Result<ResolvedFetchPolicy, WebFetchError> {
    let mut url_rewrites = base.url_rewrites.clone();
    if let Some(rules) = &raw.url_rewrites {
        url_rewrites = rules.iter().map(CompiledRewrite::compile).collect::<Result<_, _>>()?;
    }

    Ok(ResolvedFetchPolicy {
        timeout: raw
            .timeout_seconds
            .map_or(base.timeout, |s| Duration::from_secs(u64::from(s))),
        user_agent: raw.user_agent.clone().unwrap_or_else(|| base.user_agent.clone()),
        headers: raw.headers.clone().unwrap_or_else(|| base.headers.clone()),
        check_formats: raw.check_formats.clone().unwrap_or_else(|| base.check_formats.clone()),
        url_rewrites,
        follow_redirects: raw.follow_redirects.unwrap_or(base.follow_redirects),
        max_redirects: raw.max_redirects.unwrap_or(base.max_redirects),
        enable_ssrf_protection: raw.enable_ssrf_protection.unwrap_or(base.enable_ssrf_protection),
        max_body_size: raw.max_body_size.unwrap_or(base.max_body_size),
        respect_robots_txt: raw.respect_robots_txt.unwrap_or(base.respect_robots_txt),
    })
}

fn merge_rate_limit(base: &RateLimitPolicy, raw: &RawRateLimitPolicy) -> Result<RateLimitPolicy, WebFetchError> {
    if raw.delay_ms.is_some() && raw.requests_per_second.is_some() {
        return Err(WebFetchError::new(
            ErrorCode::BadArgs,
            "rate_limit cannot set both delay_ms and requests_per_second",
            false,
        ));
    }

    let delay = raw.delay_ms.map(Duration::from_millis).or(base.delay);
    let requests_per_second = raw.requests_per_second.or(base.requests_per_second);
    Ok(RateLimitPolicy {
        // `delay_ms` and `requests_per_second` are mutually exclusive pacing
        // knobs; an explicit `delay_ms` override wins over an inherited rate.
        requests_per_second: if raw.delay_ms.is_some() { None } else { requests_per_second },
        delay,
        burst: raw.burst.unwrap_or(base.burst),
        max_concurrent: raw.max_concurrent.unwrap_or(base.max_concurrent),
        respect_retry_after: raw.respect_retry_after.unwrap_or(base.respect_retry_after),
    })
}

const MIN_HTTP_STATUS: u16 = 100;
const MAX_HTTP_STATUS: u16 = 599;

fn merge_retry(base: &RetryPolicy, raw: &RawRetryPolicy) -> Result<RetryPolicy, WebFetchError> {
    if let Some(multiplier) = raw.multiplier
        && multiplier < 1.0
    {
        return Err(WebFetchError::new(
            ErrorCode::BadArgs,
            format!("retry.multiplier must be >= 1.0, got {multiplier}"),
            false,
        ));
    }

    if let Some(retry_on) = &raw.retry_on {
        for &code in retry_on {
            if !(MIN_HTTP_STATUS..=MAX_HTTP_STATUS).contains(&code) {
                return Err(WebFetchError::new(
                    ErrorCode::BadArgs,
                    format!("retry.retry_on contains out-of-range status code {code}"),
                    false,
                )
                .with_detail("code", code.to_string()));
            }
        }
    }

    Ok(RetryPolicy {
        max_retries: raw.max_retries.unwrap_or(base.max_retries),
        initial_delay: raw.initial_delay_ms.map_or(base.initial_delay, Duration::from_millis),
        max_delay: raw.max_delay_ms.map_or(base.max_delay, Duration::from_millis),
        multiplier: raw.multiplier.unwrap_or(base.multiplier),
        retry_on: raw.retry_on.clone().unwrap_or_else(|| base.retry_on.clone()),
    })
}

fn merge_cache(base: &EffectiveCachePolicy, raw: &RawCachePolicy) -> EffectiveCachePolicy {
    EffectiveCachePolicy {
        ttl: raw.ttl_seconds.map_or(base.ttl, Duration::from_secs),
        stale: raw.stale_seconds.map_or(base.stale, Duration::from_secs),
    }
}

/// A compiled site pattern: one of exact host, wildcard-domain
/// (`*.example.com`), wildcard-host (`x*`/`*x`/`*x*`), or either combined
/// with a path glob (`example.com/docs/*`). Built once from the raw
/// pattern string via `globset`, the same crate used throughout the pack
/// for glob compilation.
#[derive(Debug, Clone)]
struct CompiledSitePattern {
    host: HostMatcher,
    path: Option<GlobMatcher>,
}

#[derive(Debug, Clone)]
enum HostMatcher {
    Exact(String),
    Glob(GlobMatcher),
}

impl CompiledSitePattern {
    fn compile(raw: &str) -> Result<Self, WebFetchError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(WebFetchError::new(
                ErrorCode::BadArgs,
                "site pattern must not be empty",
                false,
            ));
        }

        let (host_part, path_part) = match raw.find('/') {
            Some(idx) => (&raw[..idx], Some(&raw[idx..])),
            None => (raw, None),
        };

        let host = if host_part.contains('*') {
            HostMatcher::Glob(compile_glob(&host_part.to_ascii_lowercase())?)
        } else {
            HostMatcher::Exact(host_part.to_ascii_lowercase())
        };

        let path = path_part.map(compile_glob).transpose()?;

        Ok(Self { host, path })
    }

    fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = match &self.host {
            HostMatcher::Exact(h) => h.eq_ignore_ascii_case(host),
            HostMatcher::Glob(g) => g.is_match(host.to_ascii_lowercase()),
        };
        host_ok && self.path.as_ref().is_none_or(|p| p.is_match(path))
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, WebFetchError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| {
            WebFetchError::new(
                ErrorCode::BadArgs,
                format!("invalid site pattern: {e}"),
                false,
            )
            .with_detail("pattern", pattern)
        })
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedSecurityConfig {
    pub blocked_cidrs: Vec<String>,
    pub allowed_ports: Vec<u16>,
    pub allow_insecure_tls: bool,
    pub allow_insecure_overrides: bool,
}

impl ResolvedSecurityConfig {
    fn from_config(config: &WebFetchConfig) -> Self {
        let security = &config.security;
        let blocked_cidrs = security.blocked_cidrs.clone().unwrap_or_default();
        let allowed_ports = security
            .allowed_ports
            .clone()
            .filter(|ports| !ports.is_empty())
            .unwrap_or_else(|| DEFAULT_ALLOWED_PORTS.to_vec());

        Self {
            blocked_cidrs,
            allowed_ports,
            allow_insecure_tls: security.allow_insecure_tls,
            allow_insecure_overrides: security.allow_insecure_overrides,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedRobotsConfig {
    pub fail_open: bool,
    pub user_agent_token: String,
    pub cache_ttl: Duration,
    pub cache_entries: usize,
}

impl ResolvedRobotsConfig {
    fn from_config(config: &WebFetchConfig, user_agent: &str) -> Self {
        let robots = &config.robots;
        let fail_open = robots.fail_open;
        let user_agent_token = robots
            .user_agent_token
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| derive_robots_token(user_agent));
        let cache_entries = config.robots_cache_entries.unwrap_or(1024) as usize;
        let ttl_hours = config.robots_cache_ttl_hours.unwrap_or(24).max(1);

        Self {
            fail_open,
            user_agent_token,
            cache_ttl: Duration::from_secs(u64::from(ttl_hours) * 60 * 60),
            cache_entries,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum CachePolicy {
    Disabled,
    Enabled(CacheSettings),
}

impl CachePolicy {
    fn from_config(cache: &RawCachePolicy) -> Self {
        let max_entries = cache.max_entries.unwrap_or(DEFAULT_MAX_CACHE_ENTRIES);
        if max_entries == 0 {
            return CachePolicy::Disabled;
        }

        let dir = cache.dir.clone().unwrap_or_else(default_cache_dir);
        if dir.as_os_str().is_empty() {
            return CachePolicy::Disabled;
        }

        let max_bytes = cache.max_bytes.unwrap_or(DEFAULT_MAX_CACHE_BYTES);

        CachePolicy::Enabled(CacheSettings { dir, max_entries, max_bytes })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CacheSettings {
    pub dir: PathBuf,
    pub max_entries: u32,
    pub max_bytes: u64,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("webfetch")
}

fn derive_robots_token(user_agent: &str) -> String {
    let token = user_agent.split('/').next().unwrap_or("");
    let filtered: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if filtered.is_empty() {
        "webfetch".to_string()
    } else {
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_pattern_exact() {
        let p = CompiledSitePattern::compile("example.com").unwrap();
        assert!(p.matches("example.com", "/anything"));
        assert!(!p.matches("other.com", "/anything"));
    }

    #[test]
    fn site_pattern_wildcard_domain() {
        let p = CompiledSitePattern::compile("*.example.com").unwrap();
        assert!(p.matches("docs.example.com", "/"));
        assert!(p.matches("example.com", "/"));
        assert!(!p.matches("example.org", "/"));
    }

    #[test]
    fn site_pattern_wildcard_domain_path() {
        let p = CompiledSitePattern::compile("*.example.com/docs/*").unwrap();
        assert!(p.matches("docs.example.com", "/docs/intro"));
        assert!(!p.matches("docs.example.com", "/blog/intro"));
    }

    #[test]
    fn site_pattern_host_path() {
        let p = CompiledSitePattern::compile("example.com/api/*").unwrap();
        assert!(p.matches("example.com", "/api/v1"));
        assert!(!p.matches("example.com", "/web/v1"));
    }

    #[test]
    fn site_pattern_wildcard_host_prefix_suffix_contains() {
        assert!(CompiledSitePattern::compile("cdn*").unwrap().matches("cdn1.example.com", "/"));
        assert!(CompiledSitePattern::compile("*.internal").unwrap().matches("api.internal", "/"));
        assert!(CompiledSitePattern::compile("*stage*").unwrap().matches("foo-stage-bar.com", "/"));
    }

    #[test]
    fn last_match_wins_merge() {
        let mut config = WebFetchConfig::default();
        config.default.fetch.timeout_seconds = Some(10);
        config.sites.push(SiteOverride {
            pattern: "*.example.com".to_string(),
            fetch: Some(RawFetchPolicy {
                timeout_seconds: Some(20),
                ..Default::default()
            }),
            rate_limit: None,
            retry: None,
            cache: None,
        });
        config.sites.push(SiteOverride {
            pattern: "docs.example.com".to_string(),
            fetch: Some(RawFetchPolicy {
                timeout_seconds: Some(30),
                ..Default::default()
            }),
            rate_limit: None,
            retry: None,
            cache: None,
        });

        let resolved = ResolvedConfig::from_config(&config).unwrap();
        let url = Url::parse("https://docs.example.com/").unwrap();
        let effective = resolved.effective_for(&url).unwrap();
        assert_eq!(effective.fetch.timeout, Duration::from_secs(30));

        let other = Url::parse("https://blog.example.com/").unwrap();
        let effective_other = resolved.effective_for(&other).unwrap();
        assert_eq!(effective_other.fetch.timeout, Duration::from_secs(20));
    }
}
