//! Domain types for the fetch coordinator.
//!
//! This module contains the boundary configuration (`WebFetchConfig`, all
//! `Option`-heavy so every field can be absent from a YAML/TOML document),
//! the request/response surface (`WebFetchInput`/`WebFetchOutput`), and the
//! error vocabulary. Boundary config is converted once into a concrete
//! `resolved::ResolvedConfig` tree before any pipeline code runs.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use thiserror::Error;
use url::Url;

/// Input parameters for one fetch, mirroring the facade's `POST /v1/fetch`
/// request body: `url`, `max_tokens`, `range`, plus a cache bypass.
#[derive(Debug, Clone)]
pub struct WebFetchInput {
    url: Url,
    original_url: String,

    /// Token budget passed to the truncator. `None` means unbounded.
    pub max_tokens: Option<u32>,

    /// If true, bypass the cache (both read and write) for this call.
    pub no_cache: bool,

    /// Byte/line range for paginated re-reads of a previously truncated body.
    pub range: Option<RangeSpec>,
}

impl WebFetchInput {
    /// Create a new `WebFetchInput` from a URL string.
    ///
    /// # Errors
    ///
    /// Returns `WebFetchError` if the URL is empty or fails to parse.
    pub fn new(url: impl Into<String>) -> Result<Self, WebFetchError> {
        let original = url.into();

        if original.trim().is_empty() {
            return Err(WebFetchError::new(
                ErrorCode::BadArgs,
                "url must not be empty or whitespace-only",
                false,
            )
            .with_detail("field", "url"));
        }

        let parsed = Url::parse(&original).map_err(|e| {
            WebFetchError::new(
                ErrorCode::InvalidUrl,
                format!("failed to parse URL: {e}"),
                false,
            )
            .with_detail("url", &original)
        })?;

        Ok(Self {
            url: parsed,
            original_url: original,
            max_tokens: None,
            no_cache: false,
            range: None,
        })
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// # Errors
    ///
    /// Returns an error if `range.end <= range.start`.
    pub fn with_range(mut self, range: RangeSpec) -> Result<Self, WebFetchError> {
        if range.end <= range.start {
            return Err(WebFetchError::new(
                ErrorCode::BadArgs,
                "range.end must be greater than range.start",
                false,
            )
            .with_detail("field", "range"));
        }
        self.range = Some(range);
        Ok(self)
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn original_url(&self) -> &str {
        &self.original_url
    }
}

/// A `chars` or `lines` sub-range of a previously truncated body, per the
/// facade's `range` request field.
#[derive(Debug, Clone, Copy)]
pub struct RangeSpec {
    pub kind: RangeKind,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Chars,
    Lines,
}

/// Successful response from a fetch, matching the facade's documented
/// `{metadata, content, next_range}` JSON shape plus the heading-scoped
/// chunker output the coordinator returns by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebFetchOutput {
    /// Original input URL as provided (unchanged).
    pub requested_url: String,
    /// Final URL after redirects, fragment removed.
    pub final_url: String,
    /// HTTP status code of the underlying response (or the cached one).
    pub status_code: u16,
    /// Normalized content-type of the raw response body, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Page title from `<title>` or first `<h1>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// `<meta name="description">` / `og:description`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Favicon URL, resolved against `final_url`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    /// Language from `<html lang>` (BCP-47 tag).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// `Last-Modified` header of the underlying response, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    /// Fetch/storage timestamp (RFC3339, second precision).
    pub fetched_at: String,
    /// Cache state this response was served under.
    pub cache_state: CacheState,
    /// When `cache_state` is `stale` or `fresh`, the time the entry was
    /// originally stored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<String>,
    /// Parsed body content (Markdown for the default HTML parser).
    pub content: String,
    /// Heading-scoped chunks of `content`, per the token budget in effect.
    pub chunks: Vec<FetchChunk>,
    /// Cheap linear estimate of `content`'s token count.
    pub estimated_tokens: u32,
    /// True if `content` is a truncated prefix of the parsed body.
    pub truncated: bool,
    /// Resumption offset for pagination, if truncated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
    /// Ordered, deduplicated condition tokens describing degraded-but-handled
    /// code paths taken while producing this response.
    pub notes: Vec<Note>,
}

/// Result of `crate::truncate::truncate`.
#[derive(Debug, Clone)]
pub(crate) struct TruncateResult {
    /// Possibly-truncated prefix of the input.
    pub content: String,
    /// True if `content` is shorter than the full input.
    pub truncated: bool,
    pub returned_chars: usize,
    pub returned_tokens: u32,
    pub total_chars: usize,
    pub total_tokens: u32,
    /// Char offset to resume from on the next call, if `truncated`.
    pub next_offset: Option<usize>,
}

/// A chunk of extracted content, tagged with its nearest preceding heading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchChunk {
    /// Most recent preceding heading text, or empty string if none.
    pub heading: String,
    /// Chunk content as Markdown.
    pub text: String,
    /// Token count of `text`, via the real tokenizer (independent of the
    /// truncator's cheap linear estimate).
    pub token_count: u32,
}

/// Cache state a response was served under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// No cache entry existed; this is a fresh origin fetch.
    Miss,
    /// Cache entry was within `TTL`; no network was used.
    Fresh,
    /// Cache entry was within `TTL..=TTL+StaleWindow`; a background
    /// revalidation was scheduled.
    Stale,
    /// Cache was bypassed by the caller (`no_cache`).
    Bypass,
}

/// Condition tokens for the `notes` array. Canonically ordered and
/// deduplicated before being attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Note {
    /// Response served from a fresh cache entry.
    CacheHit,
    /// Response served from a stale cache entry; revalidation scheduled.
    CacheStale,
    /// robots.txt unavailable but `fail_open=true`.
    RobotsUnavailableFailOpen,
    /// Unknown charset; fell back to UTF-8 with lossy conversion.
    CharsetFallback,
    /// Cache write failed (fetch still succeeded).
    CacheWriteFailed,
    /// Content was truncated to fit the token budget.
    ContentTruncated,
    /// `http://` was upgraded to `https://` before validation.
    HttpUpgradedToHttps,
}

impl Note {
    /// Canonical ordering used to sort the `notes` array.
    #[must_use]
    pub fn order(&self) -> u8 {
        match self {
            Note::CacheHit => 1,
            Note::CacheStale => 2,
            Note::RobotsUnavailableFailOpen => 3,
            Note::CharsetFallback => 4,
            Note::CacheWriteFailed => 5,
            Note::ContentTruncated => 6,
            Note::HttpUpgradedToHttps => 7,
        }
    }
}

// ---------------------------------------------------------------------
// Boundary configuration (Option-heavy; resolved once into `resolved::*`).
// ---------------------------------------------------------------------

fn default_true() -> bool {
    true
}

/// Root configuration document, per the `default` + `sites` YAML shape.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebFetchConfig {
    /// Whether the tool is enabled. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Default policy block, merged under every site override.
    #[serde(default)]
    pub default: RawPolicyBlock,
    /// Per-site pattern overrides, applied in declaration order.
    #[serde(default)]
    pub sites: Vec<SiteOverride>,
    /// robots.txt checker configuration.
    #[serde(default)]
    pub robots: RobotsConfig,
    /// SSRF / transport security configuration.
    #[serde(default)]
    pub security: SecurityConfig,
    /// robots.txt cache entries. Default: 1024.
    pub robots_cache_entries: Option<u32>,
    /// robots.txt cache TTL in hours. Default: 24.
    pub robots_cache_ttl_hours: Option<u32>,
}

/// One `default` or per-site policy block: fetch/rate-limit/retry/cache.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawPolicyBlock {
    #[serde(default)]
    pub fetch: RawFetchPolicy,
    #[serde(default)]
    pub rate_limit: RawRateLimitPolicy,
    #[serde(default)]
    pub retry: RawRetryPolicy,
    #[serde(default)]
    pub cache: RawCachePolicy,
}

/// A site-pattern override. Unset fields fall back to `default` (or an
/// earlier-declared, still-matching override — last match wins per field).
#[derive(Debug, Clone, Deserialize)]
pub struct SiteOverride {
    pub pattern: String,
    #[serde(default)]
    pub fetch: Option<RawFetchPolicy>,
    #[serde(default)]
    pub rate_limit: Option<RawRateLimitPolicy>,
    #[serde(default)]
    pub retry: Option<RawRetryPolicy>,
    #[serde(default)]
    pub cache: Option<RawCachePolicy>,
}

/// Boundary `fetch` fields.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawFetchPolicy {
    pub timeout_seconds: Option<u32>,
    pub user_agent: Option<String>,
    pub headers: Option<Vec<(String, String)>>,
    pub check_formats: Option<Vec<String>>,
    pub url_rewrites: Option<Vec<UrlRewriteRule>>,
    pub follow_redirects: Option<bool>,
    pub max_redirects: Option<u32>,
    pub enable_ssrf_protection: Option<bool>,
    pub max_body_size: Option<u64>,
    pub respect_robots_txt: Option<bool>,
}

/// One URL rewrite rule, compiled once at fetcher construction.
#[derive(Debug, Clone, Deserialize)]
pub struct UrlRewriteRule {
    #[serde(rename = "type")]
    pub kind: RewriteKind,
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteKind {
    Regex,
    Literal,
}

/// Boundary `rate_limit` fields. `requests_per_second` and
/// `delay_ms` are mutually exclusive (validated at resolution).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRateLimitPolicy {
    pub requests_per_second: Option<f64>,
    pub delay_ms: Option<u64>,
    pub burst: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub respect_retry_after: Option<bool>,
}

/// Boundary `retry` fields.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawRetryPolicy {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub retry_on: Option<Vec<u16>>,
}

/// Boundary `cache` fields.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawCachePolicy {
    pub ttl_seconds: Option<u64>,
    pub stale_seconds: Option<u64>,
    pub max_entries: Option<u32>,
    pub max_bytes: Option<u64>,
    pub dir: Option<PathBuf>,
}

/// Security-specific configuration (ambient transport/SSRF knobs).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    /// Additional blocked CIDR ranges (IPv4, `a.b.c.d/n`).
    pub blocked_cidrs: Option<Vec<String>>,
    /// Allowed ports (overrides default allowlist `{80, 443}`).
    pub allowed_ports: Option<Vec<u16>>,
    /// Allow insecure TLS (for testing only).
    #[serde(default)]
    pub allow_insecure_tls: bool,
    /// Allow fetching private/loopback/link-local addresses (testing only;
    /// also suppresses the http→https upgrade).
    #[serde(default)]
    pub allow_insecure_overrides: bool,
}

/// robots.txt-specific configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RobotsConfig {
    /// User-agent token for robots.txt matching.
    pub user_agent_token: Option<String>,
    /// Fail-open if robots.txt unavailable. Default: false (fail-closed).
    #[serde(default)]
    pub fail_open: bool,
}

// ---------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------

/// Fetch-coordinator error with a stable code and structured details.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WebFetchError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: ErrorDetails,
}

impl WebFetchError {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
            details: ErrorDetails::default(),
        }
    }

    /// Add a detail field.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.0.push((key.into(), value.into()));
        self
    }

    /// Serialize to JSON matching the facade's documented error envelope.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "error": true,
            "code": self.code,
            "message": self.message,
            "retryable": self.retryable,
        });

        if !self.details.0.is_empty() {
            let details: serde_json::Map<String, serde_json::Value> = self
                .details
                .0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            obj["details"] = serde_json::Value::Object(details);
        }

        obj
    }
}

impl Serialize for WebFetchError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

/// Error codes registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadArgs,
    InvalidUrl,
    InvalidScheme,
    InvalidHost,
    PortBlocked,
    SsrfBlocked,
    DnsFailed,
    RobotsDisallowed,
    RobotsUnavailable,
    RedirectLimit,
    Timeout,
    Network,
    ResponseTooLarge,
    UnsupportedContentType,
    ExtractionFailed,
    Http4xx,
    Http5xx,
    Internal,
}

impl ErrorCode {
    /// Baseline retryability; the retrier's `retry_on` policy may override
    /// this per observed status code.
    #[must_use]
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::DnsFailed | ErrorCode::Timeout | ErrorCode::Network | ErrorCode::Http5xx
        )
    }
}

/// Error details as an ordered key-value bag.
#[derive(Debug, Clone, Default)]
pub struct ErrorDetails(pub Vec<(String, String)>);

/// Result of SSRF validation.
#[derive(Debug, Clone)]
pub enum SsrfCheckResult {
    Allowed { resolved_ips: Vec<IpAddr> },
    Blocked { reason: SsrfBlockReason },
}

/// Reason for SSRF blocking.
#[derive(Debug, Clone)]
pub enum SsrfBlockReason {
    /// Private (RFC1918), loopback, or link-local address.
    PrivateOrLoopbackOrLinkLocal { ip: IpAddr },
    /// IP matches an operator-supplied blocked CIDR.
    BlockedCidr { ip: IpAddr, cidr: String },
    /// Port not in the allow-list.
    BlockedPort { port: u16 },
    /// Userinfo (`user:pass@host`) present in the URL.
    UserinfoPresent,
    /// IPv6 zone identifier (`fe80::1%eth0`) present.
    Ipv6ZoneId,
}

impl SsrfBlockReason {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            SsrfBlockReason::PrivateOrLoopbackOrLinkLocal { ip } if is_link_local(*ip) => {
                format!("link-local address blocked: {ip}")
            }
            SsrfBlockReason::PrivateOrLoopbackOrLinkLocal { ip } => {
                format!("private/loopback address blocked: {ip}")
            }
            SsrfBlockReason::BlockedCidr { ip, cidr } => {
                format!("address {ip} matches blocked CIDR {cidr}")
            }
            SsrfBlockReason::BlockedPort { port } => format!("port {port} not in allow-list"),
            SsrfBlockReason::UserinfoPresent => "userinfo present in URL".to_string(),
            SsrfBlockReason::Ipv6ZoneId => "IPv6 zone identifier present in URL".to_string(),
        }
    }
}

fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}
