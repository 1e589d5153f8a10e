//! HTTP fetcher: builds the shared `reqwest::Client`, performs the request
//! with manual redirect-following (so every hop gets its own SSRF check),
//! applies conditional-request headers for cache revalidation, and decodes
//! the body.
//!
//! A single client is built once per `FetchCoordinator` with
//! [`SsrfGuardedResolver`] wired in as its DNS resolver. That resolver is
//! consulted on *every* connection attempt reqwest makes — the initial
//! request, each redirect hop, each retry — which is what actually defeats
//! DNS rebinding: the address that is dialed is always the address that was
//! just checked, not one checked earlier and potentially stale.

use std::error::Error as StdError;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{Client, Method, Response};
use url::Url;

use crate::resolved::{EffectiveConfig, ResolvedConfig, ResolvedSecurityConfig};
use crate::ssrf;
use crate::types::{ErrorCode, WebFetchError};

const MAX_RESOLVER_ATTEMPTS: usize = 2;

/// `host:port` key used to bucket rate-limiter and robots.txt state.
#[must_use]
pub(crate) fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    let port = url.port_or_known_default().unwrap_or(443);
    format!("{host}:{port}")
}

/// Fetched, not-yet-parsed response: status, headers of interest, and the
/// decoded body.
pub(crate) struct FetchResponse {
    pub final_url: Url,
    pub status: u16,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Validate a URL before any outbound request: cheap structural checks
/// first, then (if SSRF protection is enabled for this request) a
/// best-effort DNS lookup against the blocked ranges. DNS failure here is
/// not an error — the transport's own resolution attempt will surface it.
pub(crate) async fn validate_url(
    raw: &str,
    url: &Url,
    config: &ResolvedConfig,
) -> Result<Vec<IpAddr>, WebFetchError> {
    ssrf::parse_and_validate(raw)?;
    ssrf::validate_external(url, &config.security).await
}

/// Issue one request to `url` using a client whose resolver re-validates
/// every address it hands back. `resolved_ips` (from an earlier
/// `validate_url` call) is accepted for signature continuity with that
/// up-front check but is not itself trusted for the connection — the
/// resolver performs the authoritative, connect-time check.
pub(crate) async fn send_with_pinning(
    url: &Url,
    _resolved_ips: &[IpAddr],
    method: Method,
    body: &[u8],
    config: &ResolvedConfig,
    deadline: Instant,
) -> Result<Response, WebFetchError> {
    let client = build_client(&config.security)?;
    let timeout = deadline.saturating_duration_since(Instant::now());
    let mut req = client
        .request(method, url.clone())
        .header(reqwest::header::USER_AGENT, "webfetch/1.0")
        .timeout(timeout);
    if !body.is_empty() {
        req = req.body(body.to_vec());
    }
    req.send().await.map_err(map_reqwest_error)
}

/// Resolver that defeats DNS rebinding by re-checking the resolved address
/// against the blocked ranges at the moment reqwest actually dials it,
/// rather than trusting a lookup performed earlier in the pipeline.
pub(crate) struct SsrfGuardedResolver {
    blocked_cidrs: Vec<String>,
    enabled: bool,
}

impl SsrfGuardedResolver {
    fn new(security: &ResolvedSecurityConfig) -> Self {
        Self {
            blocked_cidrs: security.blocked_cidrs.clone(),
            enabled: !security.allow_insecure_overrides,
        }
    }
}

impl Resolve for SsrfGuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        let blocked_cidrs = self.blocked_cidrs.clone();
        let enabled = self.enabled;
        Box::pin(resolve_guarded(host, blocked_cidrs, enabled))
    }
}

fn resolve_guarded(
    host: String,
    blocked_cidrs: Vec<String>,
    enabled: bool,
) -> Pin<Box<dyn Future<Output = Result<Addrs, Box<dyn StdError + Send + Sync>>> + Send>> {
    Box::pin(async move {
        let mut last_err: Option<String> = None;
        for _ in 0..MAX_RESOLVER_ATTEMPTS {
            match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(addrs) => {
                    let addrs: Vec<SocketAddr> = addrs.collect();
                    if enabled {
                        for addr in &addrs {
                            if let Some(reason) = ssrf::blocked_reason(addr.ip(), &blocked_cidrs) {
                                return Err(Box::from(reason.describe()));
                            }
                        }
                    }
                    return Ok(Box::new(addrs.into_iter()) as Addrs);
                }
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(Box::from(last_err.unwrap_or_else(|| "DNS resolution failed".to_string())))
    })
}

pub(crate) fn build_client(security: &ResolvedSecurityConfig) -> Result<Client, WebFetchError> {
    let mut builder = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .dns_resolver(Arc::new(SsrfGuardedResolver::new(security)));

    if security.allow_insecure_tls {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|e| {
        WebFetchError::new(ErrorCode::Internal, format!("failed to build HTTP client: {e}"), false)
    })
}

/// The general-purpose fetcher used by the coordinator's main pipeline:
/// manual redirect loop (re-validating SSRF on every hop), conditional
/// request headers, response-size enforcement, and URL rewrite rules.
pub(crate) struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(security: &ResolvedSecurityConfig) -> Result<Self, WebFetchError> {
        Ok(Self {
            client: build_client(security)?,
        })
    }

    /// Fetch `url` under `effective`'s policy. `conditional` carries an
    /// `If-Modified-Since` value for cache revalidation, if any. The
    /// configured `url_rewrites` are applied once to `url` before the first
    /// request; redirect hops are not re-rewritten.
    ///
    /// If `check_formats` is configured, alternate URLs are tried first, in
    /// declared order: the first one whose response is 2xx, or 3xx
    /// when redirects are disabled, wins; otherwise the original URL is
    /// fetched as normal.
    pub async fn fetch(
        &self,
        url: &Url,
        effective: &EffectiveConfig,
        config: &ResolvedConfig,
        conditional: Option<&str>,
    ) -> Result<FetchResponse, WebFetchError> {
        let base = apply_rewrites(url, &effective.fetch.url_rewrites)?;

        for format in &effective.fetch.check_formats {
            let Some(candidate) = alternate_url(&base, format) else {
                continue;
            };
            if let Ok(fetched) = self.fetch_one(&candidate, effective, config, conditional).await
                && (fetched.status < 300 || (fetched.status < 400 && !effective.fetch.follow_redirects))
            {
                return Ok(fetched);
            }
        }

        self.fetch_one(&base, effective, config, conditional).await
    }

    /// Fetch exactly one URL, following redirects per `effective.fetch`'s
    /// policy. Used both for the original URL and for each `check_formats`
    /// candidate.
    async fn fetch_one(
        &self,
        url: &Url,
        effective: &EffectiveConfig,
        config: &ResolvedConfig,
        conditional: Option<&str>,
    ) -> Result<FetchResponse, WebFetchError> {
        let mut current = url.clone();
        let mut redirect_count = 0u32;
        let deadline = Instant::now() + effective.fetch.timeout;

        loop {
            if effective.fetch.enable_ssrf_protection {
                validate_url(current.as_str(), &current, config).await?;
            }

            let mut req = self
                .client
                .request(Method::GET, current.clone())
                .header(reqwest::header::USER_AGENT, effective.fetch.user_agent.clone())
                .timeout(deadline.saturating_duration_since(Instant::now()));

            for (name, value) in &effective.fetch.headers {
                req = req.header(name.as_str(), value.as_str());
            }
            if let Some(since) = conditional {
                req = req.header(reqwest::header::IF_MODIFIED_SINCE, since);
            }

            let resp = req.send().await.map_err(map_reqwest_error)?;

            if resp.status().is_redirection() {
                if !effective.fetch.follow_redirects {
                    return read_body(current, resp, effective).await;
                }

                redirect_count += 1;
                if redirect_count > effective.fetch.max_redirects {
                    return Err(WebFetchError::new(
                        ErrorCode::RedirectLimit,
                        format!("exceeded {} redirects", effective.fetch.max_redirects),
                        false,
                    ));
                }

                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        WebFetchError::new(ErrorCode::Network, "redirect response missing Location", true)
                    })?;
                current = current.join(location).map_err(|e| {
                    WebFetchError::new(ErrorCode::Network, format!("invalid redirect target: {e}"), false)
                })?;
                continue;
            }

            return read_body(current, resp, effective).await;
        }
    }
}

/// Build the alternate URL for one `check_formats` entry: an absolute path
/// (`/llms.txt`) replaces the whole path, an extension (`.md`) replaces the
/// last path segment's extension (or is appended if it has none). Any other
/// shape is not a recognized format and is skipped.
fn alternate_url(base: &Url, format: &str) -> Option<Url> {
    let format = format.trim();
    if format.is_empty() {
        return None;
    }

    let mut candidate = base.clone();

    if let Some(path) = format.strip_prefix('/') {
        candidate.set_path(&format!("/{path}"));
        return Some(candidate);
    }

    if let Some(ext) = format.strip_prefix('.') {
        let mut segments: Vec<String> = candidate.path_segments()?.map(str::to_string).collect();
        let last = segments.pop().unwrap_or_default();
        let stem = last.rfind('.').map_or(last.as_str(), |idx| &last[..idx]);
        segments.push(format!("{stem}.{ext}"));
        candidate.set_path(&format!("/{}", segments.join("/")));
        return Some(candidate);
    }

    None
}

fn apply_rewrites(
    url: &Url,
    rewrites: &[crate::resolved::CompiledRewrite],
) -> Result<Url, WebFetchError> {
    if rewrites.is_empty() {
        return Ok(url.clone());
    }
    let mut current = url.to_string();
    for rewrite in rewrites {
        current = rewrite.apply(&current);
    }
    Url::parse(&current).map_err(|e| {
        WebFetchError::new(ErrorCode::InvalidUrl, format!("url_rewrites produced an invalid URL: {e}"), false)
    })
}

async fn read_body(
    final_url: Url,
    resp: Response,
    effective: &EffectiveConfig,
) -> Result<FetchResponse, WebFetchError> {
    let status = resp.status().as_u16();

    if let Some(len) = resp.content_length() {
        if len > effective.fetch.max_body_size {
            return Err(WebFetchError::new(
                ErrorCode::ResponseTooLarge,
                format!("content-length {len} exceeds limit {}", effective.fetch.max_body_size),
                false,
            ));
        }
    }

    let headers = resp.headers().clone();
    let max = effective.fetch.max_body_size;
    let body = resp.bytes().await.map_err(map_reqwest_error)?;
    if body.len() as u64 > max {
        return Err(WebFetchError::new(
            ErrorCode::ResponseTooLarge,
            format!("decoded body of {} bytes exceeds limit {max}", body.len()),
            false,
        ));
    }

    Ok(FetchResponse {
        final_url,
        status,
        headers,
        body: body.to_vec(),
    })
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> WebFetchError {
    if err.is_timeout() {
        return WebFetchError::new(ErrorCode::Timeout, "request timed out", true);
    }
    if err.is_connect() || err.is_request() {
        return WebFetchError::new(ErrorCode::Network, format!("network error: {err}"), true);
    }
    WebFetchError::new(ErrorCode::Network, format!("HTTP client error: {err}"), true)
}

/// Decode a response body to text, falling back to lossy UTF-8 conversion
/// (and a `charset_fallback` note from the caller) when the declared or
/// sniffed charset isn't understood.
pub(crate) fn decode_body(body: &[u8], content_type: Option<&str>) -> (String, bool) {
    let charset = content_type
        .and_then(|ct| ct.split(';').find_map(|part| {
            let part = part.trim();
            part.strip_prefix("charset=").map(str::trim)
        }))
        .map(str::to_ascii_lowercase);

    match charset.as_deref() {
        None | Some("utf-8" | "utf8" | "us-ascii" | "ascii") => {
            match std::str::from_utf8(body) {
                Ok(s) => (s.to_string(), false),
                Err(_) => (String::from_utf8_lossy(body).into_owned(), true),
            }
        }
        Some(_other) => {
            // Unrecognized charset: fall back to lossy UTF-8 rather than
            // pulling in a full charset-detection/transcoding dependency.
            (String::from_utf8_lossy(body).into_owned(), true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_body_plain_utf8() {
        let (text, fallback) = decode_body("hello".as_bytes(), Some("text/plain; charset=utf-8"));
        assert_eq!(text, "hello");
        assert!(!fallback);
    }

    #[test]
    fn decode_body_unknown_charset_falls_back() {
        let (text, fallback) = decode_body("hello".as_bytes(), Some("text/plain; charset=shift_jis"));
        assert_eq!(text, "hello");
        assert!(fallback);
    }

    #[test]
    fn decode_body_invalid_utf8_falls_back() {
        let bytes = [0x68, 0x65, 0xff, 0xfe];
        let (_, fallback) = decode_body(&bytes, None);
        assert!(fallback);
    }

    #[test]
    fn alternate_url_absolute_path_replaces_whole_path() {
        let base = Url::parse("https://example.com/docs/guide").unwrap();
        let alt = alternate_url(&base, "/llms.txt").unwrap();
        assert_eq!(alt.path(), "/llms.txt");
        assert_eq!(alt.host_str(), base.host_str());
    }

    #[test]
    fn alternate_url_extension_replaces_last_extension() {
        let base = Url::parse("https://example.com/docs/guide.html").unwrap();
        let alt = alternate_url(&base, ".md").unwrap();
        assert_eq!(alt.path(), "/docs/guide.md");
    }

    #[test]
    fn alternate_url_extension_appends_when_no_existing_extension() {
        let base = Url::parse("https://example.com/docs/guide").unwrap();
        let alt = alternate_url(&base, ".md").unwrap();
        assert_eq!(alt.path(), "/docs/guide.md");
    }

    #[test]
    fn alternate_url_rejects_unrecognized_format() {
        let base = Url::parse("https://example.com/docs/guide").unwrap();
        assert!(alternate_url(&base, "text/html").is_none());
        assert!(alternate_url(&base, "").is_none());
    }
}
