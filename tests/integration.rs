//! Integration tests for the fetch coordinator.
//!
//! These tests exercise the full pipeline: URL validation -> robots.txt ->
//! rate-limited HTTP fetch -> content parsing -> caching -> truncation.

use webfetch::{
    ErrorCode, FetchCoordinator, Note, RawCachePolicy, RawPolicyBlock, RobotsConfig,
    SecurityConfig, WebFetchConfig, WebFetchInput,
};
use std::path::Path;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config() -> WebFetchConfig {
    WebFetchConfig {
        enabled: true,
        default: RawPolicyBlock {
            cache: RawCachePolicy {
                max_entries: Some(0), // cache disabled unless overridden below
                ..Default::default()
            },
            ..Default::default()
        },
        robots: RobotsConfig {
            user_agent_token: Some("webfetch-test".to_string()),
            fail_open: true,
        },
        security: SecurityConfig {
            allow_insecure_overrides: true, // allow loopback so wiremock can be reached
            ..Default::default()
        },
        robots_cache_entries: Some(0),
        robots_cache_ttl_hours: Some(1),
        ..Default::default()
    }
}

fn test_config_secure() -> WebFetchConfig {
    let mut config = test_config();
    config.security.allow_insecure_overrides = false;
    config
}

fn test_config_with_cache(cache_dir: &Path) -> WebFetchConfig {
    let mut config = test_config();
    config.default.cache = RawCachePolicy {
        max_entries: Some(100),
        max_bytes: Some(10_000_000),
        ttl_seconds: Some(1),
        stale_seconds: Some(3600),
        dir: Some(cache_dir.to_path_buf()),
    };
    config
}

fn simple_html(title: &str, body: &str) -> String {
    let filler = "Additional text ensures extraction passes minimum length checks for tests.";
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>{title}</title>
</head>
<body>
    <main>
        <h1>{title}</h1>
        <p>{body} {filler}</p>
    </main>
</body>
</html>"#
    )
}

fn multi_section_html() -> String {
    let extra = "This filler sentence increases the token count for chunking tests. ".repeat(400);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Multi-Section Document</title>
</head>
<body>
    <main>
        <h1>Main Title</h1>
        <p>Introduction paragraph with some content.</p>

        <h2>Section One</h2>
        <p>This is the first section with detailed content. It contains multiple sentences to ensure we have enough text for chunking tests.</p>

        <h2>Section Two</h2>
        <p>Second section content goes here. More text to fill out the document and test heading tracking across chunks.</p>

        <h3>Subsection</h3>
        <p>A subsection with its own content.</p>

        <h2>Section Three</h2>
        <p>Final section with closing remarks.</p>
        <p>{extra}</p>
    </main>
</body>
</html>"#
    )
}

async fn setup_mock_server_with_robots(html: &str) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html; charset=utf-8")
                .set_body_string(html),
        )
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn test_basic_fetch_success() {
    let html = simple_html("Test Page", "Hello, World!");
    let server = setup_mock_server_with_robots(&html).await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert_eq!(output.title, Some("Test Page".to_string()));
    assert_eq!(output.language, Some("en".to_string()));
    assert!(!output.truncated);
    assert!(!output.chunks.is_empty());

    let all_text: String = output.chunks.iter().map(|c| c.text.as_str()).collect();
    assert!(all_text.contains("Hello, World!"));
}

#[tokio::test]
async fn test_fetch_with_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/docs/guide"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html; charset=utf-8")
                .set_body_string(simple_html("Guide", "Documentation content")),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url = format!("{}/docs/guide", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert_eq!(output.title, Some("Guide".to_string()));
    assert!(output.final_url.contains("/docs/guide"));
}

#[tokio::test]
async fn test_fetch_preserves_requested_url() {
    let html = simple_html("Test", "Content");
    let server = setup_mock_server_with_robots(&html).await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let requested = server.uri();
    let input = WebFetchInput::new(&requested).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(output.requested_url.starts_with(&requested));
}

#[tokio::test]
async fn test_robots_disallow_blocks_fetch() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private/"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/private/secret"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(simple_html("Secret", "Hidden")),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url = format!("{}/private/secret", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let result = coordinator.fetch(input).await;

    let err = result.expect_err("robots.txt should disallow this path");
    assert_eq!(err.code, ErrorCode::RobotsDisallowed);
}

#[tokio::test]
async fn test_robots_404_allows_fetch() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(simple_html("Public", "Content")),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");
    assert_eq!(output.title, Some("Public".to_string()));
}

#[tokio::test]
async fn test_robots_user_agent_specific_rules() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("User-agent: webfetch-test\nAllow: /\n\nUser-agent: *\nDisallow: /"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(simple_html("Allowed", "Content")),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");
    assert_eq!(output.title, Some("Allowed".to_string()));
}

#[tokio::test]
async fn test_extraction_removes_boilerplate() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    let html = r"<!DOCTYPE html>
<html>
<head><title>Clean Page</title></head>
<body>
    <nav>Navigation links</nav>
    <header>Site Header</header>
    <main>
        <h1>Main Content</h1>
        <p>This is the actual content we want to extract.</p>
    </main>
    <footer>Footer content</footer>
    <script>alert('js');</script>
</body>
</html>";

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(html),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");
    let all_text: String = output.chunks.iter().map(|c| c.text.as_str()).collect();

    assert!(all_text.contains("Main Content"));
    assert!(all_text.contains("actual content"));
    assert!(!all_text.contains("Navigation links"));
    assert!(!all_text.contains("Site Header"));
    assert!(!all_text.contains("Footer content"));
    assert!(!all_text.contains("alert"));
}

#[tokio::test]
async fn test_extraction_converts_links() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Links</title></head>
<body>
    <main>
        <p>Visit <a href="/page">relative link</a> or <a href="{}/absolute">absolute link</a>. Additional text ensures extraction passes minimum length checks for tests.</p>
    </main>
</body>
</html>"#,
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(html),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");
    let all_text: String = output.chunks.iter().map(|c| c.text.as_str()).collect();

    assert!(all_text.contains("[relative link]"));
    assert!(all_text.contains("/page"));
}

#[tokio::test]
async fn test_chunking_produces_multiple_heading_scoped_chunks() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(multi_section_html()),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(
        output.chunks.len() > 1,
        "expected multiple chunks for content exceeding the default per-chunk budget"
    );
    for chunk in &output.chunks {
        assert!(chunk.token_count > 0);
    }

    let chunks_with_headings: Vec<_> = output.chunks.iter().filter(|c| !c.heading.is_empty()).collect();
    assert!(!chunks_with_headings.is_empty(), "expected some chunks to carry heading context");
}

#[tokio::test]
async fn test_max_tokens_truncates_content_and_reports_next_offset() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(multi_section_html()),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL").with_max_tokens(20);

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(output.truncated);
    assert!(output.notes.contains(&Note::ContentTruncated));
    assert!(output.next_offset.is_some());
    assert!(output.estimated_tokens > 0);
    assert!(std::str::from_utf8(output.content.as_bytes()).is_ok());
}

#[tokio::test]
async fn test_cache_hit_returns_cached_content() {
    let cache_dir = TempDir::new().expect("create temp dir");
    let html = simple_html("Cached Page", "Cached content");
    let server = setup_mock_server_with_robots(&html).await;

    let config = test_config_with_cache(cache_dir.path());
    let coordinator = FetchCoordinator::new(&config).expect("build coordinator");
    let url = server.uri();

    let input1 = WebFetchInput::new(&url).expect("valid URL");
    let output1 = coordinator.fetch(input1).await.expect("first fetch");
    assert!(!output1.notes.contains(&Note::CacheHit), "first fetch should not be a cache hit");

    let input2 = WebFetchInput::new(&url).expect("valid URL");
    let output2 = coordinator.fetch(input2).await.expect("second fetch");

    assert!(output2.notes.contains(&Note::CacheHit), "second fetch should be a cache hit");
    assert_eq!(output2.title, output1.title);
    assert_eq!(output2.final_url, output1.final_url);
}

#[tokio::test]
async fn test_no_cache_bypasses_cache() {
    let cache_dir = TempDir::new().expect("create temp dir");
    let html = simple_html("Page", "Content");
    let server = setup_mock_server_with_robots(&html).await;

    let config = test_config_with_cache(cache_dir.path());
    let coordinator = FetchCoordinator::new(&config).expect("build coordinator");
    let url = server.uri();

    let input1 = WebFetchInput::new(&url).expect("valid URL");
    let _ = coordinator.fetch(input1).await.expect("first fetch");

    let input2 = WebFetchInput::new(&url).expect("valid URL").with_no_cache(true);
    let output2 = coordinator.fetch(input2).await.expect("second fetch");

    assert!(!output2.notes.contains(&Note::CacheHit), "no_cache fetch should bypass the cache");
    assert_eq!(output2.cache_state, webfetch::CacheState::Bypass);
}

#[tokio::test]
async fn test_invalid_url_rejected() {
    let result = WebFetchInput::new("not-a-url");
    assert!(result.is_err());
}

#[tokio::test]
async fn test_non_http_scheme_rejected() {
    let coordinator = FetchCoordinator::new(&test_config_secure()).expect("build coordinator");
    let input = WebFetchInput::new("ftp://example.com/file").expect("valid URL");

    let result = coordinator.fetch(input).await;
    let err = result.expect_err("ftp scheme should be rejected");
    assert_eq!(err.code, ErrorCode::InvalidScheme);
}

#[tokio::test]
async fn test_ssrf_localhost_blocked() {
    let coordinator = FetchCoordinator::new(&test_config_secure()).expect("build coordinator");
    let input = WebFetchInput::new("http://127.0.0.1/").expect("valid URL");

    let result = coordinator.fetch(input).await;
    let err = result.expect_err("loopback address should be SSRF-blocked");
    assert_eq!(err.code, ErrorCode::SsrfBlocked);
}

#[tokio::test]
async fn test_ssrf_private_ip_blocked() {
    let coordinator = FetchCoordinator::new(&test_config_secure()).expect("build coordinator");
    let input = WebFetchInput::new("http://192.168.1.1/").expect("valid URL");

    let result = coordinator.fetch(input).await;
    let err = result.expect_err("RFC1918 address should be SSRF-blocked");
    assert_eq!(err.code, ErrorCode::SsrfBlocked);
}

#[tokio::test]
async fn test_ssrf_link_local_metadata_address_blocked() {
    let coordinator = FetchCoordinator::new(&test_config_secure()).expect("build coordinator");
    let input = WebFetchInput::new("http://169.254.169.254/").expect("valid URL");

    let result = coordinator.fetch(input).await;
    let err = result.expect_err("link-local cloud-metadata address should be SSRF-blocked");
    assert_eq!(err.code, ErrorCode::SsrfBlocked);
    assert!(err.message.contains("link-local"));
}

#[tokio::test]
async fn test_http_404_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url = format!("{}/missing", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let result = coordinator.fetch(input).await;
    let err = result.expect_err("404 should surface as an error");
    assert_eq!(err.code, ErrorCode::Http4xx);
}

#[tokio::test]
async fn test_http_500_error_retries_then_fails() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/error"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url = format!("{}/error", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let result = coordinator.fetch(input).await;
    let err = result.expect_err("persistent 500 should surface as an error after retries");
    assert_eq!(err.code, ErrorCode::Http5xx);
}

#[tokio::test]
async fn test_retry_then_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    // First two attempts fail with 503, third succeeds -- wiremock serves
    // mounted mocks in priority/declaration order and this crate's retrier
    // re-issues the same GET, so a `Mock` with `up_to_n_times(2)` followed by
    // an always-on success mock reproduces a flaky-then-healthy origin.
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(simple_html("Recovered", "ok")),
        )
        .mount(&server)
        .await;

    let mut config = test_config();
    config.default.retry.max_retries = Some(5);
    config.default.retry.initial_delay_ms = Some(1);
    config.default.retry.max_delay_ms = Some(5);

    let coordinator = FetchCoordinator::new(&config).expect("build coordinator");
    let url = format!("{}/flaky", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should eventually succeed");
    assert_eq!(output.title, Some("Recovered".to_string()));
}

#[tokio::test]
async fn test_redirect_followed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/old"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/new"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_string(simple_html("New Page", "Redirected content")),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url = format!("{}/old", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(output.requested_url.contains("/old"), "requested_url should be the original URL");
    assert!(output.final_url.contains("/new"), "final_url should be the redirect target");
    assert_eq!(output.title, Some("New Page".to_string()));
}

#[tokio::test]
async fn test_output_has_fetched_at_timestamp() {
    let html = simple_html("Test", "Content");
    let server = setup_mock_server_with_robots(&html).await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(!output.fetched_at.is_empty());
    assert!(output.fetched_at.contains('T'));
    assert!(output.fetched_at.contains('Z') || output.fetched_at.contains('+'));
}

#[tokio::test]
async fn test_url_fragment_removed_from_final_url() {
    let html = simple_html("Test", "Content");
    let server = setup_mock_server_with_robots(&html).await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url_with_fragment = format!("{}#section", server.uri());
    let input = WebFetchInput::new(&url_with_fragment).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(!output.final_url.contains('#'), "fragment should be removed from final_url");
}

#[tokio::test]
async fn test_http_upgraded_to_https() {
    // With a secure config (allow_insecure_overrides = false) an http:// URL
    // is upgraded to https:// before SSRF validation runs; we observe this
    // indirectly via a loopback address, which gets SSRF-blocked either way,
    // but only after the upgrade has happened.
    let coordinator = FetchCoordinator::new(&test_config_secure()).expect("build coordinator");
    let input = WebFetchInput::new("http://127.0.0.1/").expect("valid URL");

    let result = coordinator.fetch(input).await;
    assert_eq!(result.expect_err("should be SSRF blocked").code, ErrorCode::SsrfBlocked);
}

#[tokio::test]
async fn test_http_not_upgraded_when_insecure_overrides() {
    let html = simple_html("Test", "Content");
    let server = setup_mock_server_with_robots(&html).await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator"); // allow_insecure_overrides = true
    let input = WebFetchInput::new(server.uri()).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");

    assert!(
        !output.notes.contains(&Note::HttpUpgradedToHttps),
        "http should not be upgraded when insecure overrides are enabled"
    );
}

#[tokio::test]
async fn test_json_content_is_pretty_printed() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/data.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .set_body_bytes(br#"{"key":"value"}"#.as_slice()),
        )
        .mount(&server)
        .await;

    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    let url = format!("{}/data.json", server.uri());
    let input = WebFetchInput::new(&url).expect("valid URL");

    let output = coordinator.fetch(input).await.expect("fetch should succeed");
    assert!(output.content.contains("\"key\""));
    assert!(output.content.contains('\n'), "pretty-printed JSON should be multi-line");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let coordinator = FetchCoordinator::new(&test_config()).expect("build coordinator");
    coordinator.close().await;
    coordinator.close().await;
}
