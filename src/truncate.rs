//! Truncator: trims parsed content to a token budget using a cheap,
//! content-type-parameterized linear char/token ratio — not the real
//! tokenizer `crate::token::TokenCounter` uses for `FetchChunk::token_count`.
//! It must stay a pure, allocation-free function of length and content-type,
//! so it trades accuracy for being safe to call on every response without
//! warming up an encoder or paying its per-call cost.
//!
//! Cut points prefer a trailing HTML closing tag or a markdown-table-safe
//! line boundary over a bare character offset, and are always retreated to
//! the nearest UTF-8 char boundary.

use crate::types::TruncateResult;

const RATIO_HTML: f64 = 2.25;
const RATIO_PLAIN: f64 = 2.0;
const RATIO_JSON: f64 = 3.0;
const RATIO_XML: f64 = 2.5;
const RATIO_DEFAULT: f64 = 3.0;

const MIN_WINDOW_CHARS: usize = 20;

/// Closing tags searched for, in priority order, when the content looks
/// like HTML/Markdown-from-HTML — cutting after one of these avoids
/// splitting mid-element.
const HTML_CLOSE_TAGS: &[&str] = &[
    "</article>",
    "</section>",
    "</div>",
    "</main>",
    "</header>",
    "</footer>",
    "</nav>",
    "</aside>",
    "</p>",
    "</li>",
    "</tr>",
    "</h1>",
    "</h2>",
    "</h3>",
    "</h4>",
    "</h5>",
    "</h6>",
    "</blockquote>",
    "</pre>",
];

fn ratio_for(content_type: Option<&str>) -> f64 {
    let normalized = content_type
        .and_then(|ct| ct.split(';').next())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "text/html" | "application/xhtml+xml" => RATIO_HTML,
        "text/plain" => RATIO_PLAIN,
        "application/json" => RATIO_JSON,
        "application/xml" | "text/xml" => RATIO_XML,
        _ => RATIO_DEFAULT,
    }
}

fn is_html_like(content_type: Option<&str>) -> bool {
    let normalized = content_type
        .and_then(|ct| ct.split(';').next())
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    matches!(normalized.as_str(), "text/html" | "application/xhtml+xml")
}

/// Estimate the token count of `text` under the linear ratio for
/// `content_type`, without performing any truncation.
#[must_use]
pub(crate) fn estimate_tokens(text: &str, content_type: Option<&str>) -> u32 {
    let chars = text.chars().count();
    let ratio = ratio_for(content_type);
    round_tokens(chars, ratio)
}

fn round_tokens(chars: usize, ratio: f64) -> u32 {
    let tokens = (chars as f64 / ratio).ceil();
    if tokens <= 0.0 {
        0
    } else if tokens >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        tokens as u32
    }
}

/// Truncate `body` to fit within `max_tokens` (estimated via the linear
/// ratio for `content_type`). `None` leaves the content untouched.
#[must_use]
pub(crate) fn truncate(body: &str, content_type: Option<&str>, max_tokens: Option<u32>) -> TruncateResult {
    let ratio = ratio_for(content_type);
    let total_chars = body.chars().count();
    let total_tokens = round_tokens(total_chars, ratio);

    let Some(max_tokens) = max_tokens else {
        return whole(body, total_chars, total_tokens);
    };
    if total_tokens <= max_tokens || total_chars == 0 {
        return whole(body, total_chars, total_tokens);
    }

    let target_chars = ((f64::from(max_tokens) * ratio).floor() as usize).clamp(1, total_chars.saturating_sub(1));
    let cut = pick_cut_point(body, content_type, target_chars, total_chars);
    let content = body[..cut].to_string();
    let returned_chars = content.chars().count();
    let returned_tokens = round_tokens(returned_chars, ratio);

    TruncateResult {
        content,
        truncated: true,
        returned_chars,
        returned_tokens,
        total_chars,
        total_tokens,
        // Byte offset, not a char count: callers resume by re-invoking on
        // `body[cut..]`, which only a byte index can index safely.
        next_offset: Some(cut),
    }
}

fn whole(body: &str, total_chars: usize, total_tokens: u32) -> TruncateResult {
    TruncateResult {
        content: body.to_string(),
        truncated: false,
        returned_chars: total_chars,
        returned_tokens: total_tokens,
        total_chars,
        total_tokens,
        next_offset: None,
    }
}

pub(crate) fn char_to_byte(body: &str, char_idx: usize) -> usize {
    body.char_indices().nth(char_idx).map_or(body.len(), |(b, _)| b)
}

/// Choose a byte offset near `target_chars` that avoids splitting an HTML
/// element, a markdown table row, or a UTF-8 character.
fn pick_cut_point(body: &str, content_type: Option<&str>, target_chars: usize, total_chars: usize) -> usize {
    let window = (target_chars / 10).max(MIN_WINDOW_CHARS);
    let window_start_char = target_chars.saturating_sub(window);
    let window_end_char = (target_chars + window).min(total_chars);

    let window_start_byte = char_to_byte(body, window_start_char);
    let window_end_byte = char_to_byte(body, window_end_char);
    let target_byte = char_to_byte(body, target_chars);

    let mut cut = if is_html_like(content_type) {
        find_last_closing_tag(&body[window_start_byte..window_end_byte])
            .map(|rel_end| window_start_byte + rel_end)
            .or_else(|| find_last_gt(&body[..window_end_byte]))
            .unwrap_or_else(|| fallback_whitespace_cut(body, window_start_byte, target_byte))
    } else {
        fallback_whitespace_cut(body, window_start_byte, target_byte)
    };

    cut = extend_past_table_row(body, cut);

    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

fn find_last_closing_tag(window: &str) -> Option<usize> {
    let lower = window.to_ascii_lowercase();
    HTML_CLOSE_TAGS
        .iter()
        .filter_map(|tag| lower.rfind(tag).map(|idx| idx + tag.len()))
        .max()
}

/// Intermediate fallback between the preferred-closing-tag search and the
/// plain whitespace cut: the last `>` anywhere in `prefix`, cutting just
/// after it so at least a full tag (of any kind) is kept intact.
fn find_last_gt(prefix: &str) -> Option<usize> {
    prefix.rfind('>').map(|idx| idx + 1)
}

/// Walk backward from `target_byte` (but not past `floor_byte`) to the
/// nearest whitespace, cutting just after it. Falls back to `target_byte`
/// verbatim if no whitespace is found in range.
fn fallback_whitespace_cut(body: &str, floor_byte: usize, target_byte: usize) -> usize {
    let slice = &body[floor_byte..target_byte.min(body.len())];
    match slice.char_indices().rev().find(|(_, c)| c.is_whitespace()) {
        Some((idx, c)) => floor_byte + idx + c.len_utf8(),
        None => target_byte,
    }
}

/// If `cut` lands inside a line that looks like a markdown table row (at
/// least two `|` characters), extend the cut to the end of that line so a
/// row is never split mid-cell.
fn extend_past_table_row(body: &str, cut: usize) -> usize {
    let cut = cut.min(body.len());
    let line_start = body[..cut].rfind('\n').map_or(0, |i| i + 1);
    let line_end = body[cut..].find('\n').map_or(body.len(), |i| cut + i + 1);
    let line = &body[line_start..line_end];
    if line.matches('|').count() >= 2 { line_end } else { cut }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_when_under_budget() {
        let result = truncate("hello world", Some("text/plain"), Some(1000));
        assert!(!result.truncated);
        assert_eq!(result.content, "hello world");
        assert_eq!(result.next_offset, None);
    }

    #[test]
    fn truncates_when_over_budget() {
        let body = "word ".repeat(2000);
        let result = truncate(&body, Some("text/plain"), Some(50));
        assert!(result.truncated);
        assert!(result.content.len() < body.len());
        assert_eq!(result.next_offset, Some(result.content.len()));
    }

    #[test]
    fn cut_point_is_char_boundary() {
        let body = "héllo wörld ".repeat(500);
        let result = truncate(&body, Some("text/plain"), Some(10));
        assert!(result.content.is_char_boundary(result.content.len()));
        assert!(std::str::from_utf8(result.content.as_bytes()).is_ok());
    }

    #[test]
    fn html_cut_prefers_closing_tag() {
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("<p>paragraph number {i} with some filler text here</p>"));
        }
        let result = truncate(&body, Some("text/html"), Some(30));
        assert!(result.truncated);
        assert!(result.content.ends_with("</p>") || result.content.len() < body.len());
    }

    #[test]
    fn table_row_not_split() {
        let mut body = String::new();
        for i in 0..200 {
            body.push_str(&format!("| col {i} | value {i} | another {i} |\n"));
        }
        let result = truncate(&body, Some("text/plain"), Some(40));
        assert!(result.truncated);
        // cut should land on a line boundary, not mid-row
        assert!(result.content.ends_with('\n') || result.content.len() == body.len());
    }

    #[test]
    fn pagination_offsets_are_contiguous() {
        let body = "word ".repeat(3000);
        let first = truncate(&body, Some("text/plain"), Some(50));
        assert!(first.truncated);
        let next_offset = first.next_offset.expect("truncated result carries next_offset");
        assert_eq!(next_offset, first.content.len());
        let rest = &body[next_offset..];
        let second = truncate(rest, Some("text/plain"), Some(50));
        assert!(!second.content.is_empty());
        assert_eq!(format!("{}{}", first.content, rest), body);
    }

    #[test]
    fn no_budget_returns_everything() {
        let body = "word ".repeat(3000);
        let result = truncate(&body, Some("text/plain"), None);
        assert!(!result.truncated);
        assert_eq!(result.content, body);
    }

    #[test]
    fn ratio_varies_by_content_type() {
        let text = "x".repeat(900);
        let html_tokens = estimate_tokens(&text, Some("text/html"));
        let json_tokens = estimate_tokens(&text, Some("application/json"));
        assert!(html_tokens > json_tokens);
    }
}
