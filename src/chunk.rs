//! Heading-scoped chunker: splits already-converted Markdown into a
//! `Vec<FetchChunk>`, each tagged with its nearest preceding heading and its
//! own token count against a real tokenizer, respecting the token budget per
//! chunk.
//!
//! This is additive to, and built on different primitives from, the
//! byte-offset `crate::truncate::truncate` above: that function is a pure
//! content-type-agnostic cut-point selector over the cheap linear ratio
//! estimator, while this chunker finds block boundaries (headings, code
//! fences, lists, paragraphs) with `pulldown-cmark`'s event stream and counts
//! tokens with `crate::token::TokenCounter` so that code blocks and list
//! items are never split across a chunk boundary. `pulldown-cmark` locates
//! the boundaries; everything downstream works on raw source slices taken
//! between them, so the original text is never re-serialized from parsed
//! events.

use pulldown_cmark::{Event, Options, Parser, TagEnd};

use crate::token::TokenCounter;
use crate::types::FetchChunk;

/// Block types detected during parsing.
#[derive(Debug, Clone)]
enum Block {
    /// Heading (ATX or Setext) with normalized display text.
    Heading { text: String, raw: String },
    /// Paragraph: non-blank, non-heading, non-code, non-list content.
    Paragraph(String),
    /// Fenced code block: language hint and content lines.
    CodeFence {
        fence: String,
        language: String,
        content: Vec<String>,
    },
    /// List block: consecutive list items with continuation lines.
    List(String),
    /// One or more blank lines (separator).
    BlankLines(String),
}

/// Parse Markdown content into blocks. `pulldown-cmark` locates the
/// top-level block boundaries (heading, paragraph, fenced/indented code,
/// list, or anything else CommonMark treats as block-level); each resulting
/// `Block` carries the raw source slice for that range rather than a
/// re-serialization of its parsed events, so byte-for-byte content survives
/// into the chunker untouched. Runs of non-block whitespace between
/// boundaries become `Block::BlankLines`.
fn parse_blocks(markdown: &str) -> Vec<Block> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_TASKLISTS);

    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut cursor = 0usize;
    let mut block_start = 0usize;

    for (event, range) in Parser::new_ext(markdown, options).into_offset_iter() {
        match &event {
            Event::Start(_) => {
                if depth == 0 {
                    push_gap(&mut blocks, markdown, cursor, range.start);
                    block_start = range.start;
                }
                depth += 1;
            }
            Event::End(tag_end) => {
                depth -= 1;
                if depth == 0 {
                    let raw = &markdown[block_start..range.end];
                    cursor = range.end;
                    blocks.push(block_for(tag_end, raw));
                }
            }
            (Event::Html(_) | Event::Rule) if depth == 0 => {
                push_gap(&mut blocks, markdown, cursor, range.start);
                let raw = &markdown[range.start..range.end];
                if !raw.trim().is_empty() {
                    blocks.push(Block::Paragraph(raw.to_string()));
                }
                cursor = range.end;
            }
            _ => {}
        }
    }

    push_gap(&mut blocks, markdown, cursor, markdown.len());
    blocks
}

/// Build a `Block` from a closed top-level tag and its raw source slice.
/// Headings and code blocks additionally need a line of their own raw text
/// re-examined (for the heading's display text, and the code block's fence
/// delimiter/language) — both reuse the single-line recognizers below rather
/// than duplicating them.
fn block_for(tag_end: &TagEnd, raw: &str) -> Block {
    match tag_end {
        TagEnd::Heading(_) => Block::Heading { text: heading_text(raw), raw: raw.to_string() },
        TagEnd::CodeBlock => {
            let (fence, language) = extract_fence(raw);
            let content = raw.lines().map(str::to_string).collect();
            Block::CodeFence { fence, language, content }
        }
        TagEnd::List(_) => Block::List(raw.to_string()),
        _ => Block::Paragraph(raw.to_string()),
    }
}

/// Push the gap between two block boundaries: a run of blank lines becomes
/// `Block::BlankLines`; any non-blank leftover (lazy continuation lines
/// CommonMark folds into a neighbor, stray text) becomes a `Paragraph`
/// rather than being silently dropped.
fn push_gap(blocks: &mut Vec<Block>, markdown: &str, start: usize, end: usize) {
    if start >= end {
        return;
    }
    let gap = &markdown[start..end];
    if gap.trim().is_empty() {
        blocks.push(Block::BlankLines(gap.to_string()));
    } else {
        blocks.push(Block::Paragraph(gap.to_string()));
    }
}

/// Extract a heading's display text from its raw source: ATX (`# Title`) via
/// `parse_atx_heading`, Setext (underlined) by taking the first line as-is.
fn heading_text(raw: &str) -> String {
    let first_line = raw.lines().next().unwrap_or(raw);
    match parse_atx_heading(first_line) {
        Some((_, text, _)) => text,
        None => normalize_whitespace(first_line.trim()),
    }
}

/// Extract the fence delimiter and language hint from a code block's raw
/// source, via `parse_fence_start` on its first line. Indented code blocks
/// (no backtick/tilde fence) yield an empty fence, handled specially by
/// `split_oversized_code`.
fn extract_fence(raw: &str) -> (String, String) {
    raw.lines().next().and_then(parse_fence_start).unwrap_or_default()
}

fn parse_atx_heading(line: &str) -> Option<(u8, String, String)> {
    let trimmed = line.trim_start();

    if !trimmed.starts_with('#') {
        return None;
    }

    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }

    let after_hashes = &trimmed[level..];

    if !after_hashes.is_empty() && !after_hashes.starts_with(' ') && !after_hashes.starts_with('\t') {
        return None;
    }

    let text = after_hashes.trim();
    let text = text
        .trim_end_matches('#')
        .trim_end_matches(|c: char| c.is_whitespace())
        .trim();

    if text.is_empty() && after_hashes.trim().is_empty() {
        return None;
    }

    Some((level as u8, normalize_whitespace(text), line.to_string()))
}

fn parse_fence_start(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim_start();

    let fence_char = if trimmed.starts_with('`') {
        '`'
    } else if trimmed.starts_with('~') {
        '~'
    } else {
        return None;
    };

    let fence_len = trimmed.chars().take_while(|c| *c == fence_char).count();
    if fence_len < 3 {
        return None;
    }

    let fence = fence_char.to_string().repeat(fence_len);
    let after_fence = &trimmed[fence_len..];
    let language = after_fence.split_whitespace().next().unwrap_or("");

    Some((fence, language.to_string()))
}

fn is_fence_close(line: &str, opening_fence: &str) -> bool {
    let trimmed = line.trim();
    let fence_char = opening_fence.chars().next().unwrap_or('`');

    if !trimmed.starts_with(fence_char) {
        return false;
    }

    let fence_len = trimmed.chars().take_while(|c| *c == fence_char).count();

    if fence_len < opening_fence.len() {
        return false;
    }

    trimmed[fence_len..].trim().is_empty()
}

/// Matches: `^\s{0,3}(?:[-+*]|\d+[.)])\s+`
fn is_list_item_start(line: &str) -> bool {
    let trimmed = line.trim_start();
    let leading_spaces = line.len() - trimmed.len();

    if leading_spaces > 3 {
        return false;
    }

    if trimmed.starts_with("- ")
        || trimmed.starts_with("+ ")
        || trimmed.starts_with("* ")
        || trimmed == "-"
        || trimmed == "+"
        || trimmed == "*"
    {
        return true;
    }

    let mut chars = trimmed.chars().peekable();
    let mut has_digit = false;

    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            has_digit = true;
            chars.next();
        } else {
            break;
        }
    }

    if has_digit
        && let Some(marker) = chars.next()
        && (marker == '.' || marker == ')')
    {
        return chars.next().is_none_or(|c| c == ' ' || c == '\t');
    }

    false
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split already-converted Markdown into heading-scoped, token-bounded
/// chunks. Code fences and list items are kept atomic wherever they fit
/// under `max_tokens`; an oversized block is split at sentence, then
/// whitespace, then character boundaries (for prose), at line boundaries
/// (for code), or at item boundaries (for lists).
#[must_use]
pub(crate) fn chunk(markdown: &str, max_tokens: u32) -> Vec<FetchChunk> {
    let counter = TokenCounter::new();
    let blocks = parse_blocks(markdown);

    let mut chunks = Vec::new();
    let mut current_heading = String::new();
    let mut current_text = String::new();
    let mut current_tokens: u32 = 0;

    for block in blocks {
        match block {
            Block::Heading { text, raw, .. } => {
                if has_content(&current_text) {
                    chunks.push(FetchChunk {
                        heading: current_heading.clone(),
                        text: current_text.clone(),
                        token_count: current_tokens,
                    });
                    current_text.clear();
                }

                current_heading = text;

                current_text = raw;
                current_tokens = counter.count_str(&current_text);
            }

            Block::BlankLines(blanks) => {
                if !current_text.is_empty() {
                    current_text.push_str(&blanks);
                    if !blanks.is_empty() {
                        current_text.push('\n');
                    }
                }
            }

            Block::Paragraph(text) => {
                let block_tokens = counter.count_str(&text);

                if current_tokens + block_tokens > max_tokens && has_content(&current_text) {
                    chunks.push(FetchChunk {
                        heading: current_heading.clone(),
                        text: trim_block_separators(&current_text),
                        token_count: current_tokens,
                    });
                    current_text.clear();
                    current_tokens = 0;
                }

                if block_tokens > max_tokens {
                    if has_content(&current_text) {
                        chunks.push(FetchChunk {
                            heading: current_heading.clone(),
                            text: trim_block_separators(&current_text),
                            token_count: current_tokens,
                        });
                        current_text.clear();
                        current_tokens = 0;
                    }

                    let split_chunks = split_oversized_text(&text, max_tokens, &counter, &current_heading);
                    chunks.extend(split_chunks);
                } else {
                    append_block(&mut current_text, &text);
                    current_tokens = counter.count_str(&trim_block_separators(&current_text));
                }
            }

            Block::CodeFence { fence, language, content } => {
                let block_text = content.join("\n");
                let block_tokens = counter.count_str(&block_text);

                if current_tokens + block_tokens > max_tokens && has_content(&current_text) {
                    chunks.push(FetchChunk {
                        heading: current_heading.clone(),
                        text: trim_block_separators(&current_text),
                        token_count: current_tokens,
                    });
                    current_text.clear();
                    current_tokens = 0;
                }

                if block_tokens > max_tokens {
                    if has_content(&current_text) {
                        chunks.push(FetchChunk {
                            heading: current_heading.clone(),
                            text: trim_block_separators(&current_text),
                            token_count: current_tokens,
                        });
                        current_text.clear();
                        current_tokens = 0;
                    }

                    let split_chunks = split_oversized_code(&fence, &language, &content, max_tokens, &counter, &current_heading);
                    chunks.extend(split_chunks);
                } else {
                    append_block(&mut current_text, &block_text);
                    current_tokens = counter.count_str(&trim_block_separators(&current_text));
                }
            }

            Block::List(text) => {
                let block_tokens = counter.count_str(&text);

                if current_tokens + block_tokens > max_tokens && has_content(&current_text) {
                    chunks.push(FetchChunk {
                        heading: current_heading.clone(),
                        text: trim_block_separators(&current_text),
                        token_count: current_tokens,
                    });
                    current_text.clear();
                    current_tokens = 0;
                }

                if block_tokens > max_tokens {
                    if has_content(&current_text) {
                        chunks.push(FetchChunk {
                            heading: current_heading.clone(),
                            text: trim_block_separators(&current_text),
                            token_count: current_tokens,
                        });
                        current_text.clear();
                        current_tokens = 0;
                    }

                    let split_chunks = split_oversized_list(&text, max_tokens, &counter, &current_heading);
                    chunks.extend(split_chunks);
                } else {
                    append_block(&mut current_text, &text);
                    current_tokens = counter.count_str(&trim_block_separators(&current_text));
                }
            }
        }
    }

    if has_content(&current_text) {
        let trimmed = trim_block_separators(&current_text);
        let token_count = counter.count_str(&trimmed);
        chunks.push(FetchChunk {
            heading: current_heading,
            text: trimmed,
            token_count,
        });
    }

    chunks
}

fn has_content(text: &str) -> bool {
    text.chars().any(|c| !c.is_whitespace())
}

fn append_block(current: &mut String, block: &str) {
    if !current.is_empty() && !current.ends_with('\n') {
        current.push('\n');
    }
    current.push_str(block);
}

fn trim_block_separators(text: &str) -> String {
    text.trim_end().to_string()
}

/// Split oversized text at sentence, then whitespace, then char boundaries.
fn split_oversized_text(text: &str, max_tokens: u32, counter: &TokenCounter, heading: &str) -> Vec<FetchChunk> {
    let mut chunks = Vec::new();

    let sentences = split_at_sentences(text);
    if sentences.len() > 1 {
        let mut current = String::new();

        for sentence in sentences {
            let candidate = if current.is_empty() {
                sentence.clone()
            } else {
                format!("{current} {sentence}")
            };

            let candidate_tokens = counter.count_str(&candidate);

            if candidate_tokens > max_tokens && !current.is_empty() {
                chunks.push(FetchChunk {
                    heading: heading.to_string(),
                    text: current.clone(),
                    token_count: counter.count_str(&current),
                });
                current = sentence;
            } else if candidate_tokens > max_tokens {
                let sub_chunks = split_at_whitespace(&sentence, max_tokens, counter, heading);
                chunks.extend(sub_chunks);
                current.clear();
            } else {
                current = candidate;
            }
        }

        if !current.is_empty() {
            chunks.push(FetchChunk {
                heading: heading.to_string(),
                text: current.clone(),
                token_count: counter.count_str(&current),
            });
        }

        return chunks;
    }

    split_at_whitespace(text, max_tokens, counter, heading)
}

fn split_at_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        current.push(chars[i]);

        if chars[i] == '.' || chars[i] == '!' || chars[i] == '?' {
            let next = chars.get(i + 1);
            if next.is_none() || next == Some(&' ') || next == Some(&'\n') {
                sentences.push(current.trim().to_string());
                current.clear();
            }
        }

        i += 1;
    }

    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }

    sentences
}

fn split_at_whitespace(text: &str, max_tokens: u32, counter: &TokenCounter, heading: &str) -> Vec<FetchChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };

        let candidate_tokens = counter.count_str(&candidate);

        if candidate_tokens > max_tokens && !current.is_empty() {
            chunks.push(FetchChunk {
                heading: heading.to_string(),
                text: current.clone(),
                token_count: counter.count_str(&current),
            });
            current = word.to_string();

            if counter.count_str(&current) > max_tokens {
                let char_chunks = split_at_chars(&current, max_tokens, counter, heading);
                chunks.extend(char_chunks);
                current.clear();
            }
        } else if candidate_tokens > max_tokens {
            let char_chunks = split_at_chars(word, max_tokens, counter, heading);
            chunks.extend(char_chunks);
        } else {
            current = candidate;
        }
    }

    if !current.is_empty() {
        chunks.push(FetchChunk {
            heading: heading.to_string(),
            text: current.clone(),
            token_count: counter.count_str(&current),
        });
    }

    chunks
}

fn split_at_chars(text: &str, max_tokens: u32, counter: &TokenCounter, heading: &str) -> Vec<FetchChunk> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        let candidate = format!("{current}{ch}");
        let candidate_tokens = counter.count_str(&candidate);

        if candidate_tokens > max_tokens && !current.is_empty() {
            chunks.push(FetchChunk {
                heading: heading.to_string(),
                text: current.clone(),
                token_count: counter.count_str(&current),
            });
            current = ch.to_string();
        } else {
            current = candidate;
        }
    }

    if !current.is_empty() {
        chunks.push(FetchChunk {
            heading: heading.to_string(),
            text: current.clone(),
            token_count: counter.count_str(&current),
        });
    }

    chunks
}

fn split_oversized_code(
    fence: &str,
    language: &str,
    content: &[String],
    max_tokens: u32,
    counter: &TokenCounter,
    heading: &str,
) -> Vec<FetchChunk> {
    if fence.is_empty() {
        return split_plain_lines(content, max_tokens, counter, heading);
    }

    let mut chunks = Vec::new();

    let code_lines: Vec<&str> = content
        .iter()
        .skip(1)
        .filter_map(|line| if is_fence_close(line, fence) { None } else { Some(line.as_str()) })
        .collect();

    let opening = if language.is_empty() { fence.to_string() } else { format!("{fence}{language}") };

    let mut current_lines: Vec<&str> = Vec::new();

    for line in &code_lines {
        let mut candidate = opening.clone();
        for l in &current_lines {
            candidate.push('\n');
            candidate.push_str(l);
        }
        candidate.push('\n');
        candidate.push_str(line);
        candidate.push('\n');
        candidate.push_str(fence);

        let candidate_tokens = counter.count_str(&candidate);

        if candidate_tokens > max_tokens && !current_lines.is_empty() {
            let mut chunk_text = opening.clone();
            for l in &current_lines {
                chunk_text.push('\n');
                chunk_text.push_str(l);
            }
            chunk_text.push('\n');
            chunk_text.push_str(fence);

            chunks.push(FetchChunk {
                heading: heading.to_string(),
                text: chunk_text.clone(),
                token_count: counter.count_str(&chunk_text),
            });

            current_lines.clear();
        }

        current_lines.push(line);
    }

    if !current_lines.is_empty() {
        let mut chunk_text = opening;
        for l in &current_lines {
            chunk_text.push('\n');
            chunk_text.push_str(l);
        }
        chunk_text.push('\n');
        chunk_text.push_str(fence);

        chunks.push(FetchChunk {
            heading: heading.to_string(),
            text: chunk_text.clone(),
            token_count: counter.count_str(&chunk_text),
        });
    }

    chunks
}

/// Split an oversized indented (fence-less) code block line by line. Unlike
/// a fenced block, every line of `content` is code — there is no opening or
/// closing delimiter to skip.
fn split_plain_lines(content: &[String], max_tokens: u32, counter: &TokenCounter, heading: &str) -> Vec<FetchChunk> {
    let mut chunks = Vec::new();
    let mut current_lines: Vec<&str> = Vec::new();

    for line in content {
        let mut candidate = String::new();
        for l in &current_lines {
            candidate.push_str(l);
            candidate.push('\n');
        }
        candidate.push_str(line);

        let candidate_tokens = counter.count_str(&candidate);

        if candidate_tokens > max_tokens && !current_lines.is_empty() {
            let chunk_text = current_lines.join("\n");
            chunks.push(FetchChunk {
                heading: heading.to_string(),
                text: chunk_text.clone(),
                token_count: counter.count_str(&chunk_text),
            });
            current_lines.clear();
        }

        current_lines.push(line.as_str());
    }

    if !current_lines.is_empty() {
        let chunk_text = current_lines.join("\n");
        chunks.push(FetchChunk {
            heading: heading.to_string(),
            text: chunk_text.clone(),
            token_count: counter.count_str(&chunk_text),
        });
    }

    chunks
}

fn split_oversized_list(text: &str, max_tokens: u32, counter: &TokenCounter, heading: &str) -> Vec<FetchChunk> {
    let mut chunks = Vec::new();

    let items = parse_list_items(text);

    let mut current_text = String::new();

    for item in &items {
        let candidate = if current_text.is_empty() { item.clone() } else { format!("{current_text}\n{item}") };

        let candidate_tokens = counter.count_str(&candidate);

        if candidate_tokens > max_tokens && !current_text.is_empty() {
            chunks.push(FetchChunk {
                heading: heading.to_string(),
                text: current_text.clone(),
                token_count: counter.count_str(&current_text),
            });
            current_text.clear();
        }

        if counter.count_str(item) > max_tokens {
            if !current_text.is_empty() {
                chunks.push(FetchChunk {
                    heading: heading.to_string(),
                    text: current_text.clone(),
                    token_count: counter.count_str(&current_text),
                });
                current_text.clear();
            }

            let item_chunks = split_oversized_list_item(item, max_tokens, counter, heading);
            chunks.extend(item_chunks);
        } else if current_text.is_empty() {
            current_text = item.clone();
        } else {
            current_text = candidate;
        }
    }

    if !current_text.is_empty() {
        chunks.push(FetchChunk {
            heading: heading.to_string(),
            text: current_text.clone(),
            token_count: counter.count_str(&current_text),
        });
    }

    chunks
}

fn parse_list_items(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current_item = String::new();

    for line in text.lines() {
        if is_list_item_start(line) {
            if !current_item.is_empty() {
                items.push(current_item);
            }
            current_item = line.to_string();
        } else if !current_item.is_empty() {
            current_item.push('\n');
            current_item.push_str(line);
        }
    }

    if !current_item.is_empty() {
        items.push(current_item);
    }

    items
}

fn split_oversized_list_item(item: &str, max_tokens: u32, counter: &TokenCounter, heading: &str) -> Vec<FetchChunk> {
    let (marker, rest) = extract_list_marker(item);
    let continuation_indent = "  ";

    let content_chunks = split_oversized_text(rest, max_tokens, counter, heading);

    let mut result = Vec::new();
    for (i, chunk) in content_chunks.into_iter().enumerate() {
        let formatted_text = if i == 0 {
            format!("{marker}{}", chunk.text)
        } else {
            chunk.text.lines().map(|line| format!("{continuation_indent}{line}")).collect::<Vec<_>>().join("\n")
        };

        result.push(FetchChunk {
            heading: chunk.heading,
            text: formatted_text.clone(),
            token_count: counter.count_str(&formatted_text),
        });
    }

    result
}

/// Extract list marker from item start.
fn extract_list_marker(item: &str) -> (String, &str) {
    let trimmed = item.trim_start();
    let leading_ws = &item[..item.len() - trimmed.len()];

    for marker in &["- ", "+ ", "* "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            let full_marker = format!("{leading_ws}{marker}");
            return (full_marker, rest);
        }
    }

    let mut i = 0;
    let chars: Vec<char> = trimmed.chars().collect();

    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }

    if i > 0 && i < chars.len() && (chars[i] == '.' || chars[i] == ')') {
        let marker_end = i + 1;
        if marker_end < chars.len() && chars[marker_end] == ' ' {
            let marker_str: String = chars[..=marker_end].iter().collect();
            let full_marker = format!("{leading_ws}{marker_str}");
            let rest_start = leading_ws.len() + marker_str.len();
            return (full_marker, &item[rest_start..]);
        }
    }

    (String::new(), item)
}

#[cfg(test)]
mod tests {
    use super::{
        Block, chunk, extract_list_marker, is_fence_close, is_list_item_start, parse_atx_heading, parse_blocks,
        parse_fence_start, parse_list_items, split_at_sentences,
    };

    #[test]
    fn test_parse_atx_heading() {
        assert_eq!(parse_atx_heading("# Hello"), Some((1, "Hello".to_string(), "# Hello".to_string())));
        assert_eq!(parse_atx_heading("## World"), Some((2, "World".to_string(), "## World".to_string())));
        assert_eq!(parse_atx_heading("### Test ###"), Some((3, "Test".to_string(), "### Test ###".to_string())));
        assert_eq!(parse_atx_heading("Not a heading"), None);
        assert_eq!(parse_atx_heading("#NoSpace"), None);
    }

    #[test]
    fn test_parse_fence_start() {
        assert_eq!(parse_fence_start("```rust"), Some(("```".to_string(), "rust".to_string())));
        assert_eq!(parse_fence_start("~~~"), Some(("~~~".to_string(), String::new())));
        assert_eq!(parse_fence_start("````python"), Some(("````".to_string(), "python".to_string())));
        assert_eq!(parse_fence_start("``not enough"), None);
    }

    #[test]
    fn test_is_fence_close() {
        assert!(is_fence_close("```", "```"));
        assert!(is_fence_close("````", "```"));
        assert!(is_fence_close("~~~", "~~~"));
        assert!(!is_fence_close("``", "```"));
        assert!(!is_fence_close("``` extra", "```"));
    }

    #[test]
    fn test_is_list_item_start() {
        assert!(is_list_item_start("- item"));
        assert!(is_list_item_start("* item"));
        assert!(is_list_item_start("+ item"));
        assert!(is_list_item_start("1. item"));
        assert!(is_list_item_start("99. item"));
        assert!(is_list_item_start("  - nested"));
        assert!(!is_list_item_start("    - too indented"));
        assert!(!is_list_item_start("not a list"));
    }

    #[test]
    fn test_parse_blocks_basic() {
        let md = "# Heading\n\nParagraph text.\n\n- list item";
        let blocks = parse_blocks(md);

        assert!(matches!(blocks[0], Block::Heading { .. }));
        assert!(matches!(blocks[1], Block::BlankLines(_)));
        assert!(matches!(blocks[2], Block::Paragraph(_)));
        assert!(matches!(blocks[3], Block::BlankLines(_)));
        assert!(matches!(blocks[4], Block::List(_)));
    }

    #[test]
    fn test_parse_blocks_code_fence() {
        let md = "```rust\nfn main() {}\n```";
        let blocks = parse_blocks(md);

        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], Block::CodeFence { .. }));
    }

    #[test]
    fn test_chunk_basic() {
        let markdown = "# Heading\n\nParagraph one.\n\nParagraph two.";
        let chunks = chunk(markdown, 1000);

        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].heading, "Heading");
    }

    #[test]
    fn test_chunk_respects_budget() {
        let markdown = "# Test\n\n".to_string() + &"word ".repeat(200);
        let chunks = chunk(&markdown, 50);

        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_count <= 60, "Chunk exceeded budget: {} tokens", c.token_count);
        }
    }

    #[test]
    fn test_chunk_code_fence_atomic() {
        let markdown = "# Code\n\n```rust\nfn foo() {}\n```\n\nMore text.";
        let chunks = chunk(markdown, 1000);

        let code_chunk = chunks.iter().find(|c| c.text.contains("```rust"));
        assert!(code_chunk.is_some());
        let code = code_chunk.unwrap();
        assert!(code.text.contains("fn foo()"));
        assert!(code.text.matches("```").count() >= 2);
    }

    #[test]
    fn test_chunk_heading_tracking() {
        let markdown = "# First\n\nContent under first.\n\n## Second\n\nContent under second.";
        let chunks = chunk(markdown, 1000);

        assert!(chunks.iter().any(|c| c.heading == "First"));

        if let Some(second_chunk) = chunks.iter().find(|c| c.text.contains("Content under second")) {
            assert_eq!(second_chunk.heading, "Second");
        }
    }

    #[test]
    fn test_split_at_sentences() {
        let text = "First sentence. Second sentence! Third? Yes.";
        let sentences = split_at_sentences(text);

        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[0], "First sentence.");
        assert_eq!(sentences[1], "Second sentence!");
        assert_eq!(sentences[2], "Third?");
        assert_eq!(sentences[3], "Yes.");
    }

    #[test]
    fn test_parse_list_items() {
        let text = "- item 1\n- item 2\n  continuation\n- item 3";
        let items = parse_list_items(text);

        assert_eq!(items.len(), 3);
        assert_eq!(items[0], "- item 1");
        assert_eq!(items[1], "- item 2\n  continuation");
        assert_eq!(items[2], "- item 3");
    }

    #[test]
    fn test_extract_list_marker() {
        let (marker, rest) = extract_list_marker("- item text");
        assert_eq!(marker, "- ");
        assert_eq!(rest, "item text");

        let (marker, rest) = extract_list_marker("1. numbered item");
        assert_eq!(marker, "1. ");
        assert_eq!(rest, "numbered item");
    }
}
