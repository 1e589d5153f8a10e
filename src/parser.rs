//! Content Parser Registry: dispatches the raw response body to a
//! parser keyed by normalized content-type, producing Markdown (or a
//! near-identity transform) plus whatever page metadata that parser can
//! recover.
//!
//! The default HTML parser runs a boilerplate-removal pass ahead of a
//! tag-by-tag HTML→Markdown conversion, and also extracts `title`,
//! `description`, `favicon`, and `language`. Steganographic
//! (zero-width, bidi-control) characters are stripped from the converted
//! output locally, rather than via an external text-sanitization crate.

use scraper::{ElementRef, Html, Node, Selector};
use url::Url;

use crate::types::{ErrorCode, WebFetchError};

/// Content < 50 non-whitespace scalar values after boilerplate removal is
/// considered empty and rejected rather than returned as a near-blank page.
pub(crate) const MIN_EXTRACTED_CHARS: usize = 50;

const BOILERPLATE_TOKENS: &[&str] = &[
    "nav",
    "navbar",
    "navigation",
    "header",
    "footer",
    "sidebar",
    "menu",
    "breadcrumb",
    "breadcrumbs",
    "advertisement",
    "ad",
    "ads",
    "social",
    "share",
    "sharing",
    "comment",
    "comments",
    "related",
    "recommended",
    "popular",
    "trending",
    "subscribe",
    "newsletter",
    "cookie",
    "cookies",
    "banner",
    "popup",
    "modal",
    "overlay",
];

/// Output of a parser: the body content plus whatever metadata it could
/// recover (HTML parsers recover all of it; other parsers leave most of
/// this `None`).
#[derive(Debug, Default)]
pub(crate) struct ParsedPage {
    pub content: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub favicon: Option<String>,
    pub language: Option<String>,
}

/// One content-type handler in the registry.
pub(crate) trait ContentParser: Send + Sync {
    fn parse(&self, body: &str, final_url: &Url) -> Result<ParsedPage, WebFetchError>;
}

/// Dispatches by normalized content-type (media type, parameters and case
/// stripped). Unregistered types pass through unchanged.
pub(crate) struct ParserRegistry {
    parsers: Vec<(&'static str, Box<dyn ContentParser>)>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        let parsers: Vec<(&'static str, Box<dyn ContentParser>)> = vec![
            ("text/html", Box::new(HtmlParser)),
            ("application/xhtml+xml", Box::new(HtmlParser)),
            ("text/plain", Box::new(PlainTextParser)),
            ("application/json", Box::new(JsonParser)),
            ("application/xml", Box::new(XmlParser)),
            ("text/xml", Box::new(XmlParser)),
        ];
        Self { parsers }
    }

    pub fn has_parser(&self, content_type: &str) -> bool {
        let normalized = normalize_content_type(content_type);
        self.parsers.iter().any(|(ct, _)| *ct == normalized)
    }

    pub fn parse(&self, content_type: Option<&str>, body: &str, final_url: &Url) -> Result<ParsedPage, WebFetchError> {
        let normalized = content_type.map_or_else(|| "text/html".to_string(), normalize_content_type);
        for (ct, parser) in &self.parsers {
            if *ct == normalized {
                return parser.parse(body, final_url);
            }
        }
        Ok(ParsedPage {
            content: body.to_string(),
            ..ParsedPage::default()
        })
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

struct PlainTextParser;

impl ContentParser for PlainTextParser {
    fn parse(&self, body: &str, _final_url: &Url) -> Result<ParsedPage, WebFetchError> {
        Ok(ParsedPage {
            content: strip_steganographic_chars(body).into_owned(),
            ..ParsedPage::default()
        })
    }
}

struct JsonParser;

impl ContentParser for JsonParser {
    fn parse(&self, body: &str, _final_url: &Url) -> Result<ParsedPage, WebFetchError> {
        let content = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string()),
            Err(_) => body.to_string(),
        };
        Ok(ParsedPage {
            content,
            ..ParsedPage::default()
        })
    }
}

struct XmlParser;

impl ContentParser for XmlParser {
    fn parse(&self, body: &str, _final_url: &Url) -> Result<ParsedPage, WebFetchError> {
        Ok(ParsedPage {
            content: strip_steganographic_chars(body).into_owned(),
            ..ParsedPage::default()
        })
    }
}

/// HTML → Markdown: boilerplate removal, main-content-root fallback
/// cascade, deterministic tag-by-tag conversion, title/language/
/// description/favicon extraction.
struct HtmlParser;

impl ContentParser for HtmlParser {
    fn parse(&self, body: &str, final_url: &Url) -> Result<ParsedPage, WebFetchError> {
        let html = strip_bom_and_whitespace(body);
        let document = Html::parse_document(html);

        let title = extract_title(&document);
        let language = extract_language(&document);
        let description = extract_description(&document);
        let favicon = extract_favicon(&document, final_url);

        let base_url = extract_base_url(&document, final_url).unwrap_or_else(|| final_url.clone());
        let root = find_content_root(&document);

        let markdown = match root {
            Some(element) => {
                let mut ctx = ConversionContext::new(base_url);
                let mut raw = String::new();
                convert_children(&mut raw, element, &mut ctx);
                let normalized = normalize_whitespace_final(&raw);
                strip_steganographic_chars(&normalized).into_owned()
            }
            None => {
                return Err(WebFetchError::new(
                    ErrorCode::ExtractionFailed,
                    "no extractable content found",
                    false,
                ));
            }
        };

        let char_count = markdown.chars().filter(|c| !c.is_whitespace()).count();
        if char_count < MIN_EXTRACTED_CHARS {
            return Err(WebFetchError::new(
                ErrorCode::ExtractionFailed,
                format!(
                    "extracted content too short ({char_count} non-whitespace chars, minimum {MIN_EXTRACTED_CHARS})"
                ),
                false,
            ));
        }

        Ok(ParsedPage {
            content: markdown,
            title,
            description,
            favicon,
            language,
        })
    }
}

struct ConversionContext {
    base_url: Url,
    list_depth: usize,
    in_preformatted: bool,
}

impl ConversionContext {
    fn new(base_url: Url) -> Self {
        Self {
            base_url,
            list_depth: 0,
            in_preformatted: false,
        }
    }

    fn resolve_url(&self, href: &str) -> String {
        self.base_url
            .join(href)
            .map_or_else(|_| href.to_string(), |u| u.to_string())
    }

    fn resolve_http_url(&self, href: &str) -> Option<String> {
        let resolved = self.resolve_url(href.trim());
        let parsed = Url::parse(&resolved).ok()?;
        is_allowed_web_scheme(parsed.scheme()).then_some(parsed.to_string())
    }

    fn list_indent(&self) -> String {
        "  ".repeat(self.list_depth.saturating_sub(1))
    }
}

fn strip_bom_and_whitespace(html: &str) -> &str {
    html.strip_prefix('\u{FEFF}').unwrap_or(html).trim_start()
}

fn extract_title(document: &Html) -> Option<String> {
    if let Ok(selector) = Selector::parse("title") {
        if let Some(title) = document.select(&selector).next() {
            let text = collapse_whitespace(&title.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    if let Ok(selector) = Selector::parse("h1") {
        if let Some(h1) = document.select(&selector).next() {
            let text = collapse_whitespace(&h1.text().collect::<String>());
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

fn extract_language(document: &Html) -> Option<String> {
    let selector = Selector::parse("html").ok()?;
    document
        .select(&selector)
        .next()?
        .value()
        .attr("lang")
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// `<meta name="description">`, falling back to `<meta property="og:description">`.
fn extract_description(document: &Html) -> Option<String> {
    for selector_str in ["meta[name=\"description\" i]", "meta[property=\"og:description\" i]"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(meta) = document.select(&selector).next() {
                let content = meta.value().attr("content").map(str::trim).filter(|s| !s.is_empty());
                if let Some(content) = content {
                    return Some(content.to_string());
                }
            }
        }
    }
    None
}

/// `<link rel="icon">` (or `shortcut icon`/`apple-touch-icon`), resolved
/// against `final_url`. Absent entirely if no such link exists; this parser
/// does not guess a conventional `/favicon.ico` fallback.
fn extract_favicon(document: &Html, final_url: &Url) -> Option<String> {
    let selector = Selector::parse("link[rel]").ok()?;
    for link in document.select(&selector) {
        let rel = link.value().attr("rel").unwrap_or("").to_ascii_lowercase();
        let is_icon = rel
            .split_whitespace()
            .any(|token| matches!(token, "icon" | "shortcut" | "apple-touch-icon"));
        if !is_icon {
            continue;
        }
        if let Some(href) = link.value().attr("href").filter(|h| !h.is_empty()) {
            if let Ok(resolved) = final_url.join(href) {
                if is_allowed_web_scheme(resolved.scheme()) {
                    return Some(resolved.to_string());
                }
            }
        }
    }
    None
}

fn extract_base_url(document: &Html, final_url: &Url) -> Option<Url> {
    let selector = Selector::parse("base[href]").ok()?;
    let base_elem = document.select(&selector).next()?;
    let href = base_elem.value().attr("href")?;
    let base = final_url.join(href).ok().or_else(|| Url::parse(href).ok())?;
    is_allowed_web_scheme(base.scheme()).then_some(base)
}

fn find_content_root(document: &Html) -> Option<ElementRef<'_>> {
    let selectors = ["main", "article", "[role=\"main\"]", "#content", ".content", "body"];

    let mut best: Option<(usize, ElementRef<'_>)> = None;

    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            for element in document.select(&selector) {
                let len = non_boilerplate_text_len(element);
                if len >= MIN_EXTRACTED_CHARS {
                    return Some(element);
                }
                if len > 0 && best.as_ref().is_none_or(|(best_len, _)| len > *best_len) {
                    best = Some((len, element));
                }
            }
        }
    }

    best.map(|(_, element)| element)
}

fn non_boilerplate_text_len(element: ElementRef<'_>) -> usize {
    if is_boilerplate_element(element) {
        return 0;
    }
    let mut count = 0;
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                count += text.chars().filter(|c| !c.is_whitespace()).count();
            }
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    count += non_boilerplate_text_len(el);
                }
            }
            _ => {}
        }
    }
    count
}

fn is_boilerplate_element(element: ElementRef<'_>) -> bool {
    let tag = element.value().name();
    if matches!(
        tag,
        "script" | "style" | "noscript" | "nav" | "footer" | "header" | "aside" | "form"
    ) {
        return true;
    }
    if element.value().attr("aria-hidden") == Some("true") {
        return true;
    }
    if element.value().attr("hidden").is_some() {
        return true;
    }
    if element.value().attr("role") == Some("navigation") {
        return true;
    }
    if let Some(class) = element.value().attr("class") {
        if has_boilerplate_token(class) {
            return true;
        }
    }
    if let Some(id) = element.value().attr("id") {
        if has_boilerplate_token(id) {
            return true;
        }
    }
    false
}

fn has_boilerplate_token(attr: &str) -> bool {
    let lower = attr.to_lowercase();
    lower.split_whitespace().any(|token| BOILERPLATE_TOKENS.contains(&token))
}

fn convert_children(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    for child in element.children() {
        match child.value() {
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    convert_element(output, el, ctx);
                }
            }
            Node::Text(text) => {
                if ctx.in_preformatted {
                    output.push_str(text);
                } else {
                    let collapsed = collapse_inline_whitespace(text);
                    if !collapsed.is_empty() {
                        output.push_str(&collapsed);
                    }
                }
            }
            _ => {}
        }
    }
}

fn convert_element(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    if is_boilerplate_element(element) {
        return;
    }

    let tag = element.value().name();

    match tag {
        "h1" => convert_heading(output, element, ctx, 1),
        "h2" => convert_heading(output, element, ctx, 2),
        "h3" => convert_heading(output, element, ctx, 3),
        "h4" => convert_heading(output, element, ctx, 4),
        "h5" => convert_heading(output, element, ctx, 5),
        "h6" => convert_heading(output, element, ctx, 6),

        "p" => convert_paragraph(output, element, ctx),
        "blockquote" => convert_blockquote(output, element, ctx),
        "div" | "section" | "article" | "main" => {
            convert_children(output, element, ctx);
            ensure_blank_line(output);
        }

        "ul" => convert_unordered_list(output, element, ctx),
        "ol" => convert_ordered_list(output, element, ctx),

        "pre" => convert_pre(output, element, ctx),
        "code" => {
            if ctx.in_preformatted {
                output.push_str(&element.text().collect::<String>());
            } else {
                output.push('`');
                output.push_str(&element.text().collect::<String>());
                output.push('`');
            }
        }

        "a" => convert_link(output, element, ctx),
        "img" => convert_image(output, element, ctx),

        "table" => convert_table(output, element, ctx),

        "strong" | "b" => {
            output.push_str("**");
            convert_children(output, element, ctx);
            output.push_str("**");
        }
        "em" | "i" => {
            output.push('*');
            convert_children(output, element, ctx);
            output.push('*');
        }
        "del" | "s" | "strike" => {
            output.push_str("~~");
            convert_children(output, element, ctx);
            output.push_str("~~");
        }

        "br" => output.push('\n'),
        "hr" => {
            ensure_blank_line(output);
            output.push_str("---\n\n");
        }

        "dl" => convert_definition_list(output, element, ctx),
        "figure" => convert_figure(output, element, ctx),

        "script" | "style" | "noscript" | "nav" | "footer" | "header" | "aside" | "form" | "input" | "button"
        | "select" | "textarea" | "iframe" | "object" | "embed" | "canvas" | "svg" | "video" | "audio"
        | "source" | "track" | "map" | "area" => {}

        _ => convert_children(output, element, ctx),
    }
}

fn convert_heading(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext, level: usize) {
    ensure_blank_line(output);
    for _ in 0..level {
        output.push('#');
    }
    output.push(' ');

    let mut heading_text = String::new();
    convert_children(&mut heading_text, element, ctx);
    output.push_str(collapse_whitespace(&heading_text).trim());
    output.push_str("\n\n");
}

fn convert_paragraph(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    ensure_blank_line(output);
    convert_children(output, element, ctx);
    output.push_str("\n\n");
}

fn convert_blockquote(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    ensure_blank_line(output);
    let mut content = String::new();
    convert_children(&mut content, element, ctx);
    for line in content.lines() {
        output.push_str("> ");
        output.push_str(line);
        output.push('\n');
    }
    output.push('\n');
}

fn convert_unordered_list(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    if ctx.list_depth == 0 {
        ensure_blank_line(output);
    }
    ctx.list_depth += 1;
    let indent = ctx.list_indent();
    for child in element.children() {
        if let Some(li) = ElementRef::wrap(child) {
            if li.value().name() == "li" {
                output.push_str(&indent);
                output.push_str("- ");
                convert_list_item_content(output, li, ctx);
            }
        }
    }
    ctx.list_depth -= 1;
    if ctx.list_depth == 0 {
        output.push('\n');
    }
}

fn convert_ordered_list(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    if ctx.list_depth == 0 {
        ensure_blank_line(output);
    }
    ctx.list_depth += 1;
    let indent = ctx.list_indent();
    let start: usize = element.value().attr("start").and_then(|s| s.parse().ok()).unwrap_or(1);
    let mut i = start;
    for child in element.children() {
        if let Some(li) = ElementRef::wrap(child) {
            if li.value().name() == "li" {
                output.push_str(&indent);
                output.push_str(&format!("{i}. "));
                convert_list_item_content(output, li, ctx);
                i += 1;
            }
        }
    }
    ctx.list_depth -= 1;
    if ctx.list_depth == 0 {
        output.push('\n');
    }
}

fn convert_list_item_content(output: &mut String, li: ElementRef<'_>, ctx: &mut ConversionContext) {
    let has_nested_list = li
        .children()
        .any(|c| ElementRef::wrap(c).is_some_and(|e| matches!(e.value().name(), "ul" | "ol")));

    if has_nested_list {
        let mut first_text = true;
        for child in li.children() {
            if let Some(el) = ElementRef::wrap(child) {
                let tag = el.value().name();
                if tag == "ul" || tag == "ol" {
                    if first_text {
                        output.push('\n');
                        first_text = false;
                    }
                    convert_element(output, el, ctx);
                } else {
                    let mut text = String::new();
                    convert_element(&mut text, el, ctx);
                    if first_text && !text.trim().is_empty() {
                        output.push_str(text.trim());
                        first_text = false;
                    }
                }
            } else if let Some(text) = child.value().as_text() {
                let trimmed = collapse_inline_whitespace(text);
                if first_text && !trimmed.is_empty() {
                    output.push_str(&trimmed);
                    first_text = false;
                }
            }
        }
        if first_text {
            output.push('\n');
        }
    } else {
        let mut content = String::new();
        convert_children(&mut content, li, ctx);
        output.push_str(collapse_whitespace(&content).trim());
        output.push('\n');
    }
}

fn convert_pre(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    ensure_blank_line(output);

    let mut language = String::new();
    for child in element.children() {
        if let Some(code_el) = ElementRef::wrap(child) {
            if code_el.value().name() == "code" {
                if let Some(class) = code_el.value().attr("class") {
                    for cls in class.split_whitespace() {
                        if let Some(lang) = cls.strip_prefix("language-") {
                            language = lang.to_string();
                            break;
                        }
                        if let Some(lang) = cls.strip_prefix("lang-") {
                            language = lang.to_string();
                            break;
                        }
                    }
                }
            }
        }
    }

    output.push_str("```");
    output.push_str(&language);
    output.push('\n');

    let was_preformatted = ctx.in_preformatted;
    ctx.in_preformatted = true;

    let code_text: String = element.text().collect();
    let trimmed = code_text
        .strip_prefix('\n')
        .unwrap_or(&code_text)
        .strip_suffix('\n')
        .unwrap_or(&code_text);
    output.push_str(trimmed);

    ctx.in_preformatted = was_preformatted;

    if !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str("```\n\n");
}

fn convert_link(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    let href = element.value().attr("href").unwrap_or("");

    if href.is_empty() {
        convert_children(output, element, ctx);
        return;
    }

    let Some(resolved_href) = ctx.resolve_http_url(href) else {
        convert_children(output, element, ctx);
        return;
    };

    let mut text = String::new();
    convert_children(&mut text, element, ctx);
    let text = collapse_whitespace(&text);

    if text.is_empty() {
        output.push_str(&resolved_href);
    } else {
        output.push('[');
        output.push_str(&text);
        output.push_str("](");
        output.push_str(&resolved_href);
        output.push(')');
    }
}

fn convert_image(output: &mut String, element: ElementRef<'_>, ctx: &ConversionContext) {
    let src = element.value().attr("src").unwrap_or("");
    if src.is_empty() {
        return;
    }
    let alt = element.value().attr("alt").unwrap_or("");
    let Some(resolved_src) = ctx.resolve_http_url(src) else {
        return;
    };
    if !alt.is_empty() {
        output.push_str("![");
        output.push_str(alt);
        output.push_str("](");
        output.push_str(&resolved_src);
        output.push(')');
    }
}

fn convert_table(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    ensure_blank_line(output);

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut header_row_count = 0;

    if let Ok(thead_sel) = Selector::parse("thead") {
        for thead in element.select(&thead_sel) {
            if let Ok(tr_sel) = Selector::parse("tr") {
                for tr in thead.select(&tr_sel) {
                    rows.push(collect_table_cells(tr, ctx));
                    header_row_count += 1;
                }
            }
        }
    }

    if let Ok(tbody_sel) = Selector::parse("tbody") {
        for tbody in element.select(&tbody_sel) {
            if let Ok(tr_sel) = Selector::parse("tr") {
                for tr in tbody.select(&tr_sel) {
                    rows.push(collect_table_cells(tr, ctx));
                }
            }
        }
    }

    if rows.is_empty() {
        if let Ok(tr_sel) = Selector::parse("tr") {
            for tr in element.select(&tr_sel) {
                rows.push(collect_table_cells(tr, ctx));
            }
        }
        if !rows.is_empty() {
            header_row_count = 1;
        }
    }

    if rows.is_empty() {
        return;
    }

    let col_count = rows.iter().map(std::vec::Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return;
    }

    for row in &mut rows {
        while row.len() < col_count {
            row.push(String::new());
        }
    }

    let col_widths: Vec<usize> = (0..col_count)
        .map(|col| {
            rows.iter()
                .map(|row| row.get(col).map_or(0, std::string::String::len))
                .max()
                .unwrap_or(3)
                .max(3)
        })
        .collect();

    if header_row_count > 0 {
        for row in rows.iter().take(header_row_count) {
            output.push('|');
            for (i, cell) in row.iter().enumerate() {
                output.push(' ');
                output.push_str(cell);
                for _ in cell.len()..col_widths[i] {
                    output.push(' ');
                }
                output.push_str(" |");
            }
            output.push('\n');
        }

        output.push('|');
        for width in &col_widths {
            output.push(' ');
            for _ in 0..*width {
                output.push('-');
            }
            output.push_str(" |");
        }
        output.push('\n');
    }

    for row in rows.iter().skip(header_row_count) {
        output.push('|');
        for (i, cell) in row.iter().enumerate() {
            output.push(' ');
            output.push_str(cell);
            for _ in cell.len()..col_widths[i] {
                output.push(' ');
            }
            output.push_str(" |");
        }
        output.push('\n');
    }

    output.push('\n');
}

fn collect_table_cells(tr: ElementRef<'_>, ctx: &mut ConversionContext) -> Vec<String> {
    let mut cells = Vec::new();
    for child in tr.children() {
        if let Some(cell_el) = ElementRef::wrap(child) {
            let tag = cell_el.value().name();
            if tag == "td" || tag == "th" {
                let mut cell_text = String::new();
                convert_children(&mut cell_text, cell_el, ctx);
                let escaped = collapse_whitespace(&cell_text).trim().replace('|', "\\|");
                cells.push(escaped);
            }
        }
    }
    cells
}

fn convert_definition_list(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    ensure_blank_line(output);
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            match el.value().name() {
                "dt" => {
                    let mut term = String::new();
                    convert_children(&mut term, el, ctx);
                    output.push_str("**");
                    output.push_str(collapse_whitespace(&term).trim());
                    output.push_str("**\n");
                }
                "dd" => {
                    let mut def = String::new();
                    convert_children(&mut def, el, ctx);
                    output.push_str(": ");
                    output.push_str(collapse_whitespace(&def).trim());
                    output.push_str("\n\n");
                }
                _ => {}
            }
        }
    }
}

fn convert_figure(output: &mut String, element: ElementRef<'_>, ctx: &mut ConversionContext) {
    ensure_blank_line(output);

    if let Ok(img_sel) = Selector::parse("img") {
        for img in element.select(&img_sel) {
            convert_image(output, img, ctx);
            output.push('\n');
        }
    }

    if let Ok(caption_sel) = Selector::parse("figcaption") {
        for caption in element.select(&caption_sel) {
            let mut text = String::new();
            convert_children(&mut text, caption, ctx);
            let text = collapse_whitespace(&text);
            if !text.is_empty() {
                output.push('*');
                output.push_str(text.trim());
                output.push_str("*\n");
            }
        }
    }

    output.push('\n');
}

fn ensure_blank_line(output: &mut String) {
    if output.is_empty() {
        return;
    }
    let trailing_newlines = output.chars().rev().take_while(|&c| c == '\n').count();
    if trailing_newlines == 0 {
        output.push_str("\n\n");
    } else if trailing_newlines == 1 {
        output.push('\n');
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse_inline_whitespace(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let has_leading = s.chars().next().is_some_and(char::is_whitespace);
    let has_trailing = s.chars().last().is_some_and(char::is_whitespace);
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.is_empty() {
        if has_leading || has_trailing {
            return " ".to_string();
        }
        return String::new();
    }

    let mut result = String::new();
    if has_leading {
        result.push(' ');
    }
    result.push_str(&collapsed);
    if has_trailing && !has_leading {
        result.push(' ');
    } else if has_trailing && has_leading && collapsed.len() > 1 {
        result.push(' ');
    }
    result
}

/// CRLF→LF, collapse >2 consecutive blank lines to 2, trim trailing
/// whitespace per line, single final newline.
fn normalize_whitespace_final(s: &str) -> String {
    let s = s.replace("\r\n", "\n");

    let mut lines: Vec<&str> = Vec::new();
    let mut blank_count = 0;

    for line in s.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_count += 1;
            if blank_count <= 2 {
                lines.push("");
            }
        } else {
            blank_count = 0;
            lines.push(trimmed);
        }
    }

    while lines.last() == Some(&"") {
        lines.pop();
    }

    let mut result = lines.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    result
}

fn is_allowed_web_scheme(scheme: &str) -> bool {
    scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
}

/// Strip invisible/steganographic Unicode codepoints (zero-width spacing
/// and joining characters, bidi control overrides, variation selectors,
/// deprecated formatting marks, and Unicode "tag" characters used for
/// ASCII-smuggling) before content reaches downstream LLM consumers.
fn strip_steganographic_chars(s: &str) -> std::borrow::Cow<'_, str> {
    fn is_steganographic(c: char) -> bool {
        matches!(c,
            '\u{200B}'..='\u{200F}'   // zero-width space/joiners, LRM/RLM
            | '\u{202A}'..='\u{202E}' // bidi embedding/override
            | '\u{2060}'..='\u{2069}' // word joiner, invisible operators, isolates
            | '\u{FEFF}'              // BOM/zero-width no-break space (mid-text)
            | '\u{FE00}'..='\u{FE0F}' // variation selectors
            | '\u{180E}'              // Mongolian vowel separator
            | '\u{00AD}'              // soft hyphen
        ) || ('\u{E0000}'..='\u{E007F}').contains(&c) // Unicode tag characters
    }

    if !s.chars().any(is_steganographic) {
        return std::borrow::Cow::Borrowed(s);
    }
    std::borrow::Cow::Owned(s.chars().filter(|c| !is_steganographic(*c)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_falls_back_when_main_is_boilerplate_heavy() {
        let nav = "nav ".repeat(MIN_EXTRACTED_CHARS);
        let article = "real content ".repeat(MIN_EXTRACTED_CHARS);
        let html = format!(
            r"
            <html>
              <body>
                <main>
                  <nav>{nav}</nav>
                  <p>tiny</p>
                </main>
                <article><p>{article}</p></article>
              </body>
            </html>
            "
        );

        let final_url = Url::parse("https://example.com/").unwrap();
        let parsed = HtmlParser.parse(&html, &final_url).expect("parse should succeed via <article>");

        assert!(parsed.content.contains("real content"));
        assert!(!parsed.content.contains("tiny"));
        assert!(!parsed.content.contains("nav"));
    }

    #[test]
    fn extracts_description_and_favicon() {
        let html = concat!(
            "<html><head>",
            "<title>T</title>",
            "<meta name=\"description\" content=\"a nice page\">",
            "<link rel=\"icon\" href=\"/favicon.png\">",
            "</head><body><main><p>",
        )
        .to_string()
            + &"content ".repeat(MIN_EXTRACTED_CHARS)
            + "</p></main></body></html>";

        let final_url = Url::parse("https://example.com/dir/").unwrap();
        let parsed = HtmlParser.parse(&html, &final_url).unwrap();
        assert_eq!(parsed.description.as_deref(), Some("a nice page"));
        assert_eq!(parsed.favicon.as_deref(), Some("https://example.com/favicon.png"));
    }

    #[test]
    fn test_boilerplate_token_matching() {
        assert!(has_boilerplate_token("nav sidebar"));
        assert!(has_boilerplate_token("footer"));
        assert!(has_boilerplate_token("HEADER"));
        assert!(!has_boilerplate_token("navigation-link"));
        assert!(!has_boilerplate_token("navigate"));
        assert!(!has_boilerplate_token("advertising"));
    }

    #[test]
    fn test_normalize_whitespace_final() {
        assert_eq!(normalize_whitespace_final("a\r\nb"), "a\nb\n");
        assert_eq!(normalize_whitespace_final("a\n\n\n\nb"), "a\n\n\nb\n");
        assert_eq!(normalize_whitespace_final("hello   \nworld  "), "hello\nworld\n");
        assert_eq!(normalize_whitespace_final("hello\n\n\n"), "hello\n");
    }

    #[test]
    fn strips_zero_width_and_tag_chars() {
        let dirty = "safe\u{200B}word\u{E0041}\u{E0042}";
        let cleaned = strip_steganographic_chars(dirty);
        assert_eq!(cleaned, "safeword");
    }

    #[test]
    fn mixed_case_javascript_links_are_not_emitted() {
        let html = r#"
            <html>
              <body>
                <main>
                  <p>
                    <a href="JaVaScRiPt:alert(1)">Click me</a>
                    This filler text ensures extraction clears the minimum character threshold.
                  </p>
                </main>
              </body>
            </html>
        "#;
        let final_url = Url::parse("https://example.com/").unwrap();
        let parsed = HtmlParser.parse(html, &final_url).expect("parse");
        assert!(parsed.content.contains("Click me"));
        assert!(!parsed.content.contains("javascript:"));
        assert!(!parsed.content.contains("]("));
    }

    #[test]
    fn json_parser_pretty_prints() {
        let parsed = JsonParser.parse("{\"a\":1}", &Url::parse("https://example.com/").unwrap()).unwrap();
        assert!(parsed.content.contains('\n'));
    }

    #[test]
    fn registry_dispatches_by_normalized_content_type() {
        let registry = ParserRegistry::new();
        assert!(registry.has_parser("text/html; charset=utf-8"));
        assert!(registry.has_parser("APPLICATION/JSON"));
        assert!(!registry.has_parser("image/png"));
    }
}
