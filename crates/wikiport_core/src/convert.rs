use std::collections::{HashMap, HashSet};

use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("invalid block selector: {0}")]
    Selector(String),
    #[error("document has no parsable content")]
    EmptyDocument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub level: u8,
    pub title: String,
    pub anchor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub markdown_body: String,
    pub toc: Vec<TocEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    Heading { level: u8, text: String },
    Body(String),
}

pub struct MarkupConverter {
    blocks: Selector,
    list_items: Selector,
}

impl MarkupConverter {
    pub fn new() -> Result<Self, ConversionError> {
        Ok(Self {
            blocks: parse_selector("h1, h2, h3, h4, h5, h6, p, ul, ol")?,
            list_items: parse_selector("li")?,
        })
    }

    /// Convert rendered wiki HTML into Markdown plus a table of contents.
    /// Malformed markup is handled by best-effort tree construction; only a
    /// document with no content at all is rejected.
    pub fn convert(&self, html: &str) -> Result<ConversionResult, ConversionError> {
        if html.trim().is_empty() {
            return Err(ConversionError::EmptyDocument);
        }
        let document = Html::parse_document(html);
        let (blocks, toc) = self.collect_blocks(&document);
        let blocks = dedup_blocks(blocks);
        Ok(ConversionResult {
            markdown_body: render_document(&toc, &blocks),
            toc,
        })
    }

    fn collect_blocks(&self, document: &Html) -> (Vec<Block>, Vec<TocEntry>) {
        let mut blocks = Vec::new();
        let mut toc = Vec::new();
        for element in document.select(&self.blocks) {
            let name = element.value().name();
            match name {
                "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                    let level = name.as_bytes()[1] - b'0';
                    let text = collapse_whitespace(&text_without_noise(element));
                    if text.is_empty() {
                        continue;
                    }
                    toc.push(TocEntry {
                        level,
                        anchor: heading_anchor(&text),
                        title: text.clone(),
                    });
                    blocks.push(Block::Heading { level, text });
                }
                "p" => push_body(&mut blocks, inline_text(element)),
                "ul" => {
                    if !self.is_native_toc(element) {
                        push_body(&mut blocks, self.render_list(element, false));
                    }
                }
                "ol" => push_body(&mut blocks, self.render_list(element, true)),
                _ => push_body(&mut blocks, text_without_noise(element)),
            }
        }
        (blocks, toc)
    }

    fn render_list(&self, element: ElementRef, numbered: bool) -> String {
        let mut out = String::new();
        let mut position = 0usize;
        for child in element.children() {
            let Some(item) = ElementRef::wrap(child) else {
                continue;
            };
            if item.value().name() != "li" {
                continue;
            }
            position += 1;
            let body = inline_text(item);
            if numbered {
                out.push_str(&format!("{position}. {}\n", body.trim()));
            } else {
                out.push_str(&format!("* {}\n", body.trim()));
            }
        }
        out
    }

    fn is_native_toc(&self, element: ElementRef) -> bool {
        element.select(&self.list_items).any(|item| {
            text_without_noise(item)
                .to_lowercase()
                .contains("contents")
        })
    }
}

fn parse_selector(source: &str) -> Result<Selector, ConversionError> {
    Selector::parse(source).map_err(|err| ConversionError::Selector(err.to_string()))
}

fn push_body(blocks: &mut Vec<Block>, body: String) {
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        blocks.push(Block::Body(trimmed.to_string()));
    }
}

fn text_without_noise(element: ElementRef) -> String {
    let mut out = String::new();
    collect_text(element, &mut out);
    out
}

fn collect_text(element: ElementRef, out: &mut String) {
    if is_edit_section(element) {
        return;
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        } else if let Some(nested) = ElementRef::wrap(child) {
            collect_text(nested, out);
        }
    }
}

fn is_edit_section(element: ElementRef) -> bool {
    element.value().name() == "span"
        && element.value().classes().any(|class| class == "mw-editsection")
}

fn inline_text(element: ElementRef) -> String {
    let mut out = String::new();
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(nested) = ElementRef::wrap(child) else {
            continue;
        };
        match nested.value().name() {
            "a" => {
                let text = text_without_noise(nested);
                match nested.value().attr("href") {
                    Some(href) if is_absolute_url(href) => {
                        out.push_str(&format!("[{text}]({href})"));
                    }
                    _ => out.push_str(&text),
                }
            }
            "img" => {
                let alt = nested.value().attr("alt").unwrap_or_default();
                let src = nested.value().attr("src").unwrap_or_default();
                out.push_str(&format!("![{alt}]({src})"));
            }
            _ => out.push_str(&text_without_noise(nested)),
        }
    }
    out
}

fn is_absolute_url(href: &str) -> bool {
    href.starts_with("http://") || href.starts_with("https://")
}

/// Anchor slug for a heading: lowercased, runs of non-alphanumeric
/// characters collapsed to one dash, no leading or trailing dash. Two
/// headings may produce the same slug; collisions are left as-is.
pub fn heading_anchor(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Drop repeated blocks, scoped to the heading section they appear under.
/// Blocks ahead of the first heading form their own section. A heading that
/// repeats with identical text continues its earlier section instead of
/// opening a second one, which collapses transcluded duplicate sections.
fn dedup_blocks(blocks: Vec<Block>) -> Vec<Block> {
    let mut seen: HashMap<Option<String>, HashSet<String>> = HashMap::new();
    let mut current: Option<String> = None;
    let mut out = Vec::new();
    for block in blocks {
        match block {
            Block::Heading { level, text } => {
                let key = format!("{level}:{text}");
                if seen.contains_key(&Some(key.clone())) {
                    current = Some(key);
                } else {
                    seen.insert(Some(key.clone()), HashSet::new());
                    current = Some(key);
                    out.push(Block::Heading { level, text });
                }
            }
            Block::Body(body) => {
                let section = seen.entry(current.clone()).or_default();
                if section.insert(body.clone()) {
                    out.push(Block::Body(body));
                }
            }
        }
    }
    out
}

fn render_document(toc: &[TocEntry], blocks: &[Block]) -> String {
    let mut out = String::from("## Table of Contents\n\n");
    for entry in toc {
        if entry.title.eq_ignore_ascii_case("contents") {
            continue;
        }
        let indent = "  ".repeat(usize::from(entry.level.saturating_sub(1)));
        out.push_str(&format!("{indent}- [{}](#{})\n", entry.title, entry.anchor));
    }
    out.push('\n');
    for block in blocks {
        match block {
            Block::Heading { level, text } => {
                out.push_str(&format!("{} {text}\n\n", "#".repeat(usize::from(*level))));
            }
            Block::Body(body) => {
                out.push_str(body);
                out.push_str("\n\n");
            }
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Body substituted for a page whose source content is missing or empty.
pub fn placeholder_body(title: &str) -> String {
    format!("# {title}\n\n_No content was available for this page in the source wiki._\n")
}
