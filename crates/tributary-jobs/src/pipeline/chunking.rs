//! Text preparation for the RAG stage: markup stripping and chunking.

use once_cell::sync::Lazy;
use regex::Regex;

use tributary_core::defaults;

/// Chunking limits, in bytes of UTF-8 text.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Maximum size of a chunk.
    pub max_chunk_size: usize,
    /// Bytes repeated at the start of the next window when a paragraph has
    /// to be split.
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: defaults::CHUNK_SIZE,
            overlap: defaults::CHUNK_OVERLAP,
        }
    }
}

fn floor_char_boundary(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_char_boundary(text: &str, mut pos: usize) -> usize {
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

/// Fixed-size windows with overlap over a single oversized paragraph.
fn window(text: &str, config: &ChunkerConfig, out: &mut Vec<String>) {
    let step = config
        .max_chunk_size
        .saturating_sub(config.overlap)
        .max(1);
    let mut start = 0;
    while start < text.len() {
        let mut end = floor_char_boundary(text, (start + config.max_chunk_size).min(text.len()));
        if end <= start {
            end = ceil_char_boundary(text, start + 1);
        }
        let piece = text[start..end].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        if end >= text.len() {
            break;
        }
        start = ceil_char_boundary(text, start + step);
    }
}

/// Split `text` into chunks of at most `max_chunk_size` bytes.
///
/// Paragraphs (blank-line separated) are packed greedily; a paragraph that
/// alone exceeds the limit is cut into overlapping windows.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<String> {
    let max = config.max_chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() && current.len() + 2 + paragraph.len() > max {
            chunks.push(std::mem::take(&mut current));
        }
        if paragraph.len() > max {
            window(paragraph, config, &mut chunks);
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

static BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|blockquote|pre|tr|table|section|article)\b[^>]*>")
        .unwrap()
});

static ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static SCRIPT_BLOCKS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap());

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n(\s*\n)*").unwrap());

/// Reduce HTML to plain text, keeping block boundaries as blank lines.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT_BLOCKS.replace_all(html, "");
    let text = BLOCK_TAGS.replace_all(&text, "\n\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    BLANK_RUNS
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}
