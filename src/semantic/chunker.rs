//! Content chunking for embedding generation.
//!
//! Splits a text unit into ordered, contiguous, non-overlapping byte ranges:
//! 1. Lines are grouped into paragraph blocks (a block ends after blank lines)
//! 2. Blocks are packed into a chunk while it stays under the soft max
//! 3. Blocks over the soft max are split at line boundaries
//! 4. A single line over the hard max becomes its own chunk, and the text
//!    sent to the embedder is cut at the hard max (`truncated`)

use sha2::{Digest, Sha256};

use crate::config::ChunkPolicy;

/// Lines kept in a chunk snippet
const SNIPPET_LINES: usize = 3;
/// Characters kept per snippet line
const SNIPPET_LINE_CHARS: usize = 120;

/// One chunk of a unit, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSpan {
    pub start: usize,
    pub end: usize,
    /// Text handed to the embedder
    pub text: String,
    /// SHA-256 of the full span content
    pub content_hash: String,
    pub truncated: bool,
}

impl ChunkSpan {
    pub fn snippet(&self) -> String {
        snippet(&self.text)
    }
}

/// Split `content` into chunks under `policy`.
///
/// Always returns at least one chunk; empty content yields a single empty one.
pub fn chunk_unit(content: &str, policy: &ChunkPolicy) -> Vec<ChunkSpan> {
    if content.is_empty() {
        return vec![make_span(content, 0, 0, policy)];
    }

    let soft_max = policy.soft_max_bytes.max(1);

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (block_start, block_end) in paragraph_blocks(content) {
        let block_len = block_end - block_start;

        if block_len > soft_max {
            if let Some(range) = current.take() {
                ranges.push(range);
            }
            split_block(content, block_start, block_end, soft_max, &mut ranges);
            continue;
        }

        current = match current {
            Some((start, end)) if end - start + block_len > soft_max => {
                ranges.push((start, end));
                Some((block_start, block_end))
            }
            Some((start, _)) => Some((start, block_end)),
            None => Some((block_start, block_end)),
        };
    }

    if let Some(range) = current.take() {
        ranges.push(range);
    }

    ranges
        .into_iter()
        .map(|(start, end)| make_span(content, start, end, policy))
        .collect()
}

/// Split an oversized block at line boundaries.
fn split_block(
    content: &str,
    block_start: usize,
    block_end: usize,
    soft_max: usize,
    ranges: &mut Vec<(usize, usize)>,
) {
    let mut current: Option<(usize, usize)> = None;

    for (line_start, line_end) in lines(content, block_start, block_end) {
        let line_len = line_end - line_start;

        if line_len > soft_max {
            if let Some(range) = current.take() {
                ranges.push(range);
            }
            // a line is atomic; anything past the hard max is cut from the
            // embedded text only
            ranges.push((line_start, line_end));
            continue;
        }

        current = match current {
            Some((start, end)) if end - start + line_len > soft_max => {
                ranges.push((start, end));
                Some((line_start, line_end))
            }
            Some((start, _)) => Some((start, line_end)),
            None => Some((line_start, line_end)),
        };
    }

    if let Some(range) = current.take() {
        ranges.push(range);
    }
}

fn make_span(content: &str, start: usize, end: usize, policy: &ChunkPolicy) -> ChunkSpan {
    let full = &content[start..end];
    let hard_max = policy.hard_max_bytes.max(policy.soft_max_bytes.max(1));
    let truncated = full.len() > hard_max;
    let text = if truncated {
        truncate_at_char_boundary(full, hard_max).to_string()
    } else {
        full.to_string()
    };

    ChunkSpan {
        start,
        end,
        text,
        content_hash: content_hash(full),
        truncated,
    }
}

/// Byte ranges of the lines in `content[start..end]`, terminators included.
fn lines(content: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut result = Vec::new();
    let mut offset = start;
    for line in content[start..end].split_inclusive('\n') {
        result.push((offset, offset + line.len()));
        offset += line.len();
    }
    result
}

/// Byte ranges of paragraph blocks. Blank lines stay with the block before
/// them, so every block boundary sits right before a non-blank line.
fn paragraph_blocks(content: &str) -> Vec<(usize, usize)> {
    let mut blocks = Vec::new();
    let mut block_start = 0usize;
    let mut seen_blank = false;

    for (line_start, line_end) in lines(content, 0, content.len()) {
        let is_blank = content[line_start..line_end].trim().is_empty();
        if is_blank {
            seen_blank = true;
        } else if seen_blank {
            if line_start > block_start {
                blocks.push((block_start, line_start));
            }
            block_start = line_start;
            seen_blank = false;
        }
    }

    if block_start < content.len() {
        blocks.push((block_start, content.len()));
    }

    blocks
}

/// Cut `text` to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_at_char_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

/// First few lines of a chunk, for display.
pub fn snippet(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .take(SNIPPET_LINES)
        .map(|line| {
            let line = line.trim_end();
            if line.chars().count() > SNIPPET_LINE_CHARS {
                let cut: String = line.chars().take(SNIPPET_LINE_CHARS).collect();
                format!("{cut}...")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// SHA-256 hex digest used for chunk and unit change detection.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex(&hasher.finalize())
}

/// Stable chunk id: changes whenever the unit, the range, the content or the
/// model changes.
pub fn chunk_id(unit_id: &str, start: usize, end: usize, content_hash: &str, model_id: &str) -> u64 {
    let start = (start as u64).to_le_bytes();
    let end = (end as u64).to_le_bytes();
    let parts: [&[u8]; 5] = [
        unit_id.as_bytes(),
        &start,
        &end,
        content_hash.as_bytes(),
        model_id.as_bytes(),
    ];

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
