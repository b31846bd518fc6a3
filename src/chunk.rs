//! Content normalization and paragraph-boundary chunking.
//!
//! Document bodies are normalized before anything is hashed, so that
//! editor noise (CRLF line endings, trailing spaces, runs of blank lines)
//! never registers as a content change. The chunker then splits the
//! normalized text on paragraph boundaries (`\n\n`) into [`Chunk`]s that
//! respect a `max_tokens` budget.
//!
//! Every chunk records the byte [`Span`] it covers in the normalized
//! content. Its id is the owning document id plus the span's start
//! offset, and its hash is the SHA-256 of its text, which is what the
//! diff analyzer compares.
//!
//! # Example
//!
//! ```rust
//! use kb_sync::chunk::chunk_text;
//! use kb_sync::models::DocumentId;
//!
//! let doc = DocumentId::from("docs:intro.md");
//! let chunks = chunk_text(&doc, "Hello world.\n\nSecond paragraph.", 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id.as_str(), "docs:intro.md#0");
//! ```

use sha2::{Digest, Sha256};

use crate::models::{Chunk, ChunkId, DocumentId, Span};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// SHA-256 of `text` as lowercase hex.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize document content before hashing and chunking.
///
/// - `\r\n` and lone `\r` become `\n`.
/// - Within a line, whitespace runs collapse to one space and the line
///   is trimmed.
/// - Runs of blank lines collapse to one blank line; leading and
///   trailing blank lines are dropped.
///
/// After normalization paragraphs are separated by exactly `"\n\n"`.
pub fn normalize_content(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out = String::with_capacity(unified.len());
    let mut pending_blank = false;

    for line in unified.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            pending_blank = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
            if pending_blank {
                out.push('\n');
            }
        }
        pending_blank = false;
        out.push_str(&collapsed);
    }

    out
}

/// Hash of a document's normalized content.
pub fn content_hash(body: &str) -> String {
    hash_text(&normalize_content(body))
}

/// Split normalized content into chunks on paragraph boundaries.
///
/// `content` is expected to be the output of [`normalize_content`]; span
/// offsets refer to it.
///
/// # Guarantees
///
/// - At least one chunk is always returned (even for empty text).
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - `chunk.text == content[chunk.span.start..chunk.span.end]`.
/// - Same input, same chunks: ids, spans and hashes are deterministic.
pub fn chunk_text(document_id: &DocumentId, content: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    if content.trim().is_empty() {
        return vec![make_chunk(document_id, 0, content, Span { start: 0, end: 0 })];
    }

    let mut chunks = Vec::new();
    let mut current: Option<Span> = None;
    let mut chunk_index: i64 = 0;
    let mut pos = 0usize;

    for para in content.split("\n\n") {
        let para_start = pos;
        pos += para.len() + 2;

        let lead = para.len() - para.trim_start().len();
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        let span = Span {
            start: para_start + lead,
            end: para_start + lead + trimmed.len(),
        };

        let would_be = match current {
            Some(cur) => span.end - cur.start,
            None => trimmed.len(),
        };

        if would_be > max_chars {
            if let Some(cur) = current.take() {
                chunks.push(make_chunk(document_id, chunk_index, content, cur));
                chunk_index += 1;
            }
        }

        if trimmed.len() > max_chars {
            let mut offset = span.start;
            while offset < span.end {
                let remaining = &content[offset..span.end];
                let split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
                let split_at = if split_at == 0 {
                    remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len())
                } else {
                    split_at
                };
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|p| p + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };

                let piece = &remaining[..actual_split];
                let piece_lead = piece.len() - piece.trim_start().len();
                let piece_trimmed = piece.trim();
                if !piece_trimmed.is_empty() {
                    let start = offset + piece_lead;
                    let piece_span = Span {
                        start,
                        end: start + piece_trimmed.len(),
                    };
                    chunks.push(make_chunk(document_id, chunk_index, content, piece_span));
                    chunk_index += 1;
                }
                offset += actual_split;
            }
        } else {
            current = Some(match current {
                Some(cur) => Span {
                    start: cur.start,
                    end: span.end,
                },
                None => span,
            });
        }
    }

    if let Some(cur) = current {
        chunks.push(make_chunk(document_id, chunk_index, content, cur));
    }

    chunks
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn make_chunk(document_id: &DocumentId, index: i64, content: &str, span: Span) -> Chunk {
    let text = &content[span.start..span.end];
    Chunk {
        id: ChunkId::new(document_id, span.start),
        document_id: document_id.clone(),
        chunk_index: index,
        span,
        text: text.to_string(),
        hash: hash_text(text),
    }
}
