//! Overlapping, boundary-aware text chunker.
//!
//! Splits a document's text into [`Chunk`]s of at most `max_chars` bytes,
//! each overlapping its predecessor by up to `overlap` bytes so that a
//! sentence straddling a boundary is retrievable from either side.
//!
//! # Algorithm
//!
//! 1. A text of at most `max_chars` bytes is a single chunk.
//! 2. Otherwise, take the window `[start, start + max_chars)` snapped back
//!    to a UTF-8 character boundary.
//! 3. Inside the second half of that window, break after the last
//!    paragraph break (`\n\n`), else the last sentence end or newline,
//!    else the last space. With none of those, hard-split at the window end.
//! 4. The next window starts `overlap` bytes before the previous end
//!    (snapped to a character boundary), but always strictly after the
//!    previous start.
//!
//! Offsets index into the original text, so every chunk's text is exactly
//! `&doc.text[start..end]` and the spans cover the document without gaps.
//!
//! # Example
//!
//! ```rust
//! use deepwiki_core::chunk::split_spans;
//!
//! let spans = split_spans("Hello world.\n\nSecond paragraph.", 700, 40).unwrap();
//! assert_eq!(spans, vec![(0, 31)]);
//! ```

use crate::error::{Error, Result};
use crate::models::{sha256_hex, short_id, Chunk, Document};

/// Approximate characters-per-token ratio used to turn the configured
/// token budgets into byte limits.
pub const CHARS_PER_TOKEN: usize = 4;

/// Convert a token budget into a byte budget.
pub fn tokens_to_chars(tokens: usize) -> usize {
    tokens * CHARS_PER_TOKEN
}

/// Compute chunk spans `[start, end)` over `text`.
///
/// Fails with `InvalidArgument` when `max_chars` is zero or
/// `overlap >= max_chars`.
pub fn split_spans(text: &str, max_chars: usize, overlap: usize) -> Result<Vec<(usize, usize)>> {
    if max_chars == 0 {
        return Err(Error::InvalidArgument("max chunk size must be positive".into()));
    }
    if overlap >= max_chars {
        return Err(Error::InvalidArgument(format!(
            "chunk overlap ({overlap}) must be smaller than the chunk size ({max_chars})"
        )));
    }

    let len = text.len();
    if len <= max_chars {
        return Ok(vec![(0, len)]);
    }

    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let mut hard_end = snap_to_char_boundary(text, start + max_chars);
        if hard_end <= start {
            // A single character wider than the budget.
            hard_end = next_char_boundary(text, start);
        }
        if hard_end >= len {
            spans.push((start, len));
            break;
        }

        let end = find_break(text, start, hard_end);
        spans.push((start, end));

        let mut next = snap_to_char_boundary(text, end.saturating_sub(overlap));
        if next <= start {
            next = end;
        }
        start = next;
    }

    Ok(spans)
}

/// Split a document into chunks with deterministic, content-derived ids.
pub fn chunk_document(doc: &Document, max_chars: usize, overlap: usize) -> Result<Vec<Chunk>> {
    let spans = split_spans(&doc.text, max_chars, overlap)?;
    let source_url = doc.url().map(str::to_string);

    Ok(spans
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| {
            let text = &doc.text[start..end];
            Chunk {
                id: short_id(&[
                    &doc.id,
                    &i.to_string(),
                    &start.to_string(),
                    &end.to_string(),
                ]),
                document_id: doc.id.clone(),
                path: doc.path.clone(),
                start,
                end,
                chunk_index: i as i64,
                text: text.to_string(),
                hash: sha256_hex(text.as_bytes()),
                source_url: source_url.clone(),
            }
        })
        .collect())
}

/// Pick the end of a chunk inside `[start, hard_end)`.
///
/// Separators are ASCII, so the byte after one is always a char boundary.
fn find_break(text: &str, start: usize, hard_end: usize) -> usize {
    let window = &text[start..hard_end];
    let bytes = window.as_bytes();
    let floor = window.len() / 2;

    if let Some(p) = window.rfind("\n\n") {
        if p + 2 > floor {
            return start + p + 2;
        }
    }

    for i in (0..bytes.len()).rev() {
        if i < floor {
            break;
        }
        match bytes[i] {
            b'\n' => return start + i + 1,
            b'.' | b'!' | b'?' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_whitespace() => {
                return start + i + 2;
            }
            _ => {}
        }
    }

    if let Some(p) = window.rfind(' ') {
        if p + 1 > floor {
            return start + p + 1;
        }
    }

    hard_end
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

fn next_char_boundary(s: &str, index: usize) -> usize {
    s[index..]
        .char_indices()
        .nth(1)
        .map(|(i, _)| index + i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::{Metadata, RepoRef};

    fn doc(text: &str) -> Document {
        let repo = RepoRef::parse("acme/widgets").unwrap();
        Document::new(
            &repo,
            "README.md",
            text.to_string(),
            Metadata::new("README.md").with("url", "https://example.test/README.md"),
            Utc::now(),
        )
    }

    fn assert_coverage(text: &str, spans: &[(usize, usize)], max: usize) {
        assert!(!spans.is_empty());
        assert_eq!(spans[0].0, 0);
        assert_eq!(spans.last().unwrap().1, text.len());
        for w in spans.windows(2) {
            let (prev, cur) = (w[0], w[1]);
            assert!(cur.0 > prev.0, "no progress: {prev:?} -> {cur:?}");
            assert!(cur.0 <= prev.1, "gap: {prev:?} -> {cur:?}");
        }
        for &(s, e) in spans {
            assert!(e - s <= max, "span {s}..{e} longer than {max}");
            assert!(text.is_char_boundary(s) && text.is_char_boundary(e));
        }
    }

    #[test]
    fn short_text_is_one_chunk() {
        let d = doc("Hello, world!");
        let chunks = chunk_document(&d, 100, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!((chunks[0].start, chunks[0].end), (0, 13));
    }

    #[test]
    fn empty_text_is_one_empty_chunk() {
        assert_eq!(split_spans("", 10, 2).unwrap(), vec![(0, 0)]);
    }

    #[test]
    fn rejects_overlap_not_smaller_than_size() {
        assert!(split_spans("abc", 10, 10).is_err());
        assert!(split_spans("abc", 10, 11).is_err());
        assert!(split_spans("abc", 0, 0).is_err());
    }

    #[test]
    fn spans_cover_text_without_gaps() {
        let text = (0..120)
            .map(|i| format!("Sentence number {i} talks about widgets."))
            .collect::<Vec<_>>()
            .join(" ");
        let spans = split_spans(&text, 200, 40).unwrap();
        assert!(spans.len() > 1);
        assert_coverage(&text, &spans, 200);
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let para = "word ".repeat(14);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let spans = split_spans(&text, 100, 10).unwrap();
        let first = &text[spans[0].0..spans[0].1];
        assert!(first.ends_with("\n\n"), "{first:?}");
        assert_coverage(&text, &spans, 100);
    }

    #[test]
    fn prefers_sentence_end_over_space() {
        let text = "The first sentence is right here. And the second one keeps going without any stop at all";
        let spans = split_spans(text, 60, 5).unwrap();
        assert_eq!(&text[spans[0].0..spans[0].1], "The first sentence is right here. ");
        assert_coverage(text, &spans, 60);
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘".repeat(5);
        let spans = split_spans(&text, 17, 4).unwrap();
        assert_coverage(&text, &spans, 17);
    }

    #[test]
    fn text_without_separators_hard_splits() {
        let text = "x".repeat(250);
        let spans = split_spans(&text, 100, 20).unwrap();
        assert_eq!(spans[0], (0, 100));
        assert_eq!(spans[1].0, 80);
        assert_coverage(&text, &spans, 100);
    }

    #[test]
    fn chunking_is_deterministic() {
        let text = "Alpha beta gamma. ".repeat(60);
        let d = doc(&text);
        let a = chunk_document(&d, 120, 30).unwrap();
        let b = chunk_document(&d, 120, 30).unwrap();
        assert_eq!(a, b);
        for (i, c) in a.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.text, &d.text[c.start..c.end]);
            assert_eq!(c.document_id, d.id);
            assert_eq!(c.source_url.as_deref(), Some("https://example.test/README.md"));
        }
    }
}
