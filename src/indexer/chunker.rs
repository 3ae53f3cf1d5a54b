use serde::{Deserialize, Serialize};

use super::extractor::PageText;

/// A bounded span of page text. `start`/`end` are char offsets into the
/// trimmed page text, kept so neighbouring chunks can be checked for overlap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    /// 0-based page the chunk was cut from.
    pub page: usize,
    pub chunk_index: usize,
    pub start: usize,
    pub end: usize,
}

/// Chunk every page independently so each chunk keeps its source page.
/// `chunk_index` runs across the whole document.
pub fn chunk_pages(pages: &[PageText], max_chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for page in pages {
        for mut chunk in chunk_text(&page.text, max_chunk_size, overlap) {
            chunk.page = page.page;
            chunk.chunk_index = chunks.len();
            chunks.push(chunk);
        }
    }
    chunks
}

/// Split `text` into windows of at most `max_chunk_size` chars, each sharing
/// `overlap` chars with its predecessor.
pub fn chunk_text(text: &str, max_chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    debug_assert!(overlap < max_chunk_size);
    let text = text.trim();
    if text.is_empty() || max_chunk_size == 0 {
        return Vec::new();
    }

    // byte offset of every char, plus the end of the text
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = offsets.len() - 1;

    if char_len <= max_chunk_size {
        return vec![Chunk {
            text: text.to_string(),
            page: 0,
            chunk_index: 0,
            start: 0,
            end: char_len,
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    let mut prev_end = 0;

    while start < char_len {
        let end = (start + max_chunk_size).min(char_len);
        let actual_end = if end < char_len {
            find_break_point(text, &offsets, start, end, overlap, prev_end)
        } else {
            end
        };

        let chunk_text = text[offsets[start]..offsets[actual_end]].trim();
        if !chunk_text.is_empty() {
            chunks.push(Chunk {
                text: chunk_text.to_string(),
                page: 0,
                chunk_index: chunks.len(),
                start,
                end: actual_end,
            });
        }

        if actual_end >= char_len {
            break;
        }

        let next_start = actual_end.saturating_sub(overlap);
        prev_end = actual_end;
        start = if next_start <= start { actual_end } else { next_start };
    }

    chunks
}

/// Prefer paragraph, line, sentence, then word breaks. A break is only taken
/// when the chunk stays longer than the overlap and ends past `prev_end`.
fn find_break_point(
    text: &str,
    offsets: &[usize],
    start: usize,
    max_end: usize,
    overlap: usize,
    prev_end: usize,
) -> usize {
    let segment = &text[offsets[start]..offsets[max_end]];
    let min_len = overlap + 1;

    for sentinel in ["\n\n", "\n", "。", "？", "！", ". ", "? ", "! ", " "] {
        if let Some(pos) = segment.rfind(sentinel) {
            let len = segment[..pos + sentinel.len()].chars().count();
            if len >= min_len && start + len > prev_end {
                return start + len;
            }
        }
    }
    max_end
}
