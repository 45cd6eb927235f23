//! Fixed-size sliding-window text chunker.
//!
//! Splits extracted document text into overlapping character windows for
//! retrieval-context construction. The window starts at 0 and each step
//! takes the slice `[i - overlap, i + chunk_size)`, advancing `i` by
//! `chunk_size - overlap`. Splits are character-based and can land mid-word.
//!
//! `chunk_size > overlap` is a hard correctness constraint: the loop does
//! not advance otherwise. It is validated here as well as at config load.
//!
//! Each chunk carries a fresh UUID plus a SHA-256 hash of its text for
//! staleness detection.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Chunk;

/// Split `text` into overlapping windows of `chunk_size` chars.
///
/// Every character of the input appears in at least one chunk, and the
/// output is deterministic for identical inputs (ignoring chunk ids).
/// Windows are measured in `char`s, so multi-byte UTF-8 never splits.
/// Empty input yields no chunks.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        bail!("chunk_size must be > 0");
    }
    if overlap >= chunk_size {
        bail!(
            "overlap ({}) must be smaller than chunk_size ({})",
            overlap,
            chunk_size
        );
    }

    // Byte offset of each char, so windows slice on char boundaries.
    let offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let n = offsets.len();
    let byte_at = |char_idx: usize| -> usize {
        if char_idx >= n {
            text.len()
        } else {
            offsets[char_idx]
        }
    };

    let step = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut i = 0usize;
    let mut index: i64 = 0;

    while i < n {
        let lo = i.saturating_sub(overlap);
        let hi = (i + chunk_size).min(n);
        let piece = &text[byte_at(lo)..byte_at(hi)];
        chunks.push(make_chunk(document_id, index, lo as i64, piece));
        index += 1;
        i += step;
    }

    Ok(chunks)
}

fn make_chunk(document_id: &str, index: i64, start_offset: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        page_number: 1,
        start_offset,
        text: text.to_string(),
        hash,
    }
}

/// Assign 1-based page numbers to chunks from per-page char offsets.
///
/// `page_starts[k]` is the char offset where page `k + 1` begins in the
/// assembled text. A chunk belongs to the page containing its start offset.
pub fn assign_pages(chunks: &mut [Chunk], page_starts: &[usize]) {
    for chunk in chunks.iter_mut() {
        let start = chunk.start_offset as usize;
        let page = page_starts.partition_point(|&p| p <= start);
        chunk.page_number = page.max(1) as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 1500, 200).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let chunks = chunk_text("doc1", "", 1500, 200).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn rejects_overlap_at_or_above_chunk_size() {
        assert!(chunk_text("doc1", "abc", 10, 10).is_err());
        assert!(chunk_text("doc1", "abc", 10, 20).is_err());
        assert!(chunk_text("doc1", "abc", 0, 0).is_err());
    }

    #[test]
    fn every_char_is_covered() {
        // Coverage property: the union of [start, start+len) ranges over all
        // chunks must include every char index of the input.
        let text: String = (0..997).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        for (size, overlap) in [(100, 20), (64, 1), (250, 249), (1500, 200)] {
            let chunks = chunk_text("doc1", &text, size, overlap).unwrap();
            let mut covered = vec![false; text.len()];
            for c in &chunks {
                let start = c.start_offset as usize;
                for b in covered.iter_mut().skip(start).take(c.text.chars().count()) {
                    *b = true;
                }
            }
            assert!(
                covered.iter().all(|&b| b),
                "gap with size={} overlap={}",
                size,
                overlap
            );
        }
    }

    #[test]
    fn adjacent_chunks_overlap() {
        let text: String = std::iter::repeat('x').take(500).collect();
        let chunks = chunk_text("doc1", &text, 100, 30).unwrap();
        assert!(chunks.len() > 2);
        for pair in chunks.windows(2) {
            let prev_end = pair[0].start_offset + pair[0].text.chars().count() as i64;
            // No gap, and a real overlap region between neighbors.
            assert!(pair[1].start_offset < prev_end);
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
    }

    #[test]
    fn deterministic_sequence() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let a = chunk_text("doc1", &text, 120, 25).unwrap();
        let b = chunk_text("doc1", &text, 120, 25).unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
            assert_eq!(x.chunk_index, y.chunk_index);
            assert_eq!(x.start_offset, y.start_offset);
        }
    }

    #[test]
    fn multibyte_text_never_splits_codepoints() {
        let text = "héllo wörld — ünïcode ".repeat(50);
        let chunks = chunk_text("doc1", &text, 40, 10).unwrap();
        // Slicing mid-codepoint would have panicked above; also verify that
        // dropping each chunk's overlap with its predecessor reassembles the
        // exact input.
        let mut rebuilt = String::new();
        let mut prev_end: i64 = 0;
        for c in &chunks {
            let skip = (prev_end - c.start_offset).max(0) as usize;
            rebuilt.extend(c.text.chars().skip(skip));
            prev_end = c.start_offset + c.text.chars().count() as i64;
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn page_assignment_uses_start_offset() {
        let text: String = std::iter::repeat('a').take(300).collect();
        let mut chunks = chunk_text("doc1", &text, 100, 0).unwrap();
        // Pages begin at chars 0, 100, 200.
        assign_pages(&mut chunks, &[0, 100, 200]);
        let pages: Vec<i64> = chunks.iter().map(|c| c.page_number).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }
}
