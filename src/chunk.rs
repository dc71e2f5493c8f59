//! Overlapping fixed-size token-window chunker.
//!
//! Splits normalized document text into windows of `size` tokens that
//! advance by `size - overlap` tokens, the final window truncated to the
//! remaining tokens.
//!
//! A token is a maximal run of non-whitespace characters together with the
//! whitespace that follows it; whitespace before the first token belongs to
//! the first token. Token spans therefore tile the text exactly, and removing
//! each window's overlap with its predecessor reconstructs the input
//! byte-for-byte (see [`reconstruct`]).
//!
//! Blank text (empty or whitespace only) has no tokens and is chunked as an
//! empty document: no windows, and reconstruction yields `""`.
//!
//! Each chunk receives a deterministic UUIDv5 derived from its document ID,
//! index, and a SHA-256 hash of its text, so re-chunking identical content
//! reproduces identical ids.

use crate::error::{Error, Result};
use crate::models::{chunk_id_for, sha256_hex, Chunk};

/// A window over the token stream of a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextWindow<'a> {
    pub text: &'a str,
    /// Token span `[start_token, end_token)`.
    pub start_token: usize,
    pub end_token: usize,
    /// Byte span `[start_byte, end_byte)` in the source text.
    pub start_byte: usize,
    pub end_byte: usize,
    /// Bytes shared with the previous window.
    pub overlap_bytes: usize,
}

/// Byte offsets at which each token starts.
fn token_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut prev_ws = true;
    for (i, c) in text.char_indices() {
        let ws = c.is_whitespace();
        if !ws && prev_ws {
            starts.push(i);
        }
        prev_ws = ws;
    }
    if let Some(first) = starts.first_mut() {
        *first = 0;
    }
    starts
}

/// Number of tokens in `text` under the chunker's tokenization.
pub fn count_tokens(text: &str) -> usize {
    token_starts(text).len()
}

/// Split `text` into overlapping token windows.
///
/// Fails with [`Error::InvalidConfig`] unless `0 < size` and
/// `overlap < size`. Text without any non-whitespace character yields no
/// windows.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Result<Vec<TextWindow<'_>>> {
    if size == 0 {
        return Err(Error::InvalidConfig("chunk size must be > 0".to_string()));
    }
    if overlap >= size {
        return Err(Error::InvalidConfig(format!(
            "chunk overlap ({}) must be smaller than chunk size ({})",
            overlap, size
        )));
    }

    let starts = token_starts(text);
    let n = starts.len();
    let stride = size - overlap;
    let byte_at = |token: usize| if token == n { text.len() } else { starts[token] };

    let mut windows: Vec<TextWindow<'_>> = Vec::new();
    let mut start = 0;
    while start < n {
        let end = (start + size).min(n);
        let start_byte = byte_at(start);
        let end_byte = byte_at(end);
        let overlap_bytes = windows
            .last()
            .map(|prev| prev.end_byte.saturating_sub(start_byte))
            .unwrap_or(0);
        windows.push(TextWindow {
            text: &text[start_byte..end_byte],
            start_token: start,
            end_token: end,
            start_byte,
            end_byte,
            overlap_bytes,
        });
        if end == n {
            break;
        }
        start += stride;
    }

    Ok(windows)
}

/// Rebuild the original text by dropping each window's overlap. Exact for
/// any text with at least one token; blank text reconstructs to `""`.
pub fn reconstruct(windows: &[TextWindow<'_>]) -> String {
    windows
        .iter()
        .map(|w| &w.text[w.overlap_bytes..])
        .collect()
}

/// Chunk a document's normalized text into [`Chunk`] records with
/// contiguous indices starting at 0.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>> {
    let windows = chunk(text, size, overlap)?;
    Ok(windows
        .into_iter()
        .enumerate()
        .map(|(index, w)| {
            let hash = sha256_hex(w.text.as_bytes());
            Chunk {
                id: chunk_id_for(document_id, index, &hash),
                document_id: document_id.to_string(),
                chunk_index: index,
                text: w.text.to_string(),
                start_token: w.start_token,
                end_token: w.end_token,
                start_byte: w.start_byte,
                end_byte: w.end_byte,
                overlap_bytes: w.overlap_bytes,
                hash,
            }
        })
        .collect())
}
