// src/services/chunker.rs

//! Text cleaning and overlapping chunking.

use std::sync::LazyLock;

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

static WHITESPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());
static NOISE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^\w\s\.,!\?;:\-\(\)]").ok());

/// Drop symbols outside word characters and basic punctuation, then
/// collapse whitespace. Returns the trimmed input when cleaning leaves nothing.
pub fn clean_text(text: &str) -> String {
    let (Some(whitespace), Some(noise)) = (WHITESPACE.as_ref(), NOISE.as_ref()) else {
        return text.trim().to_string();
    };

    let stripped = noise.replace_all(text, "");
    let cleaned = whitespace.replace_all(&stripped, " ");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        text.trim().to_string()
    } else {
        cleaned.to_string()
    }
}

/// Splits text into chunks of at most `chunk_size` characters, each
/// starting with up to `overlap` characters from the end of the previous
/// one. Splits happen at whitespace; single words longer than a chunk are
/// cut at grapheme boundaries.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0;

        for word in self.pieces(text) {
            let word_len = word.chars().count();
            let added = if current.is_empty() { word_len } else { word_len + 1 };

            if current_len + added > self.chunk_size && !current.is_empty() {
                chunks.push(current.join(" "));

                // Carry the tail of the finished chunk into the next one.
                let mut carried = 0;
                let mut keep = current.len();
                while keep > 0 {
                    let len = current[keep - 1].chars().count();
                    let next = if carried == 0 { len } else { carried + len + 1 };
                    if next > self.overlap || next + word_len + 1 > self.chunk_size {
                        break;
                    }
                    carried = next;
                    keep -= 1;
                }
                current.drain(..keep);
                current_len = carried;
            }

            current_len += if current.is_empty() { word_len } else { word_len + 1 };
            current.push(word);
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }
        chunks
    }

    /// Whitespace-separated words, with oversized words cut to fit.
    fn pieces<'a>(&self, text: &'a str) -> Vec<&'a str> {
        let mut pieces = Vec::new();
        for word in text.split_whitespace() {
            if word.chars().count() <= self.chunk_size {
                pieces.push(word);
                continue;
            }

            let mut start = 0;
            let mut count = 0;
            for (offset, grapheme) in word.grapheme_indices(true) {
                let len = grapheme.chars().count();
                if count + len > self.chunk_size && count > 0 {
                    pieces.push(&word[start..offset]);
                    start = offset;
                    count = 0;
                }
                count += len;
            }
            if start < word.len() {
                pieces.push(&word[start..]);
            }
        }
        pieces
    }
}
