//! # Chunker
//!
//! Splits documents into overlapping, size-bounded windows of text.
//!
//! Lengths and offsets are measured in **characters** (Unicode scalar values), never
//! bytes, so multi-byte text is never cut inside a code point.
//!
//! ## Algorithm
//! Starting at offset `0`, each chunk takes at most `chunk_size` characters. If the
//! rest of the document does not fit, the chunker looks inside the window for the
//! separators in priority order (paragraph break, line break, sentence end, space)
//! and cuts just **after** the last occurrence of the first separator that still
//! leaves the window longer than the overlap. When no separator qualifies it cuts
//! hard at `chunk_size`. The next chunk starts `chunk_overlap` characters before the
//! previous chunk's end, so adjacent chunks share exactly `chunk_overlap` characters.
//!
//! Because every character lands in some chunk, dropping the first `chunk_overlap`
//! characters of every chunk but the first and concatenating reconstructs the
//! document exactly.
//!
//! ```rust
//! use awful_rag::chunker::{Chunker, Document};
//!
//! let doc = Document::new("one two three four five", "numbers.txt");
//! let chunker = Chunker::new(10, 2).unwrap();
//! let chunks = chunker.split(&doc);
//! assert_eq!(chunks[0].text, "one two ");
//! assert_eq!(chunks[1].range.start, 6);
//! ```

use std::ops::Range;

use tracing::info;

use crate::config::RagConfig;
use crate::error::{RagError, Result};

/// Separators tried in priority order before falling back to a hard cut.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

/// A loaded source document. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub text: String,
    /// Where the text came from, typically a file path.
    pub source_document: String,
}

impl Document {
    pub fn new(text: impl Into<String>, source_document: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_document: source_document.into(),
        }
    }
}

/// A contiguous slice of a [`Document`], borrowed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub text: &'a str,
    pub source_document: &'a str,
    /// Character offsets into the document text.
    pub range: Range<usize>,
}

impl Chunk<'_> {
    /// Length in characters.
    pub fn char_len(&self) -> usize {
        self.range.end - self.range.start
    }
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Chunker {
    /// Create a chunker with the default separators.
    ///
    /// # Errors
    /// [`RagError::Configuration`] if `chunk_size` is zero or `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::Configuration(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::Configuration(format!(
                "chunk_overlap ({chunk_overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.chunk_overlap)
    }

    /// Replace the separator priority list. Empty separators are ignored.
    pub fn with_separators<I, S>(mut self, separators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.separators = separators
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split one document into ordered, overlapping chunks.
    ///
    /// An empty document yields no chunks.
    pub fn split<'a>(&self, document: &'a Document) -> Vec<Chunk<'a>> {
        let text = document.text.as_str();

        // bounds[c] is the byte offset of character c; the final entry is text.len().
        let mut bounds: Vec<usize> = text.char_indices().map(|(b, _)| b).collect();
        let char_count = bounds.len();
        bounds.push(text.len());

        let mut chunks = Vec::new();
        let mut start = 0;
        while start < char_count {
            let end = if char_count - start <= self.chunk_size {
                char_count
            } else {
                self.find_cut(text, &bounds, start)
            };

            chunks.push(Chunk {
                text: &text[bounds[start]..bounds[end]],
                source_document: &document.source_document,
                range: start..end,
            });

            if end == char_count {
                break;
            }
            start = end - self.chunk_overlap;
        }
        chunks
    }

    /// Split a whole corpus, preserving document order.
    pub fn split_documents<'a>(&self, documents: &'a [Document]) -> Vec<Chunk<'a>> {
        let chunks: Vec<Chunk<'a>> = documents.iter().flat_map(|d| self.split(d)).collect();
        info!(
            "Split {} documents into {} chunks.",
            documents.len(),
            chunks.len()
        );
        chunks
    }

    /// Character offset at which the chunk starting at `start` ends.
    ///
    /// The result always lies in `start + chunk_overlap + 1 ..= start + chunk_size`,
    /// so the following chunk starts strictly after `start`.
    fn find_cut(&self, text: &str, bounds: &[usize], start: usize) -> usize {
        let limit = start + self.chunk_size;
        let min_end = start + self.chunk_overlap + 1;
        let window = &text[bounds[start]..bounds[limit]];

        for separator in &self.separators {
            if let Some(pos) = window.rfind(separator.as_str()) {
                let end_byte = bounds[start] + pos + separator.len();
                let end = bounds.partition_point(|&b| b < end_byte);
                if end >= min_end {
                    return end;
                }
            }
        }
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Rust is a systems language.\n\nIt has ownership, borrowing and lifetimes. \
        Zero-cost abstractions are a goal.\nCafé naïve résumé 日本語 ünïcödé text survives.\n\n\
        Last paragraph with several more words to force a few extra windows here.";

    fn reconstruct(chunks: &[Chunk<'_>], overlap: usize) -> String {
        let mut out = String::new();
        for (i, chunk) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(chunk.text);
            } else {
                out.extend(chunk.text.chars().skip(overlap));
            }
        }
        out
    }

    #[test]
    fn test_rejects_overlap_not_below_size() {
        assert!(matches!(Chunker::new(10, 10), Err(RagError::Configuration(_))));
        assert!(matches!(Chunker::new(10, 11), Err(RagError::Configuration(_))));
        assert!(matches!(Chunker::new(0, 0), Err(RagError::Configuration(_))));
        assert!(Chunker::new(10, 9).is_ok());
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        let doc = Document::new("", "empty.txt");
        let chunker = Chunker::new(10, 2).unwrap();
        assert!(chunker.split(&doc).is_empty());
    }

    #[test]
    fn test_short_document_is_single_chunk() {
        let doc = Document::new("short text", "a.txt");
        let chunks = Chunker::new(100, 10).unwrap().split(&doc);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short text");
        assert_eq!(chunks[0].range, 0..10);
        assert_eq!(chunks[0].source_document, "a.txt");
    }

    #[test]
    fn test_coverage_size_and_overlap_hold_across_parameters() {
        let doc = Document::new(SAMPLE, "sample.md");
        for size in [5, 8, 13, 20, 40, 64, 500] {
            for overlap in [0, 1, 3, size / 2, size - 1] {
                let chunker = Chunker::new(size, overlap).unwrap();
                let chunks = chunker.split(&doc);

                assert_eq!(
                    reconstruct(&chunks, overlap),
                    SAMPLE,
                    "size={size} overlap={overlap}"
                );

                for chunk in &chunks {
                    assert!(chunk.char_len() <= size);
                    assert_eq!(chunk.text.chars().count(), chunk.char_len());
                }

                for pair in chunks.windows(2) {
                    let (a, b) = (&pair[0], &pair[1]);
                    assert_eq!(a.range.end - b.range.start, overlap);
                    let suffix: String = a.text.chars().skip(a.char_len() - overlap).collect();
                    let prefix: String = b.text.chars().take(overlap).collect();
                    assert_eq!(suffix, prefix);
                }
            }
        }
    }

    #[test]
    fn test_hard_cut_without_separators() {
        let doc = Document::new("abcdefghij", "letters");
        let chunks = Chunker::new(4, 1).unwrap().split(&doc);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
    }

    #[test]
    fn test_prefers_paragraph_break_over_space() {
        let doc = Document::new("alpha beta\n\ngamma delta epsilon", "p.txt");
        let chunks = Chunker::new(20, 0).unwrap().split(&doc);
        assert_eq!(chunks[0].text, "alpha beta\n\n");
        assert_eq!(chunks[1].text, "gamma delta epsilon");
    }

    #[test]
    fn test_custom_separators() {
        let doc = Document::new("a;b;c;d;e;f", "semi");
        let chunks = Chunker::new(4, 0)
            .unwrap()
            .with_separators([";", ""])
            .split(&doc);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text).collect();
        assert_eq!(texts, vec!["a;b;", "c;d;", "e;f"]);
    }

    #[test]
    fn test_sentence_boundary_keeps_sentence_whole() {
        let doc = Document::new(
            "Sales grew 10% this quarter. Marketing spend increased.",
            "doc_a.txt",
        );
        let chunks = Chunker::new(40, 5).unwrap().split(&doc);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Sales grew 10% this quarter. ");
        assert!(chunks[1].text.contains("Marketing spend increased"));
    }

    #[test]
    fn test_split_documents_keeps_order() {
        let docs = vec![
            Document::new("first document text", "1"),
            Document::new("second", "2"),
        ];
        let chunks = Chunker::new(8, 2).unwrap().split_documents(&docs);
        assert_eq!(chunks.first().unwrap().source_document, "1");
        assert_eq!(chunks.last().unwrap().source_document, "2");
        assert_eq!(chunks.last().unwrap().text, "second");
    }
}
