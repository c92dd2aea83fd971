//! # MetadataStore
//!
//! The text and provenance of every indexed chunk, stored by record id.
//!
//! Record `i` here describes the same chunk as vector `i` in the
//! [`VectorIndex`](crate::vector_index::VectorIndex). The store is only appended to
//! through [`Snapshot::append`](crate::snapshot::Snapshot::append), which feeds both
//! sides from the same ordered batch.
//!
//! On disk the store is YAML (inside the checksummed snapshot envelope), with a
//! header describing the snapshot it belongs to:
//!
//! ```yaml
//! header:
//!   record_count: 2
//!   dimension: 384
//!   model_name: sentence-transformers/all-MiniLM-L6-v2
//!   metric: cosine
//!   strategy: exact
//!   created_at: 2026-01-01T00:00:00+00:00
//! vectors_digest: 5d41402abc4b2a76b9719d911017c592...
//! records:
//!   - text: "Sales grew 10% this quarter. "
//!     source_document: doc_a.txt
//!     offset_start: 0
//!     offset_end: 29
//! ```

use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::chunker::Chunk;
use crate::error::{RagError, Result};
use crate::snapshot::{SnapshotHeader, read_envelope, write_envelope};
use crate::vector_index::RecordId;

const METADATA_MAGIC: &[u8; 8] = b"ARAGMET1";

/// Text and provenance of one indexed chunk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub text: String,
    pub source_document: String,
    /// Character offsets of the chunk within its document.
    pub offset_start: usize,
    pub offset_end: usize,
}

impl ChunkRecord {
    pub fn from_chunk(chunk: &Chunk<'_>) -> Self {
        Self {
            text: chunk.text.to_string(),
            source_document: chunk.source_document.to_string(),
            offset_start: chunk.range.start,
            offset_end: chunk.range.end,
        }
    }

    pub fn offset(&self) -> Range<usize> {
        self.offset_start..self.offset_end
    }
}

#[derive(Serialize, Deserialize)]
struct MetadataPayload {
    header: SnapshotHeader,
    vectors_digest: String,
    records: Vec<ChunkRecord>,
}

#[derive(Debug, Default, Clone)]
pub struct MetadataStore {
    records: Vec<ChunkRecord>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append records, returning the contiguous id block they received.
    pub(crate) fn append(&mut self, records: Vec<ChunkRecord>) -> Range<RecordId> {
        let first = self.records.len();
        self.records.extend(records);
        first..self.records.len()
    }

    /// # Errors
    /// [`RagError::UnknownId`] if no record has this id.
    pub fn get(&self, id: RecordId) -> Result<&ChunkRecord> {
        self.records.get(id).ok_or(RagError::UnknownId(id))
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = (RecordId, &ChunkRecord)> {
        self.records.iter().enumerate()
    }

    /// Write the store with its snapshot header and the digest of the vector file
    /// it belongs to.
    pub(crate) fn save(
        &self,
        path: &Path,
        header: &SnapshotHeader,
        vectors_digest: &blake3::Hash,
    ) -> Result<blake3::Hash> {
        let payload = MetadataPayload {
            header: header.clone(),
            vectors_digest: vectors_digest.to_hex().to_string(),
            records: self.records.clone(),
        };
        let yaml = serde_yaml::to_string(&payload)?;
        write_envelope(path, METADATA_MAGIC, yaml.as_bytes())
    }

    /// Restore a store written by [`MetadataStore::save`].
    ///
    /// Returns the store, its header, and the hex digest of the vector file it was
    /// saved with.
    ///
    /// # Errors
    /// - [`RagError::SnapshotNotFound`] if `path` does not exist.
    /// - [`RagError::CorruptIndex`] if the file is unreadable or its record count
    ///   disagrees with its header.
    pub(crate) fn load(path: &Path) -> Result<(Self, SnapshotHeader, String)> {
        let (bytes, _) = read_envelope(path, METADATA_MAGIC)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| RagError::corrupt(path, format!("metadata is not UTF-8: {e}")))?;
        let payload: MetadataPayload = serde_yaml::from_str(text)
            .map_err(|e| RagError::corrupt(path, format!("undecodable metadata: {e}")))?;

        if payload.records.len() != payload.header.record_count {
            return Err(RagError::corrupt(
                path,
                format!(
                    "header declares {} records, found {}",
                    payload.header.record_count,
                    payload.records.len()
                ),
            ));
        }

        Ok((
            Self {
                records: payload.records,
            },
            payload.header,
            payload.vectors_digest,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Document;
    use crate::config::{IndexStrategy, SimilarityMetric};
    use std::fs;
    use tempfile::TempDir;

    fn record(text: &str, source: &str) -> ChunkRecord {
        ChunkRecord {
            text: text.to_string(),
            source_document: source.to_string(),
            offset_start: 0,
            offset_end: text.chars().count(),
        }
    }

    fn header(record_count: usize) -> SnapshotHeader {
        SnapshotHeader {
            record_count,
            dimension: 4,
            model_name: "hashing-4".into(),
            metric: SimilarityMetric::Cosine,
            strategy: IndexStrategy::Exact,
            created_at: "2026-01-01T00:00:00+00:00".into(),
        }
    }

    #[test]
    fn test_append_assigns_contiguous_ids() {
        let mut store = MetadataStore::new();
        assert_eq!(store.append(vec![record("a", "x"), record("b", "x")]), 0..2);
        assert_eq!(store.append(vec![record("c", "y")]), 2..3);
        assert_eq!(store.get(2).unwrap().text, "c");
        assert_eq!(store.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn test_get_unknown_id() {
        let store = MetadataStore::new();
        assert!(matches!(store.get(0), Err(RagError::UnknownId(0))));
    }

    #[test]
    fn test_from_chunk_keeps_provenance() {
        let doc = Document::new("héllo world", "greeting.txt");
        let chunk = Chunk {
            text: &doc.text[..],
            source_document: &doc.source_document,
            range: 0..11,
        };
        let rec = ChunkRecord::from_chunk(&chunk);
        assert_eq!(rec.source_document, "greeting.txt");
        assert_eq!(rec.offset(), 0..11);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.yaml");
        let mut store = MetadataStore::new();
        store.append(vec![record("Refunds: 30 days", "b.txt"), record("multi\nline", "c.md")]);

        let digest = blake3::hash(b"vectors");
        store.save(&path, &header(2), &digest).unwrap();

        let (loaded, loaded_header, vectors_digest) = MetadataStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get(1).unwrap().text, "multi\nline");
        assert_eq!(loaded_header.record_count, 2);
        assert_eq!(vectors_digest, digest.to_hex().to_string());
    }

    #[test]
    fn test_count_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.yaml");
        let mut store = MetadataStore::new();
        store.append(vec![record("only one", "a")]);
        store.save(&path, &header(3), &blake3::hash(b"v")).unwrap();

        assert!(matches!(
            MetadataStore::load(&path),
            Err(RagError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metadata.yaml");
        let mut store = MetadataStore::new();
        store.append(vec![record("some text", "a"), record("more text", "b")]);
        store.save(&path, &header(2), &blake3::hash(b"v")).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();
        assert!(matches!(
            MetadataStore::load(&path),
            Err(RagError::CorruptIndex { .. })
        ));
    }
}
