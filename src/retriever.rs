//! # Retriever
//!
//! The outward-facing retrieval API: build (or reuse) a snapshot from a corpus, then
//! answer "which stored chunks are most similar to this text?".
//!
//! A retriever moves through an explicit state machine:
//!
//! ```text
//!   Empty ──build──▶ Building ──ok──▶ Ready
//!     ▲                 │
//!     └──── retry ── Failed ◀──err──┘
//! ```
//!
//! Builds are only allowed from `Empty` or `Failed`; queries only in `Ready`.
//!
//! ## Quick example
//! ```rust
//! use awful_rag::chunker::Document;
//! use awful_rag::config::RagConfig;
//! use awful_rag::embedder::HashingEmbedder;
//! use awful_rag::retriever::Retriever;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::TempDir::new()?;
//! let mut config = RagConfig::new(dir.path());
//! config.chunk_size = 40;
//! config.chunk_overlap = 5;
//!
//! let mut retriever = Retriever::new(config, HashingEmbedder::new(384)?)?;
//! retriever.load_or_build(|| {
//!     Ok(vec![Document::new("Refunds must be processed within 30 days.", "policy.txt")])
//! })?;
//!
//! let hits = retriever.query("How long do refunds take?", 1)?;
//! assert_eq!(hits[0].source_document, "policy.txt");
//! # Ok(()) }
//! ```

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::Path;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::chunker::{Chunker, Document};
use crate::config::{BuildConflict, RagConfig};
use crate::embedder::Embedder;
use crate::error::{BuildStage, RagError, Result};
use crate::metadata_store::ChunkRecord;
use crate::snapshot::{Snapshot, SnapshotHeader, SnapshotLock};
use crate::vector_index::RecordId;

/// Externally visible lifecycle state of a [`Retriever`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Empty,
    Building,
    Ready,
    /// The last build failed in this stage.
    Failed(BuildStage),
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexState::Empty => f.write_str("empty"),
            IndexState::Building => f.write_str("building"),
            IndexState::Ready => f.write_str("ready"),
            IndexState::Failed(stage) => write!(f, "failed during {stage}"),
        }
    }
}

enum State {
    Empty,
    Building,
    Ready(Snapshot),
    Failed(BuildStage),
}

/// One query result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub id: RecordId,
    pub text: String,
    pub source_document: String,
    pub score: f32,
    /// Character offsets of the chunk within its document.
    pub offset: Range<usize>,
}

pub struct Retriever<E: Embedder> {
    config: RagConfig,
    chunker: Chunker,
    embedder: E,
    state: State,
}

impl<E: Embedder> Retriever<E> {
    /// # Errors
    /// [`RagError::Configuration`] if `config` fails validation.
    pub fn new(config: RagConfig, embedder: E) -> Result<Self> {
        config.validate()?;
        let chunker = Chunker::from_config(&config)?;
        Ok(Self {
            config,
            chunker,
            embedder,
            state: State::Empty,
        })
    }

    /// Replace the default chunker (e.g. to use custom separators).
    pub fn with_chunker(mut self, chunker: Chunker) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn state(&self) -> IndexState {
        match &self.state {
            State::Empty => IndexState::Empty,
            State::Building => IndexState::Building,
            State::Ready(_) => IndexState::Ready,
            State::Failed(stage) => IndexState::Failed(*stage),
        }
    }

    fn persist_path(&self) -> &Path {
        &self.config.persist_path
    }

    fn ensure_can_build(&self) -> Result<()> {
        match self.state {
            State::Empty | State::Failed(_) => Ok(()),
            _ => Err(RagError::InvalidState(format!(
                "cannot build while the index is {}",
                self.state()
            ))),
        }
    }

    /// Chunk, embed, index and persist `documents`, replacing any snapshot at
    /// `persist_path` once everything succeeded.
    ///
    /// On failure nothing is published, the previous snapshot (if any) is left as
    /// it was, the state becomes `Failed`, and the error names the failed stage.
    ///
    /// The build lock only excludes other builders. Readers of the previous
    /// snapshot wait, if at all, for the final renames.
    ///
    /// # Errors
    /// - [`RagError::InvalidState`] unless the state is `Empty` or `Failed`.
    /// - [`RagError::BuildInProgress`] if another process holds the build lock and
    ///   `build_conflict` is `fail`.
    /// - [`RagError::Build`] wrapping the cause of a failed stage.
    pub fn build_from_corpus(&mut self, documents: &[Document]) -> Result<()> {
        self.ensure_can_build()?;
        let _lock = self.acquire_build_lock()?;
        self.build_locked(documents)
    }

    /// Load the snapshot at `persist_path` if there is one, otherwise build it from
    /// the documents returned by `corpus`.
    ///
    /// The check-then-build runs under the build lock, so concurrent processes
    /// never build the same location twice: a process that waited for the lock
    /// reuses the winner's snapshot.
    ///
    /// # Errors
    /// - [`RagError::CorruptIndex`] if a snapshot exists but cannot be read. It
    ///   is never silently rebuilt.
    /// - [`RagError::Configuration`] if the snapshot was built with a different
    ///   model, dimension or metric.
    /// - Anything [`Retriever::build_from_corpus`] or `corpus` returns.
    pub fn load_or_build<F>(&mut self, corpus: F) -> Result<()>
    where
        F: FnOnce() -> Result<Vec<Document>>,
    {
        self.ensure_can_build()?;

        match self.load_snapshot() {
            Ok(snapshot) => return self.adopt(snapshot),
            Err(RagError::SnapshotNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let _lock = self.acquire_build_lock()?;
        match self.load_snapshot() {
            Ok(snapshot) => {
                info!("Snapshot appeared while waiting for the build lock; reusing it");
                return self.adopt(snapshot);
            }
            Err(RagError::SnapshotNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        info!(
            "No snapshot at {}; building from corpus",
            self.persist_path().display()
        );
        let documents = corpus()?;
        self.build_locked(&documents)
    }

    /// Load an existing snapshot without ever building.
    ///
    /// # Errors
    /// [`RagError::SnapshotNotFound`] if there is nothing to load, plus the
    /// errors of [`Retriever::load_or_build`].
    pub fn load(&mut self) -> Result<()> {
        self.ensure_can_build()?;
        let snapshot = self.load_snapshot()?;
        self.adopt(snapshot)
    }

    /// The `k` stored chunks most similar to `text`, best first.
    ///
    /// # Errors
    /// - [`RagError::InvalidArgument`] for blank `text` or `k == 0`.
    /// - [`RagError::InvalidState`] unless the index is `Ready`.
    /// - [`RagError::ModelUnavailable`] if the embedder fails.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedChunk>> {
        if text.trim().is_empty() {
            return Err(RagError::InvalidArgument("query text is empty".into()));
        }
        if k == 0 {
            return Err(RagError::InvalidArgument("k must be at least 1".into()));
        }
        let snapshot = self.snapshot()?;

        let query = self
            .embedder
            .embed(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| {
                RagError::ModelUnavailable("embedder returned no vector for the query".into())
            })?;

        let hits = snapshot.search(&query, k)?;
        info!("Query matched {} chunks", hits.len());
        Ok(hits
            .into_iter()
            .map(|(hit, record)| RetrievedChunk {
                id: hit.id,
                text: record.text.clone(),
                source_document: record.source_document.clone(),
                score: hit.score,
                offset: record.offset(),
            })
            .collect())
    }

    /// Header of the loaded snapshot.
    pub fn stats(&self) -> Result<SnapshotHeader> {
        Ok(self.snapshot()?.header())
    }

    fn snapshot(&self) -> Result<&Snapshot> {
        match &self.state {
            State::Ready(snapshot) => Ok(snapshot),
            _ => Err(RagError::InvalidState(format!(
                "query requires a ready index, but it is {}",
                self.state()
            ))),
        }
    }

    /// Read the snapshot, honoring `build_conflict` if a publish is in progress.
    fn load_snapshot(&self) -> Result<Snapshot> {
        match self.config.build_conflict {
            BuildConflict::Wait => Snapshot::load(self.persist_path()),
            BuildConflict::Fail => Snapshot::try_load(self.persist_path()),
        }
    }

    fn acquire_build_lock(&self) -> Result<SnapshotLock> {
        let dir = self.persist_path();
        fs::create_dir_all(dir)?;
        if let Some(lock) = SnapshotLock::try_build(dir)? {
            return Ok(lock);
        }
        match self.config.build_conflict {
            BuildConflict::Fail => Err(RagError::BuildInProgress(dir.to_path_buf())),
            BuildConflict::Wait => {
                warn!(
                    "Another build holds {}; waiting for it to finish",
                    dir.display()
                );
                SnapshotLock::build(dir)
            }
        }
    }

    fn adopt(&mut self, snapshot: Snapshot) -> Result<()> {
        let header = snapshot.header();
        if header.model_name != self.embedder.model_name() {
            return Err(RagError::Configuration(format!(
                "snapshot was built with model {:?}, but the active model is {:?}",
                header.model_name,
                self.embedder.model_name()
            )));
        }
        if header.dimension != self.embedder.dimension() {
            return Err(RagError::Configuration(format!(
                "snapshot dimension {} does not match the embedder's {}",
                header.dimension,
                self.embedder.dimension()
            )));
        }
        if header.metric != self.config.similarity_metric {
            return Err(RagError::Configuration(format!(
                "snapshot uses {} similarity, but the configuration asks for {}",
                header.metric, self.config.similarity_metric
            )));
        }
        if header.strategy != self.config.index_strategy {
            warn!(
                "Snapshot uses the {:?} strategy; configured {:?} is ignored until rebuild",
                header.strategy, self.config.index_strategy
            );
        }
        self.state = State::Ready(snapshot);
        Ok(())
    }

    fn build_locked(&mut self, documents: &[Document]) -> Result<()> {
        self.state = State::Building;
        match self.run_build(documents) {
            Ok(snapshot) => {
                self.state = State::Ready(snapshot);
                Ok(())
            }
            Err(e) => {
                let stage = e.stage().unwrap_or(BuildStage::Indexing);
                error!("Index build failed: {}", e);
                self.state = State::Failed(stage);
                Err(e)
            }
        }
    }

    fn run_build(&self, documents: &[Document]) -> Result<Snapshot> {
        if let Some(doc) = documents
            .iter()
            .find(|d| d.source_document.trim().is_empty())
        {
            return Err(RagError::InvalidArgument(format!(
                "document starting with {:?} has no source identifier",
                doc.text.chars().take(30).collect::<String>()
            ))
            .in_stage(BuildStage::Chunking));
        }
        let chunks = self.chunker.split_documents(documents);

        let texts: Vec<&str> = chunks.iter().map(|c| c.text).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .map_err(|e| e.in_stage(BuildStage::Embedding))?;
        if vectors.len() != texts.len() {
            return Err(RagError::ModelUnavailable(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            ))
            .in_stage(BuildStage::Embedding));
        }

        let records: Vec<ChunkRecord> = chunks.iter().map(ChunkRecord::from_chunk).collect();
        let mut snapshot = Snapshot::new(
            self.embedder.dimension(),
            self.config.similarity_metric,
            self.config.index_strategy,
            self.embedder.model_name(),
        )
        .map_err(|e| e.in_stage(BuildStage::Indexing))?;
        snapshot
            .append(vectors, records)
            .map_err(|e| e.in_stage(BuildStage::Indexing))?;

        snapshot
            .save_locked(self.persist_path())
            .map_err(|e| e.in_stage(BuildStage::Persisting))?;
        Ok(snapshot)
    }
}
