//! # Awful RAG (library root)
//!
//! This crate provides the retrieval half of a retrieval-augmented generation
//! pipeline, for the **arag** CLI and for embedding in other programs:
//! - Splitting documents into overlapping chunks (`chunker`, `corpus`).
//! - Turning text into fixed-length vectors (`embedder`).
//! - Similarity search over those vectors (`vector_index`) and the text behind them
//!   (`metadata_store`).
//! - Durable, lock-guarded snapshots of both on disk (`snapshot`).
//! - The build/load/query lifecycle tying it together (`retriever`).
//!
//! ## Layout on disk
//! A snapshot lives in the configured `persist_path`:
//!
//! ```text
//! persist_path/
//! ├── metadata.yaml         # chunk text and provenance; names its vector file
//! ├── vectors-<blake3>.bin  # bincode vectors (+ HNSW graph), checksummed
//! ├── .build.lock           # held by the active builder
//! └── .publish.lock         # readers shared, publisher exclusive
//! ```
//!
//! The CLI keeps its `config.yaml` under the per-platform configuration directory
//! ([`config_dir`]), e.g.:
//!
//! - macOS: `~/Library/Application Support/com.awful-sec.arag`
//! - Linux (XDG): `~/.config/arag`
//! - Windows: `C:\Users\<you>\AppData\Roaming\awful-sec\arag\config`
//!
//! ## Modules
//! - [`chunker`], [`commands`], [`config`], [`corpus`], [`embedder`], [`error`],
//!   [`metadata_store`], [`retriever`], [`snapshot`], [`vector_index`]

use directories::ProjectDirs;
use std::path::PathBuf;

pub mod chunker;
pub mod commands;
pub mod config;
pub mod corpus;
pub mod embedder;
pub mod error;
pub mod metadata_store;
pub mod retriever;
pub mod snapshot;
pub mod vector_index;

pub use chunker::{Chunk, Chunker, Document};
pub use config::RagConfig;
pub use embedder::{Embedder, HashingEmbedder, SentenceEmbeddingsModel};
pub use error::{RagError, Result};
pub use retriever::{IndexState, RetrievedChunk, Retriever};

/// Return the per-platform configuration directory used by arag.
///
/// This uses [`directories::ProjectDirs`] with the application triple
/// `("com", "awful-sec", "arag")`. The directory is **not** created here.
///
/// # Errors
/// Returns [`RagError::Configuration`] if the platform configuration directory
/// cannot be determined (no home directory, heavily sandboxed environments).
///
/// # Examples
/// ```rust
/// let cfg = awful_rag::config_dir().expect("has a config dir");
/// println!("config at {}", cfg.display());
/// ```
pub fn config_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("com", "awful-sec", "arag").ok_or_else(|| {
        RagError::Configuration("unable to determine config directory".into())
    })?;
    Ok(proj_dirs.config_dir().to_path_buf())
}

/// `config_dir()/config.yaml`, the file `arag init` writes.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.yaml"))
}
