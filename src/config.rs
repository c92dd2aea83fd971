//! This module provides functionality for loading and validating the retrieval configuration.
//!
//! It defines the `RagConfig` struct, which enumerates every recognized option, and a
//! `load_config` function to load the configuration from a YAML file.
//!
//! # Examples
//!
//! Loading the configuration from a file:
//!
//! ```no_run
//! use awful_rag::config::{RagConfig, load_config};
//!
//! let config_file_path = "/path/to/config.yaml";
//! let config: RagConfig = load_config(config_file_path).unwrap();
//! config.validate().unwrap();
//! println!("{:?}", config);
//! ```

use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::PathBuf};

use tracing::*;

use crate::error::{RagError, Result};

/// How similarity between a query and a stored vector is scored.
///
/// The metric is recorded in every snapshot and is fixed for its lifetime.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    /// Vectors are L2-normalized on insertion; score is the inner product.
    #[default]
    Cosine,
    /// Raw inner product of the vectors as given.
    Dot,
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimilarityMetric::Cosine => f.write_str("cosine"),
            SimilarityMetric::Dot => f.write_str("dot"),
        }
    }
}

/// Search structure used by the vector index.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndexStrategy {
    /// Brute-force scoring of every stored vector.
    #[default]
    Exact,
    /// HNSW candidate generation followed by exact re-scoring.
    Hnsw,
}

/// Which embedding implementation to load.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// BERT sentence-transformer run through Candle.
    #[default]
    Candle,
    /// Deterministic feature-hashing embedder (offline, no model files).
    Hashing,
}

/// What a build does when another process already holds the build lock.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildConflict {
    /// Block until the other build finishes, then use its snapshot.
    #[default]
    Wait,
    /// Fail immediately with `BuildInProgress`.
    Fail,
}

/// Represents the retrieval configuration.
///
/// Only `persist_path` is required in the YAML file; every other field has a default.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RagConfig {
    /// Maximum chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared between consecutive chunks of one document.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Embedding model identifier (a Hugging Face repo for the Candle backend).
    #[serde(default = "default_model_name")]
    pub model_name: String,

    /// Directory holding the vector and metadata files.
    pub persist_path: PathBuf,

    #[serde(default)]
    pub similarity_metric: SimilarityMetric,

    // Default number of results returned by a query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default)]
    pub embedding_backend: EmbeddingBackend,

    // Texts sent to the model per forward pass.
    #[serde(default = "default_batch_size")]
    pub embedding_batch_size: usize,

    #[serde(default)]
    pub index_strategy: IndexStrategy,

    #[serde(default)]
    pub build_conflict: BuildConflict,

    // Show an embedding progress bar on stderr.
    #[serde(default)]
    pub show_progress: bool,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_model_name() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}

fn default_top_k() -> usize {
    5
}

fn default_batch_size() -> usize {
    32
}

impl RagConfig {
    /// A configuration with every default filled in, persisting under `persist_path`.
    pub fn new(persist_path: impl Into<PathBuf>) -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            model_name: default_model_name(),
            persist_path: persist_path.into(),
            similarity_metric: SimilarityMetric::default(),
            top_k: default_top_k(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_batch_size: default_batch_size(),
            index_strategy: IndexStrategy::default(),
            build_conflict: BuildConflict::default(),
            show_progress: false,
        }
    }

    /// Check the numeric constraints between fields.
    ///
    /// # Errors
    /// Returns [`RagError::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Configuration(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Configuration(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.model_name.trim().is_empty() {
            return Err(RagError::Configuration("model_name must not be empty".into()));
        }
        if self.persist_path.as_os_str().is_empty() {
            return Err(RagError::Configuration(
                "persist_path must not be empty".into(),
            ));
        }
        if self.top_k == 0 {
            return Err(RagError::Configuration("top_k must be greater than 0".into()));
        }
        if self.embedding_batch_size == 0 {
            return Err(RagError::Configuration(
                "embedding_batch_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Loads the retrieval configuration from a YAML file.
///
/// This function reads the file at the given path and parses it as YAML. It does not
/// validate the result; call [`RagConfig::validate`] before use.
///
/// # Parameters
///
/// - `file`: The path to the YAML configuration file.
///
/// # Returns
///
/// - `Ok(RagConfig)`: The loaded configuration.
/// - `Err(RagError)`: An error occurred while reading the file or parsing the YAML.
pub fn load_config(file: &str) -> Result<RagConfig> {
    debug!("Loading config from {:?}", file);
    let content = fs::read_to_string(file)?;
    let config: RagConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
chunk_size: 800
chunk_overlap: 100
model_name: "sentence-transformers/all-MiniLM-L12-v2"
persist_path: "faiss_store"
similarity_metric: dot
index_strategy: hnsw
build_conflict: fail
"#
        )
        .unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());

        assert!(config.is_ok());
        let config = config.unwrap();
        assert_eq!(config.chunk_size, 800);
        assert_eq!(config.chunk_overlap, 100);
        assert_eq!(config.model_name, "sentence-transformers/all-MiniLM-L12-v2");
        assert_eq!(config.persist_path, PathBuf::from("faiss_store"));
        assert_eq!(config.similarity_metric, SimilarityMetric::Dot);
        assert_eq!(config.index_strategy, IndexStrategy::Hnsw);
        assert_eq!(config.build_conflict, BuildConflict::Fail);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_fills_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "persist_path: store").unwrap();

        let config = load_config(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config, RagConfig::new("store"));
    }

    #[test]
    fn test_load_config_invalid_file() {
        let config = load_config("non/existent/path");
        assert!(matches!(config, Err(RagError::Io(_))));
    }

    #[test]
    fn test_load_config_invalid_format() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, r#"invalid: config: format"#).unwrap();

        let config = load_config(temp_file.path().to_str().unwrap());
        assert!(matches!(config, Err(RagError::Yaml(_))));
    }

    #[test]
    fn test_validate_rejects_overlap_not_below_size() {
        let mut config = RagConfig::new("store");
        config.chunk_size = 40;
        config.chunk_overlap = 40;
        assert!(matches!(
            config.validate(),
            Err(RagError::Configuration(_))
        ));

        config.chunk_overlap = 39;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = RagConfig::new("store");
        config.chunk_size = 0;
        config.chunk_overlap = 0;
        assert!(config.validate().is_err());

        let mut config = RagConfig::new("store");
        config.top_k = 0;
        assert!(config.validate().is_err());

        let mut config = RagConfig::new("store");
        config.embedding_batch_size = 0;
        assert!(config.validate().is_err());
    }
}
