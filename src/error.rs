//! # Errors
//!
//! Every fallible operation in the library returns [`Result<T>`], an alias over
//! [`RagError`]. The variants mirror the failure modes callers need to tell
//! apart:
//!
//! - [`RagError::SnapshotNotFound`] means "no index yet, build one", while
//!   [`RagError::CorruptIndex`] means "an index is present but unreadable" and
//!   must never trigger a silent rebuild.
//! - Failures raised while building are wrapped in [`RagError::Build`] so the
//!   caller learns which [`BuildStage`] failed. Use [`RagError::root_cause`]
//!   to match on the underlying typed error.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, RagError>;

/// The phase of a corpus build in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    Chunking,
    Embedding,
    Indexing,
    Persisting,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Chunking => "chunking",
            BuildStage::Embedding => "embedding",
            BuildStage::Indexing => "indexing",
            BuildStage::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Embedding model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown record id: {0}")]
    UnknownId(usize),

    #[error("Corrupt index at {}: {reason}", .path.display())]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("No snapshot found at {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("Another process is building the index at {}", .0.display())]
    BuildInProgress(PathBuf),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Build failed during {stage}: {source}")]
    Build {
        stage: BuildStage,
        #[source]
        source: Box<RagError>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RagError {
    /// Shorthand for a [`RagError::CorruptIndex`] at `path`.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        RagError::CorruptIndex {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap `self` as a failure of the given build stage.
    ///
    /// Already-wrapped errors keep their original stage.
    pub fn in_stage(self, stage: BuildStage) -> Self {
        match self {
            already @ RagError::Build { .. } => already,
            other => RagError::Build {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through [`RagError::Build`] wrappers.
    pub fn root_cause(&self) -> &RagError {
        match self {
            RagError::Build { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// The stage a build failed in, if this error came from a build.
    pub fn stage(&self) -> Option<BuildStage> {
        match self {
            RagError::Build { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
