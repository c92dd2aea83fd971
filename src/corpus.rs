//! Reading a directory of plain-text files into [`Document`]s.
//!
//! Hidden entries are skipped. Each document's source identifier is its path
//! relative to the corpus root, using `/` separators, so snapshots built on
//! different machines carry the same provenance.

use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::chunker::Document;
use crate::error::{RagError, Result};

/// File extensions treated as corpus text.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "rst"];

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn is_text_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Load every text file under `root`, sorted by relative path.
///
/// Files that are not valid UTF-8 are skipped with a warning.
///
/// # Errors
/// - [`RagError::InvalidArgument`] if `root` is not a directory.
/// - [`RagError::Io`] if the directory cannot be walked or a file cannot be read.
pub fn load_documents(root: &Path) -> Result<Vec<Document>> {
    if !root.is_dir() {
        return Err(RagError::InvalidArgument(format!(
            "corpus path {} is not a directory",
            root.display()
        )));
    }

    let mut documents = Vec::new();
    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || !is_text_file(entry.path()) {
            continue;
        }

        let bytes = fs::read(entry.path())?;
        let Ok(text) = String::from_utf8(bytes) else {
            warn!("Skipping {}: not valid UTF-8", entry.path().display());
            continue;
        };

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let source = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        debug!("Loaded {} ({} bytes)", source, text.len());
        documents.push(Document::new(text, source));
    }

    info!("Loaded {} documents from {}", documents.len(), root.display());
    Ok(documents)
}
