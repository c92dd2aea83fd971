//! # Snapshot
//!
//! The vector index and its metadata, handled as one unit.
//!
//! A persist location is a directory holding one committed metadata file, the vector
//! file it names, and two lock files:
//!
//! ```text
//! <persist_path>/
//!   metadata.yaml           # MetadataStore + SnapshotHeader, YAML payload
//!   vectors-<blake3>.bin    # VectorIndex, bincode payload
//!   .build.lock             # held by the single active builder
//!   .publish.lock           # readers shared, publisher exclusive
//! ```
//!
//! Both data files share the same envelope: an 8-byte magic, the 32-byte BLAKE3
//! digest of the payload, then the payload. The vector file is named after that
//! digest and the metadata records it, so a vector file and a metadata file from
//! different builds are never accepted as a pair.
//!
//! ## Durability
//! [`Snapshot::save`] writes both files into a staging directory next to the
//! snapshot and fsyncs them. The new vector file is renamed in under its own
//! generation name, which never replaces the committed one; the rename of
//! `metadata.yaml` is the single commit point. Stale vector files are deleted only
//! after that. A writer that dies or fails at any step leaves the previous snapshot
//! loadable.
//!
//! ## Locking
//! Builders serialize on `.build.lock` for the whole build. Readers never touch it:
//! they take a shared lock on `.publish.lock`, which a publisher holds exclusively
//! only while renaming files into place.
//!
//! ## Loading
//! - No committed metadata, or the vector file it names is missing:
//!   [`RagError::SnapshotNotFound`] (build one).
//! - Anything unreadable, truncated or inconsistent: [`RagError::CorruptIndex`]
//!   (do **not** rebuild over it).

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{IndexStrategy, SimilarityMetric};
use crate::error::{RagError, Result};
use crate::metadata_store::{ChunkRecord, MetadataStore};
use crate::vector_index::{RecordId, ScoredId, VectorIndex};

pub const METADATA_FILE: &str = "metadata.yaml";
pub const BUILD_LOCK_FILE: &str = ".build.lock";
pub const PUBLISH_LOCK_FILE: &str = ".publish.lock";

const VECTORS_PREFIX: &str = "vectors-";
const VECTORS_SUFFIX: &str = ".bin";

/// Name of the vector file whose payload has the given hex digest.
pub fn vectors_file_name(digest_hex: &str) -> String {
    format!("{VECTORS_PREFIX}{digest_hex}{VECTORS_SUFFIX}")
}

fn is_vectors_file(name: &str) -> bool {
    name.starts_with(VECTORS_PREFIX) && name.ends_with(VECTORS_SUFFIX)
}

/// Every generation vector file in `dir`, committed or not.
fn vector_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_str().is_some_and(is_vectors_file) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

const MAGIC_LEN: usize = 8;
const DIGEST_LEN: usize = 32;

/// Write `magic | blake3(payload) | payload` to `path` and fsync it.
pub(crate) fn write_envelope(path: &Path, magic: &[u8; 8], payload: &[u8]) -> Result<blake3::Hash> {
    let digest = blake3::hash(payload);
    let mut file = File::create(path)?;
    file.write_all(magic)?;
    file.write_all(digest.as_bytes())?;
    file.write_all(payload)?;
    file.sync_all()?;
    Ok(digest)
}

/// Read and verify an envelope written by [`write_envelope`].
pub(crate) fn read_envelope(path: &Path, magic: &[u8; 8]) -> Result<(Vec<u8>, blake3::Hash)> {
    let mut bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(RagError::SnapshotNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(RagError::corrupt(path, e)),
    };

    if bytes.len() < MAGIC_LEN + DIGEST_LEN {
        return Err(RagError::corrupt(path, "file shorter than its header"));
    }
    if &bytes[..MAGIC_LEN] != magic {
        return Err(RagError::corrupt(path, "unrecognized file magic"));
    }

    let mut stored = [0u8; DIGEST_LEN];
    stored.copy_from_slice(&bytes[MAGIC_LEN..MAGIC_LEN + DIGEST_LEN]);
    let stored = blake3::Hash::from(stored);

    let payload = bytes.split_off(MAGIC_LEN + DIGEST_LEN);
    let digest = blake3::hash(&payload);
    if digest != stored {
        return Err(RagError::corrupt(path, "checksum mismatch (truncated or modified)"));
    }
    Ok((payload, digest))
}

/// Advisory `fs2` lock on a file inside the persist directory, released on drop.
pub struct SnapshotLock {
    file: File,
    path: PathBuf,
}

impl SnapshotLock {
    fn open(dir: &Path, name: &str) -> Result<(File, PathBuf)> {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok((file, path))
    }

    fn try_take(dir: &Path, name: &str, exclusive: bool) -> Result<Option<Self>> {
        let (file, path) = Self::open(dir, name)?;
        let taken = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match taken {
            Ok(()) => {
                debug!("Acquired lock {}", path.display());
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until this process is the only builder for `dir`.
    pub fn build(dir: &Path) -> Result<Self> {
        let (file, path) = Self::open(dir, BUILD_LOCK_FILE)?;
        FileExt::lock_exclusive(&file)?;
        debug!("Acquired build lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Take the build lock if no other builder holds it.
    pub fn try_build(dir: &Path) -> Result<Option<Self>> {
        Self::try_take(dir, BUILD_LOCK_FILE, true)
    }

    /// Block until no publish is in progress, then hold readers' shared lock.
    pub fn read(dir: &Path) -> Result<Self> {
        let (file, path) = Self::open(dir, PUBLISH_LOCK_FILE)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file, path })
    }

    /// Take the shared read lock unless a publish is in progress.
    pub fn try_read(dir: &Path) -> Result<Option<Self>> {
        Self::try_take(dir, PUBLISH_LOCK_FILE, false)
    }

    /// Exclusive lock held while files are renamed into place.
    pub(crate) fn publish(dir: &Path) -> Result<Self> {
        let (file, path) = Self::open(dir, PUBLISH_LOCK_FILE)?;
        FileExt::lock_exclusive(&file)?;
        debug!("Acquired publish lock {}", path.display());
        Ok(Self { file, path })
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        if FileExt::unlock(&self.file).is_err() {
            debug!("Failed to release lock {}", self.path.display());
        }
    }
}

/// Description of a snapshot, stored in its metadata file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub record_count: usize,
    pub dimension: usize,
    pub model_name: String,
    pub metric: SimilarityMetric,
    pub strategy: IndexStrategy,
    /// RFC 3339 creation time.
    pub created_at: String,
}

/// An id-aligned [`VectorIndex`] and [`MetadataStore`].
pub struct Snapshot {
    index: VectorIndex,
    metadata: MetadataStore,
    model_name: String,
    created_at: String,
}

impl Snapshot {
    /// An empty snapshot for vectors produced by `model_name`.
    pub fn new(
        dimension: usize,
        metric: SimilarityMetric,
        strategy: IndexStrategy,
        model_name: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            index: VectorIndex::new(dimension, metric, strategy)?,
            metadata: MetadataStore::new(),
            model_name: model_name.into(),
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Add chunks and their vectors as one operation.
    ///
    /// `records[i]` must describe the text that produced `vectors[i]`. Both sides
    /// receive the same id block; on error neither side changes.
    ///
    /// # Errors
    /// - [`RagError::InvalidArgument`] if the two sequences differ in length, or a
    ///   vector is not finite.
    /// - [`RagError::DimensionMismatch`] if a vector has the wrong length.
    pub fn append(
        &mut self,
        vectors: Vec<Vec<f32>>,
        records: Vec<ChunkRecord>,
    ) -> Result<Range<RecordId>> {
        if vectors.len() != records.len() {
            return Err(RagError::InvalidArgument(format!(
                "{} vectors for {} records",
                vectors.len(),
                records.len()
            )));
        }
        let ids = if self.index.is_empty() {
            self.index.build(vectors)?
        } else {
            self.index.append(vectors)?
        };
        let record_ids = self.metadata.append(records);
        debug_assert_eq!(ids, record_ids);
        Ok(ids)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn header(&self) -> SnapshotHeader {
        SnapshotHeader {
            record_count: self.index.len(),
            dimension: self.index.dimension(),
            model_name: self.model_name.clone(),
            metric: self.index.metric(),
            strategy: self.index.strategy(),
            created_at: self.created_at.clone(),
        }
    }

    /// Nearest records to `query`, each with its metadata.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(ScoredId, &ChunkRecord)>> {
        self.index
            .search(query, k)?
            .into_iter()
            .map(|hit| Ok((hit, self.metadata.get(hit.id)?)))
            .collect()
    }

    /// True when `dir` holds a committed metadata file.
    pub fn exists(dir: &Path) -> bool {
        dir.join(METADATA_FILE).is_file()
    }

    /// Stage and publish this snapshot under `dir`, holding the build lock.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let _lock = SnapshotLock::build(dir)?;
        self.save_locked(dir)
    }

    /// As [`Snapshot::save`], for callers already holding the build lock.
    pub(crate) fn save_locked(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(dir)?;

        let vectors_tmp = staging.path().join("vectors.bin");
        let metadata_tmp = staging.path().join(METADATA_FILE);
        let vectors_digest = self.index.save(&vectors_tmp)?;
        self.metadata
            .save(&metadata_tmp, &self.header(), &vectors_digest)?;
        let vectors_name = vectors_file_name(vectors_digest.to_hex().as_str());

        {
            let _publish = SnapshotLock::publish(dir)?;
            fs::rename(&vectors_tmp, dir.join(&vectors_name))?;
            fs::rename(&metadata_tmp, dir.join(METADATA_FILE))?;
            sync_dir(dir);

            for stale in vector_files(dir)? {
                if stale.file_name().and_then(|n| n.to_str()) == Some(vectors_name.as_str()) {
                    continue;
                }
                if let Err(e) = fs::remove_file(&stale) {
                    debug!("Failed to remove stale {}: {}", stale.display(), e);
                }
            }
        }

        info!(
            "Saved snapshot with {} records to {}",
            self.len(),
            dir.display()
        );
        Ok(())
    }

    /// Load the snapshot in `dir`, waiting out any publish in progress.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(RagError::SnapshotNotFound(dir.to_path_buf()));
        }
        let _lock = SnapshotLock::read(dir)?;
        Self::load_files(dir)
    }

    /// As [`Snapshot::load`], but never waits.
    ///
    /// # Errors
    /// [`RagError::BuildInProgress`] if a publish currently holds the directory.
    pub fn try_load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(RagError::SnapshotNotFound(dir.to_path_buf()));
        }
        let Some(_lock) = SnapshotLock::try_read(dir)? else {
            return Err(RagError::BuildInProgress(dir.to_path_buf()));
        };
        Self::load_files(dir)
    }

    fn load_files(dir: &Path) -> Result<Self> {
        let metadata_path = dir.join(METADATA_FILE);
        let (metadata, header, vectors_digest) = MetadataStore::load(&metadata_path)?;

        if vectors_digest.len() != 64 || !vectors_digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RagError::corrupt(
                &metadata_path,
                "vector digest is not a BLAKE3 hex string",
            ));
        }
        let vectors_path = dir.join(vectors_file_name(&vectors_digest));
        let (index, digest) = VectorIndex::load(&vectors_path)?;

        if vectors_digest != digest.to_hex().as_str() {
            return Err(RagError::corrupt(
                &metadata_path,
                "metadata was written for a different vector file",
            ));
        }
        if header.record_count != index.len() || metadata.len() != index.len() {
            return Err(RagError::corrupt(
                &metadata_path,
                format!(
                    "record count mismatch: {} vectors, {} metadata records",
                    index.len(),
                    metadata.len()
                ),
            ));
        }
        if header.dimension != index.dimension() || header.metric != index.metric() {
            return Err(RagError::corrupt(
                &metadata_path,
                "header disagrees with vector file",
            ));
        }

        info!(
            "Loaded snapshot with {} records from {}",
            index.len(),
            dir.display()
        );
        Ok(Self {
            index,
            metadata,
            model_name: header.model_name,
            created_at: header.created_at,
        })
    }

    /// Delete the snapshot files in `dir`.
    pub fn remove(dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let _build = SnapshotLock::build(dir)?;
        let _publish = SnapshotLock::publish(dir)?;
        match fs::remove_file(dir.join(METADATA_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for path in vector_files(dir)? {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Persist directory entries after a rename; failures are logged only.
fn sync_dir(dir: &Path) {
    match File::open(dir).and_then(|handle| handle.sync_all()) {
        Ok(()) => {}
        Err(e) => debug!("Failed to fsync {}: {}", dir.display(), e),
    }
}
