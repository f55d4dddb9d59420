//! Content-Addressed Datastore
//!
//! A datastore is a directory tree with three areas:
//!
//! ```text
//! <root>/core/<digest>/    immutable dataset directories, or single-file redirects
//! <root>/cache/<digest>/   rebuildable per-stream index files
//! <root>/incoming/<n>/     transient staging for in-progress imports
//! ```
//!
//! Datasets become visible under `core/` only by an atomic rename out of a
//! staging directory, so concurrent readers never observe a partial dataset.
//! Multiple processes may read one store concurrently; writers rely on the
//! staging protocol and on `create_dir` as the claim primitive for staging
//! numbers.

use crate::store::dataset::{Dataset, DatasetError, MetadataMap};
use crate::store::digest::{digest_dataset, ContentDigest, DigestError, DIGEST_HEX_LEN};
use crate::stream::index::{FileIndex, IndexError, INDEX_EXTENSION};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Validation strength applied when opening a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Skip validation.
    None,
    /// File presence and sizes.
    Weak,
    /// Recompute and compare every file digest.
    Full,
}

/// Redirect marker: this digest's content now lives under another digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RedirectMarker {
    to: ContentDigest,
    #[serde(flatten)]
    extra: BTreeMap<String, String>,
}

// =============================================================================
// DATASTORE
// =============================================================================

pub struct Datastore {
    root: PathBuf,
}

impl Datastore {
    /// Open a store at `root`, idempotently ensuring the three areas exist.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { root: root.into() };
        for dir in [store.core_dir(), store.cache_dir(), store.incoming_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(store)
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn core_dir(&self) -> PathBuf {
        self.root.join("core")
    }

    fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    fn incoming_dir(&self) -> PathBuf {
        self.root.join("incoming")
    }

    /// `core/<digest>` path (dataset directory or redirect file).
    pub fn core_path_of(&self, digest: &ContentDigest) -> PathBuf {
        self.core_dir().join(digest.as_str())
    }

    /// `cache/<digest>` path.
    pub fn cache_path_of(&self, digest: &ContentDigest) -> PathBuf {
        self.cache_dir().join(digest.as_str())
    }

    // -------------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------------

    /// Whether `core/<digest>` exists (as a dataset or a redirect).
    pub fn has(&self, digest: &ContentDigest) -> bool {
        self.core_path_of(digest).exists()
    }

    /// All digests present under `core/`, redirects included.
    pub fn each_digest(&self) -> Result<Vec<ContentDigest>, StoreError> {
        let core = self.core_dir();
        let mut digests = Vec::new();
        for entry in fs::read_dir(&core).map_err(|e| StoreError::io(&core, e))? {
            let entry = entry.map_err(|e| StoreError::io(&core, e))?;
            let name = entry.file_name();
            match ContentDigest::parse(&name.to_string_lossy()) {
                Ok(digest) => digests.push(digest),
                Err(_) => warn!(
                    entry = %name.to_string_lossy(),
                    "ignoring non-digest entry in core/"
                ),
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Every dataset in the store (redirects excluded), unvalidated handles.
    pub fn each_dataset(&self) -> Result<Vec<Dataset>, StoreError> {
        let mut datasets = Vec::new();
        for digest in self.each_digest()? {
            if self.core_path_of(&digest).is_dir() {
                datasets.push(Dataset::new(
                    digest.clone(),
                    self.core_path_of(&digest),
                    self.cache_path_of(&digest),
                ));
            }
        }
        Ok(datasets)
    }

    /// Resolve a (possibly abbreviated) digest against the store's contents.
    /// Scans every entry, redirects included.
    fn find_digest_by_prefix(&self, prefix: &str) -> Result<Option<ContentDigest>, StoreError> {
        let matches: Vec<ContentDigest> = self
            .each_digest()?
            .into_iter()
            .filter(|d| d.as_str().starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches.into_iter().next().expect("one match"))),
            _ => Err(StoreError::AmbiguousDigest {
                prefix: prefix.to_string(),
                matches: matches.iter().map(|d| d.as_str().to_string()).collect(),
            }),
        }
    }

    /// Open a dataset by exact digest or unambiguous prefix, resolving any
    /// redirect chain, then validating at the requested strength.
    pub fn get(
        &self,
        digest_or_prefix: &str,
        validate: ValidationMode,
        preload_metadata: bool,
    ) -> Result<Dataset, StoreError> {
        let exact = ContentDigest::parse(digest_or_prefix)
            .ok()
            .filter(|d| self.has(d));
        let resolved = match exact {
            Some(digest) => digest,
            None => self
                .find_digest_by_prefix(digest_or_prefix)?
                .ok_or_else(|| StoreError::NotFound {
                    reference: digest_or_prefix.to_string(),
                })?,
        };

        let target = self.resolve_redirect(&resolved)?;
        if !self.core_path_of(&target).is_dir() {
            return Err(StoreError::NotFound {
                reference: target.as_str().to_string(),
            });
        }

        let mut dataset = Dataset::new(
            target.clone(),
            self.core_path_of(&target),
            self.cache_path_of(&target),
        );
        match validate {
            ValidationMode::None => {}
            ValidationMode::Weak => dataset.weak_validate_identity_metadata()?,
            ValidationMode::Full => dataset.validate_identity_metadata()?,
        }
        if preload_metadata {
            dataset.metadata()?;
        }
        Ok(dataset)
    }

    /// Every dataset whose metadata is a superset match for each queried key
    /// (the queried value set must be a subset of the stored value set).
    pub fn find_all(&self, query: &MetadataMap) -> Result<Vec<Dataset>, StoreError> {
        let mut results = Vec::new();
        for mut dataset in self.each_dataset()? {
            let mut matched = true;
            for (key, wanted) in query {
                let stored = dataset.metadata_fetch_all(key)?;
                if !wanted.is_subset(&stored) {
                    matched = false;
                    break;
                }
            }
            if matched {
                results.push(dataset);
            }
        }
        Ok(results)
    }

    /// Like [`find_all`](Self::find_all) but requires at most one result.
    pub fn find(&self, query: &MetadataMap) -> Result<Option<Dataset>, StoreError> {
        let mut results = self.find_all(query)?;
        match results.len() {
            0 | 1 => Ok(results.pop()),
            n => Err(StoreError::AmbiguousMatch {
                count: n,
                query: format!("{:?}", query),
            }),
        }
    }

    /// Shortest unambiguous truncation of a dataset's digest, at least
    /// `length` characters. Re-runs the prefix scan against current store
    /// contents, so callers must not cache the result across store mutations.
    pub fn short_digest(&self, dataset: &Dataset, length: usize) -> Result<String, StoreError> {
        let digest = dataset.digest();
        let all = self.each_digest()?;
        for len in length..DIGEST_HEX_LEN {
            let candidate = digest.prefix(len);
            let matches = all
                .iter()
                .filter(|d| d.as_str().starts_with(candidate))
                .count();
            if matches <= 1 {
                return Ok(candidate.to_string());
            }
        }
        Ok(digest.as_str().to_string())
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Remove a dataset's core and cache entries. Irreversible.
    pub fn delete(&self, digest: &ContentDigest) -> Result<(), StoreError> {
        let core = self.core_path_of(digest);
        if core.is_dir() {
            fs::remove_dir_all(&core).map_err(|e| StoreError::io(&core, e))?;
        } else if core.exists() {
            fs::remove_file(&core).map_err(|e| StoreError::io(&core, e))?;
        }
        let cache = self.cache_path_of(digest);
        if cache.exists() {
            fs::remove_dir_all(&cache).map_err(|e| StoreError::io(&cache, e))?;
        }
        info!(digest = digest.as_str(), "dataset deleted");
        Ok(())
    }

    /// Run `block` with a fresh numbered staging directory
    /// (`incoming/<n>/{core,cache}`). The staging directory is removed
    /// afterwards, both on success (the block is expected to have renamed the
    /// populated directories into place) and on any failure path, unless
    /// `keep` is requested. A crashed or aborted import therefore never
    /// leaves partial data visible under `core/`.
    pub fn in_incoming<T>(
        &self,
        keep: bool,
        block: impl FnOnce(&Path, &Path) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let staging = self.allocate_staging()?;
        let _guard = StagingGuard {
            path: staging.clone(),
            keep,
        };

        let core = staging.join("core");
        let cache = staging.join("cache");
        fs::create_dir(&core).map_err(|e| StoreError::io(&core, e))?;
        fs::create_dir(&cache).map_err(|e| StoreError::io(&cache, e))?;

        block(&core, &cache)
    }

    /// Claim the lowest-numbered unused staging directory. `create_dir` is
    /// the atomic claim; a concurrent process claiming the same number makes
    /// us retry with the next one.
    fn allocate_staging(&self) -> Result<PathBuf, StoreError> {
        let incoming = self.incoming_dir();
        for n in 0u32.. {
            let candidate = incoming.join(n.to_string());
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    debug!(staging = %candidate.display(), "staging directory claimed");
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::io(&candidate, e)),
            }
        }
        unreachable!("staging number space exhausted")
    }

    // -------------------------------------------------------------------------
    // Redirects
    // -------------------------------------------------------------------------

    /// Follow redirect files until reaching a digest that is not a redirect.
    /// Cycles are a caller error and are not detected.
    pub fn resolve_redirect(&self, digest: &ContentDigest) -> Result<ContentDigest, StoreError> {
        let mut current = digest.clone();
        loop {
            let path = self.core_path_of(&current);
            if !path.is_file() {
                return Ok(current);
            }
            let json = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            let marker: RedirectMarker = serde_json::from_str(&json)?;
            current = marker.to;
        }
    }

    /// Record that `old` digest's content now lives under `to`, so stale
    /// references keep resolving. Extra metadata is stored alongside.
    pub fn write_redirect(
        &self,
        old: &ContentDigest,
        to: &ContentDigest,
        extra: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let marker = RedirectMarker {
            to: to.clone(),
            extra,
        };
        let path = self.core_path_of(old);
        let json = serde_json::to_string_pretty(&marker)?;
        fs::write(&path, json).map_err(|e| StoreError::io(&path, e))?;
        info!(from = old.as_str(), to = to.as_str(), "redirect written");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Digest updates
    // -------------------------------------------------------------------------

    /// Run caller-supplied mutation code against a dataset, then recompute
    /// its digest from the identity manifest. If the digest changed, both the
    /// core and cache directories are atomically renamed to the new digest
    /// path and a fresh handle at the new location is returned.
    ///
    /// This is the only sanctioned way to change a dataset's on-disk digest.
    pub fn updating_digest(
        &self,
        mut dataset: Dataset,
        block: impl FnOnce(&mut Dataset) -> Result<(), StoreError>,
    ) -> Result<Dataset, StoreError> {
        let old = dataset.digest().clone();
        block(&mut dataset)?;

        let manifest = dataset.read_identity_metadata()?;
        let new = digest_dataset(&manifest.identity);
        if new == old {
            return Ok(dataset);
        }

        let old_core = self.core_path_of(&old);
        let new_core = self.core_path_of(&new);
        fs::rename(&old_core, &new_core).map_err(|e| StoreError::io(&old_core, e))?;

        let old_cache = self.cache_path_of(&old);
        if old_cache.exists() {
            let new_cache = self.cache_path_of(&new);
            fs::rename(&old_cache, &new_cache).map_err(|e| StoreError::io(&old_cache, e))?;
        }

        info!(
            from = old.as_str(),
            to = new.as_str(),
            "dataset digest updated"
        );
        Ok(Dataset::new(
            new.clone(),
            self.core_path_of(&new),
            self.cache_path_of(&new),
        ))
    }

    // -------------------------------------------------------------------------
    // Import
    // -------------------------------------------------------------------------

    /// Import a directory of log files as a new dataset: stage a normalized
    /// copy, compute and persist its identity, pre-build stream indexes, and
    /// atomically move the result into `core/`/`cache/`.
    ///
    /// A digest collision is a policy decision, not an error: with `force`
    /// the existing dataset is replaced, without it the existing dataset is
    /// returned untouched.
    pub fn import(
        &self,
        source_dir: &Path,
        metadata: MetadataMap,
        force: bool,
    ) -> Result<Dataset, StoreError> {
        let digest = self.in_incoming(false, |core_stage, cache_stage| {
            copy_log_files(source_dir, core_stage)?;

            let mut staged = Dataset::new(
                digest_dataset(&[]),
                core_stage.to_path_buf(),
                cache_stage.to_path_buf(),
            );
            let identity = staged.compute_identity_from_files()?;
            let digest = staged.write_identity_to_metadata_file(identity)?;
            for (key, values) in &metadata {
                staged.metadata_set(key, values.iter().cloned())?;
            }
            staged.metadata_write()?;

            // Pre-build the per-file indexes so readers get the fast path
            // immediately.
            for relative in staged.each_important_file()? {
                let log_path = core_stage.join(&relative);
                let mut idx_relative = relative.clone();
                idx_relative.set_extension(INDEX_EXTENSION);
                let mut index = FileIndex::build_from_log(&log_path)?;
                index.save(&cache_stage.join(&idx_relative))?;
            }

            if self.has(&digest) {
                if !force {
                    warn!(
                        digest = digest.as_str(),
                        "dataset already present, keeping existing (import not forced)"
                    );
                    return Ok(digest);
                }
                self.delete(&digest)?;
            }

            let final_core = self.core_path_of(&digest);
            let final_cache = self.cache_path_of(&digest);
            fs::rename(core_stage, &final_core).map_err(|e| StoreError::io(core_stage, e))?;
            fs::rename(cache_stage, &final_cache).map_err(|e| StoreError::io(cache_stage, e))?;
            info!(digest = digest.as_str(), "dataset imported");
            Ok(digest)
        })?;

        self.get(digest.as_str(), ValidationMode::None, false)
    }

    /// Rebuild every cached stream index of a dataset from its log files.
    pub fn rebuild_cache(&self, dataset: &Dataset) -> Result<(), StoreError> {
        for relative in dataset.each_important_file()? {
            let log_path = dataset.dataset_dir().join(&relative);
            let mut idx_relative = relative.clone();
            idx_relative.set_extension(INDEX_EXTENSION);
            let mut index = FileIndex::build_from_log(&log_path)?;
            index.save(&dataset.cache_dir().join(&idx_relative))?;
        }
        Ok(())
    }
}

fn copy_log_files(source: &Path, destination: &Path) -> Result<(), StoreError> {
    copy_log_files_inner(source, Path::new(""), destination)
        .map_err(|e| StoreError::io(source, e))
}

fn copy_log_files_inner(root: &Path, relative: &Path, destination: &Path) -> io::Result<()> {
    for entry in fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let child = relative.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_log_files_inner(root, &child, destination)?;
        } else if child
            .extension()
            .map_or(false, |e| e == crate::logfile::LOG_EXTENSION)
        {
            let target = destination.join(&child);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(root.join(&child), target)?;
        }
    }
    Ok(())
}

/// Removes the staging directory on drop unless `keep` was requested.
struct StagingGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.keep {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        staging = %self.path.display(),
                        error = %e,
                        "failed to remove staging directory"
                    );
                }
            }
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum StoreError {
    Io { path: String, source: io::Error },
    Dataset(DatasetError),
    Digest(DigestError),
    Index(IndexError),
    Json(serde_json::Error),
    /// A digest prefix matched more than one on-disk entry.
    AmbiguousDigest { prefix: String, matches: Vec<String> },
    /// A metadata query matched more than one dataset when a single result
    /// was required.
    AmbiguousMatch { count: usize, query: String },
    NotFound { reference: String },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "store I/O error on {}: {}", path, source),
            Self::Dataset(e) => write!(f, "{}", e),
            Self::Digest(e) => write!(f, "{}", e),
            Self::Index(e) => write!(f, "{}", e),
            Self::Json(e) => write!(f, "store marker parse error: {}", e),
            Self::AmbiguousDigest { prefix, matches } => write!(
                f,
                "ambiguous digest prefix {:?}, matches: {}",
                prefix,
                matches.join(", ")
            ),
            Self::AmbiguousMatch { count, query } => {
                write!(f, "metadata query {} matched {} datasets", query, count)
            }
            Self::NotFound { reference } => {
                write!(f, "no dataset matching {:?} in store", reference)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Dataset(e) => Some(e),
            Self::Digest(e) => Some(e),
            Self::Index(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DatasetError> for StoreError {
    fn from(e: DatasetError) -> Self {
        Self::Dataset(e)
    }
}

impl From<DigestError> for StoreError {
    fn from(e: DigestError) -> Self {
        Self::Digest(e)
    }
}

impl From<IndexError> for StoreError {
    fn from(e: IndexError) -> Self {
        Self::Index(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================
