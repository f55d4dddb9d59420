//! Datasets
//!
//! One imported, content-addressed unit of recorded data: a directory of
//! normalized binary log files plus an identity manifest and free-form
//! metadata. Treated as immutable content once imported; the only sanctioned
//! mutations are metadata updates and digest-changing repairs routed through
//! [`Datastore::updating_digest`](crate::store::datastore::Datastore::updating_digest).
//!
//! # Identity
//!
//! The identity manifest lists every important file (the `.rlog` payload
//! carriers) with its size and content digest; the dataset digest is the hash
//! of that list (see [`crate::store::digest`]). Validation comes in two
//! strengths: `full` recomputes every file digest, `weak` checks only
//! presence and size.

use crate::context::Context;
use crate::logfile::{LOG_EXTENSION, PROLOGUE_SIZE};
use crate::store::digest::{
    digest_dataset, digest_file_skipping, ContentDigest, DigestError, IdentityEntry,
};
use crate::stream::index::{FileIndex, IndexError, INDEX_EXTENSION};
use crate::stream::lazy::{LazyStream, StreamError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// Version of the on-disk dataset layout this implementation understands.
pub const LAYOUT_VERSION: u32 = 1;

/// Identity manifest file name, one per dataset directory.
pub const IDENTITY_FILE: &str = "roverlog-identity.json";

/// Metadata file name, one per dataset directory.
pub const METADATA_FILE: &str = "roverlog-metadata.json";

/// Dataset metadata: string key to set of string values.
pub type MetadataMap = BTreeMap<String, BTreeSet<String>>;

// =============================================================================
// IDENTITY MANIFEST
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityManifest {
    pub layout_version: u32,
    pub digest: ContentDigest,
    pub identity: Vec<IdentityEntry>,
}

// =============================================================================
// DATASET
// =============================================================================

pub struct Dataset {
    digest: ContentDigest,
    dataset_dir: PathBuf,
    cache_dir: PathBuf,
    /// Lazily loaded from [`METADATA_FILE`].
    metadata: Option<MetadataMap>,
}

impl Dataset {
    pub fn new(digest: ContentDigest, dataset_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            digest,
            dataset_dir,
            cache_dir,
            metadata: None,
        }
    }

    #[inline]
    pub fn digest(&self) -> &ContentDigest {
        &self.digest
    }

    #[inline]
    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    #[inline]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    // -------------------------------------------------------------------------
    // Identity
    // -------------------------------------------------------------------------

    /// Relative paths of the important files (the binary log files), sorted.
    pub fn each_important_file(&self) -> Result<Vec<PathBuf>, DatasetError> {
        let mut files = Vec::new();
        collect_log_files(&self.dataset_dir, Path::new(""), &mut files)
            .map_err(|e| DatasetError::io(&self.dataset_dir, e))?;
        files.sort();
        Ok(files)
    }

    /// Enumerate and digest the important files. The per-file digest skips
    /// the fixed-size log prologue, which carries framing only.
    pub fn compute_identity_from_files(&self) -> Result<Vec<IdentityEntry>, DatasetError> {
        let mut entries = Vec::new();
        for relative in self.each_important_file()? {
            let absolute = self.dataset_dir.join(&relative);
            let size = fs::metadata(&absolute)
                .map_err(|e| DatasetError::io(&absolute, e))?
                .len();
            let sha256 = digest_file_skipping(&absolute, PROLOGUE_SIZE)?;
            entries.push(IdentityEntry {
                path: relative.to_string_lossy().replace('\\', "/"),
                size,
                sha256,
            });
        }
        Ok(entries)
    }

    /// Persist the identity list, layout version, and resulting dataset
    /// digest to the manifest file. Returns the dataset digest.
    pub fn write_identity_to_metadata_file(
        &mut self,
        identity: Vec<IdentityEntry>,
    ) -> Result<ContentDigest, DatasetError> {
        let digest = digest_dataset(&identity);
        let manifest = IdentityManifest {
            layout_version: LAYOUT_VERSION,
            digest: digest.clone(),
            identity,
        };
        let path = self.dataset_dir.join(IDENTITY_FILE);
        let json = serde_json::to_string_pretty(&manifest)?;
        fs::write(&path, json).map_err(|e| DatasetError::io(&path, e))?;
        self.digest = digest.clone();
        Ok(digest)
    }

    /// Read and version-check the identity manifest.
    pub fn read_identity_metadata(&self) -> Result<IdentityManifest, DatasetError> {
        let path = self.dataset_dir.join(IDENTITY_FILE);
        let json = fs::read_to_string(&path).map_err(|e| DatasetError::io(&path, e))?;
        let manifest: IdentityManifest = serde_json::from_str(&json)?;
        if manifest.layout_version != LAYOUT_VERSION {
            return Err(DatasetError::InvalidLayoutVersion {
                found: manifest.layout_version,
                expected: LAYOUT_VERSION,
            });
        }
        Ok(manifest)
    }

    /// Full identity check: recompute every file digest and require an exact
    /// bidirectional match with the manifest. Never repairs anything.
    pub fn validate_identity_metadata(&self) -> Result<(), DatasetError> {
        let manifest = self.read_identity_metadata()?;
        let actual = self.compute_identity_from_files()?;
        self.compare_identities(&manifest, &actual, true)
    }

    /// Weak identity check: file presence and size only. Same failure
    /// taxonomy as the full check, much cheaper.
    pub fn weak_validate_identity_metadata(&self) -> Result<(), DatasetError> {
        let manifest = self.read_identity_metadata()?;
        let mut actual = Vec::new();
        for relative in self.each_important_file()? {
            let absolute = self.dataset_dir.join(&relative);
            let size = fs::metadata(&absolute)
                .map_err(|e| DatasetError::io(&absolute, e))?
                .len();
            actual.push(IdentityEntry {
                path: relative.to_string_lossy().replace('\\', "/"),
                size,
                // Placeholder, not compared in weak mode.
                sha256: manifest
                    .identity
                    .iter()
                    .find(|e| e.path == relative.to_string_lossy())
                    .map(|e| e.sha256.clone())
                    .unwrap_or_else(|| manifest.digest.clone()),
            });
        }
        self.compare_identities(&manifest, &actual, false)
    }

    fn compare_identities(
        &self,
        manifest: &IdentityManifest,
        actual: &[IdentityEntry],
        check_digests: bool,
    ) -> Result<(), DatasetError> {
        let expected: BTreeMap<&str, &IdentityEntry> = manifest
            .identity
            .iter()
            .map(|e| (e.path.as_str(), e))
            .collect();
        let found: BTreeMap<&str, &IdentityEntry> =
            actual.iter().map(|e| (e.path.as_str(), e)).collect();

        for (path, entry) in &expected {
            let Some(on_disk) = found.get(path) else {
                return Err(DatasetError::MissingFile {
                    path: path.to_string(),
                });
            };
            if on_disk.size != entry.size {
                return Err(DatasetError::SizeMismatch {
                    path: path.to_string(),
                    expected: entry.size,
                    actual: on_disk.size,
                });
            }
            if check_digests && on_disk.sha256 != entry.sha256 {
                return Err(DatasetError::DigestMismatch {
                    path: path.to_string(),
                    expected: entry.sha256.clone(),
                    actual: on_disk.sha256.clone(),
                });
            }
        }
        for path in found.keys() {
            if !expected.contains_key(path) {
                return Err(DatasetError::ExtraFile {
                    path: path.to_string(),
                });
            }
        }

        if check_digests {
            let recomputed = digest_dataset(actual);
            if recomputed != manifest.digest {
                return Err(DatasetError::DatasetDigestMismatch {
                    expected: manifest.digest.clone(),
                    actual: recomputed,
                });
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Metadata
    // -------------------------------------------------------------------------

    /// The metadata map, loaded from disk on first access. A missing metadata
    /// file reads as empty.
    pub fn metadata(&mut self) -> Result<&MetadataMap, DatasetError> {
        if self.metadata.is_none() {
            let path = self.dataset_dir.join(METADATA_FILE);
            let map = match fs::read_to_string(&path) {
                Ok(json) => {
                    let raw: BTreeMap<String, Vec<String>> = serde_json::from_str(&json)?;
                    raw.into_iter()
                        .map(|(k, v)| (k, v.into_iter().collect()))
                        .collect()
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => MetadataMap::new(),
                Err(e) => return Err(DatasetError::io(&path, e)),
            };
            self.metadata = Some(map);
        }
        Ok(self.metadata.as_ref().expect("just loaded"))
    }

    /// Union values into a key's value set.
    pub fn metadata_add<I, S>(&mut self, key: &str, values: I) -> Result<(), DatasetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata()?;
        let map = self.metadata.as_mut().expect("loaded");
        let set = map.entry(key.to_string()).or_default();
        set.extend(values.into_iter().map(Into::into));
        Ok(())
    }

    /// Replace a key's value set.
    pub fn metadata_set<I, S>(&mut self, key: &str, values: I) -> Result<(), DatasetError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata()?;
        let map = self.metadata.as_mut().expect("loaded");
        map.insert(
            key.to_string(),
            values.into_iter().map(Into::into).collect(),
        );
        Ok(())
    }

    /// Fetch a key expected to hold exactly one value.
    pub fn metadata_fetch(&mut self, key: &str) -> Result<String, DatasetError> {
        let set = self.metadata_fetch_all(key)?;
        match set.len() {
            0 => Err(DatasetError::NoValue {
                key: key.to_string(),
            }),
            1 => Ok(set.into_iter().next().expect("one value")),
            _ => Err(DatasetError::MultipleValues {
                key: key.to_string(),
                values: set.into_iter().collect(),
            }),
        }
    }

    /// Fetch a scalar with a fallback for absent keys. Still fails on
    /// genuinely ambiguous (multi-valued) keys.
    pub fn metadata_fetch_or(&mut self, key: &str, default: &str) -> Result<String, DatasetError> {
        match self.metadata_fetch(key) {
            Err(DatasetError::NoValue { .. }) => Ok(default.to_string()),
            other => other,
        }
    }

    /// The full value set for a key; empty when absent.
    pub fn metadata_fetch_all(&mut self, key: &str) -> Result<BTreeSet<String>, DatasetError> {
        Ok(self.metadata()?.get(key).cloned().unwrap_or_default())
    }

    /// Persist the metadata map.
    pub fn metadata_write(&mut self) -> Result<(), DatasetError> {
        self.metadata()?;
        let map = self.metadata.as_ref().expect("loaded");
        let raw: BTreeMap<&String, Vec<&String>> =
            map.iter().map(|(k, v)| (k, v.iter().collect())).collect();
        let path = self.dataset_dir.join(METADATA_FILE);
        let json = serde_json::to_string_pretty(&raw)?;
        fs::write(&path, json).map_err(|e| DatasetError::io(&path, e))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Load all streams of all log files. Index fast path per file, scan slow
    /// path (which also refreshes the cache) otherwise.
    pub fn streams(&self, ctx: &mut Context) -> Result<Streams, DatasetError> {
        let mut streams = Vec::new();
        for relative in self.each_important_file()? {
            let log_path = self.dataset_dir.join(&relative);
            let mut idx_relative = relative.clone();
            idx_relative.set_extension(INDEX_EXTENSION);
            let idx_path = self.cache_dir.join(&idx_relative);

            let index = Rc::new(FileIndex::load_or_build(&log_path, &idx_path)?);
            debug!(
                log = %log_path.display(),
                streams = index.streams.len(),
                "log file streams loaded"
            );
            for slot in 0..index.streams.len() {
                streams.push(LazyStream::from_index(
                    index.clone(),
                    slot,
                    log_path.clone(),
                    idx_path.clone(),
                    &mut ctx.registry,
                )?);
            }
        }
        Ok(Streams { streams })
    }
}

fn collect_log_files(root: &Path, relative: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(root.join(relative))? {
        let entry = entry?;
        let name = entry.file_name();
        let child = relative.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_log_files(root, &child, out)?;
        } else if child.extension().map_or(false, |e| e == LOG_EXTENSION) {
            out.push(child);
        }
    }
    Ok(())
}

// =============================================================================
// STREAM COLLECTIONS
// =============================================================================

/// All streams of a dataset, with explicit lookup helpers.
pub struct Streams {
    streams: Vec<LazyStream>,
}

impl Streams {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LazyStream> {
        self.streams.iter()
    }

    /// Find a stream by full name.
    pub fn find_stream(&self, name: &str) -> Option<&LazyStream> {
        self.streams.iter().find(|s| s.name() == name)
    }

    /// Task names, derived from the `task.port` stream naming convention.
    pub fn task_names(&self) -> BTreeSet<String> {
        self.streams
            .iter()
            .filter_map(|s| task_name_of(s.name()))
            .map(str::to_string)
            .collect()
    }

    /// Streams of one task, or `None` when no stream belongs to it.
    pub fn find_task_by_name(&self, name: &str) -> Option<TaskStreams> {
        let streams: Vec<LazyStream> = self
            .streams
            .iter()
            .filter(|s| task_name_of(s.name()) == Some(name))
            .cloned()
            .collect();
        if streams.is_empty() {
            None
        } else {
            Some(TaskStreams {
                task_name: name.to_string(),
                streams,
            })
        }
    }

    /// All tasks, in name order.
    pub fn each_task(&self) -> Vec<TaskStreams> {
        self.task_names()
            .iter()
            .filter_map(|name| self.find_task_by_name(name))
            .collect()
    }
}

/// The streams of one task (shared handles into the dataset).
pub struct TaskStreams {
    pub task_name: String,
    pub streams: Vec<LazyStream>,
}

impl TaskStreams {
    /// Find a stream of this task by port name.
    pub fn find_port(&self, port: &str) -> Option<&LazyStream> {
        self.streams
            .iter()
            .find(|s| s.name().rsplit_once('.').map(|(_, p)| p) == Some(port))
    }
}

fn task_name_of(stream_name: &str) -> Option<&str> {
    stream_name.rsplit_once('.').map(|(task, _)| task)
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum DatasetError {
    Io { path: String, source: io::Error },
    Digest(DigestError),
    Index(IndexError),
    Stream(StreamError),
    Json(serde_json::Error),
    /// Manifest written by an incompatible layout version.
    InvalidLayoutVersion { found: u32, expected: u32 },
    /// Identity mismatch: a manifest entry has no file on disk.
    MissingFile { path: String },
    /// Identity mismatch: a file on disk is not listed in the manifest.
    ExtraFile { path: String },
    /// Identity mismatch: sizes differ for a listed file.
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    /// Identity mismatch: digests differ for a listed file.
    DigestMismatch {
        path: String,
        expected: ContentDigest,
        actual: ContentDigest,
    },
    /// The recomputed dataset digest does not match the manifest.
    DatasetDigestMismatch {
        expected: ContentDigest,
        actual: ContentDigest,
    },
    /// A scalar fetch found no value for the key.
    NoValue { key: String },
    /// A scalar fetch found more than one value for the key.
    MultipleValues { key: String, values: Vec<String> },
}

impl DatasetError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl fmt::Display for DatasetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "dataset I/O error on {}: {}", path, source),
            Self::Digest(e) => write!(f, "{}", e),
            Self::Index(e) => write!(f, "{}", e),
            Self::Stream(e) => write!(f, "{}", e),
            Self::Json(e) => write!(f, "dataset manifest parse error: {}", e),
            Self::InvalidLayoutVersion { found, expected } => {
                write!(f, "unsupported dataset layout version {} (expected {})", found, expected)
            }
            Self::MissingFile { path } => {
                write!(f, "identity mismatch: {} listed in manifest but missing on disk", path)
            }
            Self::ExtraFile { path } => {
                write!(f, "identity mismatch: {} present on disk but not in manifest", path)
            }
            Self::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "identity mismatch: {} has size {} (manifest says {})",
                path, actual, expected
            ),
            Self::DigestMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "identity mismatch: {} has digest {} (manifest says {})",
                path, actual, expected
            ),
            Self::DatasetDigestMismatch { expected, actual } => write!(
                f,
                "dataset digest mismatch: recomputed {} but manifest says {}",
                actual, expected
            ),
            Self::NoValue { key } => write!(f, "no metadata value for key {:?}", key),
            Self::MultipleValues { key, values } => write!(
                f,
                "multiple metadata values for key {:?}: {}",
                key,
                values.join(", ")
            ),
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Digest(e) => Some(e),
            Self::Index(e) => Some(e),
            Self::Stream(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DigestError> for DatasetError {
    fn from(e: DigestError) -> Self {
        Self::Digest(e)
    }
}

impl From<IndexError> for DatasetError {
    fn from(e: IndexError) -> Self {
        Self::Index(e)
    }
}

impl From<StreamError> for DatasetError {
    fn from(e: StreamError) -> Self {
        Self::Stream(e)
    }
}

impl From<serde_json::Error> for DatasetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::LogWriter;
    use std::collections::BTreeMap as Meta;

    /// Build a dataset directory with two log files and a written manifest.
    fn make_dataset(root: &Path) -> Dataset {
        let dataset_dir = root.join("dataset");
        let cache_dir = root.join("cache");
        fs::create_dir_all(&dataset_dir).unwrap();
        fs::create_dir_all(&cache_dir).unwrap();

        {
            let mut writer =
                LogWriter::create(&dataset_dir.join("imu.rlog"), false).unwrap();
            let sid = writer
                .declare_stream("imu.orientation", "/base/Quaterniond", "", &Meta::new())
                .unwrap();
            for i in 0..5i64 {
                writer.append_sample(sid, i, i * 10, b"q").unwrap();
            }
            writer.flush().unwrap();
        }
        {
            let mut writer =
                LogWriter::create(&dataset_dir.join("gps.rlog"), false).unwrap();
            let sid = writer
                .declare_stream("gps.position", "/base/Position", "", &Meta::new())
                .unwrap();
            writer.append_sample(sid, 3, 15, b"p").unwrap();
            writer.flush().unwrap();
        }

        // Placeholder digest until the manifest is written
        let placeholder = ContentDigest::parse(&"0".repeat(64)).unwrap();
        let mut dataset = Dataset::new(placeholder, dataset_dir, cache_dir);
        let identity = dataset.compute_identity_from_files().unwrap();
        dataset.write_identity_to_metadata_file(identity).unwrap();
        dataset
    }

    #[test]
    fn test_identity_roundtrip_validates() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());

        dataset.validate_identity_metadata().unwrap();
        dataset.weak_validate_identity_metadata().unwrap();
    }

    #[test]
    fn test_tamper_one_byte_fails_digest_for_that_path() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());

        // Flip one payload byte without changing the size
        let target = dataset.dataset_dir().join("imu.rlog");
        let mut bytes = fs::read(&target).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&target, bytes).unwrap();

        match dataset.validate_identity_metadata().unwrap_err() {
            DatasetError::DigestMismatch { path, .. } => assert_eq!(path, "imu.rlog"),
            other => panic!("expected DigestMismatch, got {}", other),
        }
        // Weak validation cannot see a same-size tamper
        dataset.weak_validate_identity_metadata().unwrap();
    }

    #[test]
    fn test_deleted_file_fails_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());
        fs::remove_file(dataset.dataset_dir().join("gps.rlog")).unwrap();

        match dataset.validate_identity_metadata().unwrap_err() {
            DatasetError::MissingFile { path } => assert_eq!(path, "gps.rlog"),
            other => panic!("expected MissingFile, got {}", other),
        }
        assert!(matches!(
            dataset.weak_validate_identity_metadata().unwrap_err(),
            DatasetError::MissingFile { .. }
        ));
    }

    #[test]
    fn test_unlisted_file_fails_as_extra() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());

        let mut writer =
            LogWriter::create(&dataset.dataset_dir().join("rogue.rlog"), false).unwrap();
        writer.flush().unwrap();

        match dataset.validate_identity_metadata().unwrap_err() {
            DatasetError::ExtraFile { path } => assert_eq!(path, "rogue.rlog"),
            other => panic!("expected ExtraFile, got {}", other),
        }
    }

    #[test]
    fn test_truncated_file_fails_weak_validation() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());

        let target = dataset.dataset_dir().join("imu.rlog");
        let bytes = fs::read(&target).unwrap();
        fs::write(&target, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(
            dataset.weak_validate_identity_metadata().unwrap_err(),
            DatasetError::SizeMismatch { .. }
        ));
    }

    #[test]
    fn test_invalid_layout_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());

        let path = dataset.dataset_dir().join(IDENTITY_FILE);
        let mut manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        manifest["layout_version"] = serde_json::json!(99);
        fs::write(&path, serde_json::to_string(&manifest).unwrap()).unwrap();

        assert!(matches!(
            dataset.read_identity_metadata().unwrap_err(),
            DatasetError::InvalidLayoutVersion { found: 99, expected: LAYOUT_VERSION }
        ));
    }

    #[test]
    fn test_metadata_accessors() {
        let dir = tempfile::tempdir().unwrap();
        let mut dataset = make_dataset(dir.path());

        assert!(matches!(
            dataset.metadata_fetch("robot").unwrap_err(),
            DatasetError::NoValue { .. }
        ));
        assert_eq!(dataset.metadata_fetch_or("robot", "unknown").unwrap(), "unknown");

        dataset.metadata_add("robot", ["artemis"]).unwrap();
        assert_eq!(dataset.metadata_fetch("robot").unwrap(), "artemis");

        dataset.metadata_add("robot", ["boreas"]).unwrap();
        match dataset.metadata_fetch("robot").unwrap_err() {
            DatasetError::MultipleValues { key, values } => {
                assert_eq!(key, "robot");
                assert_eq!(values, vec!["artemis".to_string(), "boreas".to_string()]);
            }
            other => panic!("expected MultipleValues, got {}", other),
        }
        assert_eq!(dataset.metadata_fetch_all("robot").unwrap().len(), 2);

        // Adding an existing value is a no-op union
        dataset.metadata_add("robot", ["artemis"]).unwrap();
        assert_eq!(dataset.metadata_fetch_all("robot").unwrap().len(), 2);

        // Persist and reload through a fresh handle
        dataset.metadata_write().unwrap();
        let mut reloaded = Dataset::new(
            dataset.digest().clone(),
            dataset.dataset_dir().to_path_buf(),
            dataset.cache_dir().to_path_buf(),
        );
        assert_eq!(reloaded.metadata_fetch_all("robot").unwrap().len(), 2);
    }

    #[test]
    fn test_streams_and_task_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = make_dataset(dir.path());
        let mut ctx = Context::new();

        let streams = dataset.streams(&mut ctx).unwrap();
        assert_eq!(streams.len(), 2);
        assert!(streams.find_stream("imu.orientation").is_some());
        assert!(streams.find_stream("nope").is_none());

        let tasks = streams.task_names();
        assert!(tasks.contains("imu"));
        assert!(tasks.contains("gps"));

        let imu = streams.find_task_by_name("imu").unwrap();
        assert_eq!(imu.streams.len(), 1);
        assert!(imu.find_port("orientation").is_some());
        assert!(streams.find_task_by_name("missing").is_none());

        // Second load hits the index fast path; summaries must agree
        let streams2 = dataset.streams(&mut ctx).unwrap();
        assert_eq!(
            streams2.find_stream("imu.orientation").unwrap().size(),
            streams.find_stream("imu.orientation").unwrap().size(),
        );
    }
}
