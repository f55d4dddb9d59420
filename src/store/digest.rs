//! Content Digests
//!
//! SHA-256 content hashing for dataset identity and integrity verification.
//!
//! # Identity Contract
//!
//! A dataset's identity is the SHA-256 of its sorted identity entries, each
//! serialized as `"<digest> <size> <relative_path>"` and joined by newlines.
//! Sorting by relative path makes the result independent of filesystem
//! enumeration order. This encoding is a compatibility contract: it must stay
//! bit-exact across implementations so that independently computed digests of
//! the same dataset agree.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Length of a hex-encoded digest string.
pub const DIGEST_HEX_LEN: usize = 64;

/// Block size for streaming file digests. Performance knob only.
const DIGEST_BLOCK_SIZE: usize = 64 * 1024;

// =============================================================================
// DIGEST VALUE
// =============================================================================

/// A validated, lowercase hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Parse a digest string, validating length and hex alphabet.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        if s.len() != DIGEST_HEX_LEN {
            return Err(DigestError::InvalidFormat {
                value: s.to_string(),
                reason: format!("expected {} hex characters, got {}", DIGEST_HEX_LEN, s.len()),
            });
        }
        if let Some(c) = s.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(DigestError::InvalidFormat {
                value: s.to_string(),
                reason: format!("invalid character {:?} (lowercase hex expected)", c),
            });
        }
        Ok(Self(s.to_string()))
    }

    fn from_hash(hash: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(hash))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated hex prefix, used for short digests. Never longer than the
    /// full digest.
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(DIGEST_HEX_LEN)]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// IDENTITY ENTRIES
// =============================================================================

/// One entry of a dataset's identity: a data-carrying file with its size and
/// content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityEntry {
    /// Path relative to the dataset directory, `/`-separated.
    pub path: String,
    /// Full on-disk size in bytes.
    pub size: u64,
    /// Digest of the file's semantic content (framing prologue excluded).
    pub sha256: ContentDigest,
}

// =============================================================================
// DIGEST OPERATIONS
// =============================================================================

/// Digest a whole file, streaming in fixed-size blocks.
pub fn digest_file(path: &Path) -> Result<ContentDigest, DigestError> {
    digest_file_skipping(path, 0)
}

/// Digest a file's content after skipping a fixed-size prefix.
///
/// Used for log files, whose prologue carries only framing (magic bytes,
/// format version) and would otherwise make the identity depend on incidental
/// framing details.
pub fn digest_file_skipping(path: &Path, skip: u64) -> Result<ContentDigest, DigestError> {
    let mut file = File::open(path).map_err(|e| DigestError::io(path, e))?;
    if skip > 0 {
        file.seek(SeekFrom::Start(skip))
            .map_err(|e| DigestError::io(path, e))?;
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| DigestError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ContentDigest::from_hash(&hasher.finalize()))
}

/// Compute the dataset identity digest from its identity entries.
///
/// The input order is irrelevant: entries are sorted by relative path before
/// hashing.
pub fn digest_dataset(entries: &[IdentityEntry]) -> ContentDigest {
    let mut sorted: Vec<&IdentityEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let serialized: Vec<String> = sorted
        .iter()
        .map(|e| format!("{} {} {}", e.sha256, e.size, e.path))
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(serialized.join("\n").as_bytes());
    ContentDigest::from_hash(&hasher.finalize())
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from digest parsing and computation.
#[derive(Debug)]
pub enum DigestError {
    /// A digest string that is not exactly [`DIGEST_HEX_LEN`] lowercase hex
    /// characters.
    InvalidFormat { value: String, reason: String },
    Io { path: String, source: io::Error },
}

impl DigestError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat { value, reason } => {
                write!(f, "invalid digest format {:?}: {}", value, reason)
            }
            Self::Io { path, source } => write!(f, "digest I/O error on {}: {}", path, source),
        }
    }
}

impl std::error::Error for DigestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn entry(path: &str, size: u64, seed: u8) -> IdentityEntry {
        let mut hasher = Sha256::new();
        hasher.update([seed]);
        IdentityEntry {
            path: path.to_string(),
            size,
            sha256: ContentDigest::from_hash(&hasher.finalize()),
        }
    }

    #[test]
    fn test_parse_accepts_valid_digest() {
        let hex = "a".repeat(DIGEST_HEX_LEN);
        let digest = ContentDigest::parse(&hex).unwrap();
        assert_eq!(digest.as_str(), hex);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = ContentDigest::parse("abc123").unwrap_err();
        assert!(matches!(err, DigestError::InvalidFormat { .. }));
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        let mut hex = "a".repeat(DIGEST_HEX_LEN - 1);
        hex.push('g');
        assert!(ContentDigest::parse(&hex).is_err());

        // Uppercase hex is not canonical either
        let upper = "A".repeat(DIGEST_HEX_LEN);
        assert!(ContentDigest::parse(&upper).is_err());
    }

    #[test]
    fn test_digest_dataset_order_invariant() {
        let entries = vec![
            entry("b/stream.rlog", 100, 1),
            entry("a/stream.rlog", 200, 2),
            entry("c/stream.rlog", 300, 3),
        ];
        let mut shuffled = entries.clone();
        shuffled.rotate_left(1);
        shuffled.swap(0, 1);

        assert_eq!(digest_dataset(&entries), digest_dataset(&shuffled));
    }

    #[test]
    fn test_digest_dataset_sensitive_to_content() {
        let entries = vec![entry("a.rlog", 100, 1)];
        let changed_size = vec![entry("a.rlog", 101, 1)];
        let changed_digest = vec![entry("a.rlog", 100, 2)];

        assert_ne!(digest_dataset(&entries), digest_dataset(&changed_size));
        assert_ne!(digest_dataset(&entries), digest_dataset(&changed_digest));
    }

    #[test]
    fn test_digest_file_skipping_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");

        // Same payload behind different 4-byte prefixes
        std::fs::File::create(&a)
            .unwrap()
            .write_all(b"AAAApayload")
            .unwrap();
        std::fs::File::create(&b)
            .unwrap()
            .write_all(b"BBBBpayload")
            .unwrap();

        assert_ne!(digest_file(&a).unwrap(), digest_file(&b).unwrap());
        assert_eq!(
            digest_file_skipping(&a, 4).unwrap(),
            digest_file_skipping(&b, 4).unwrap()
        );
    }
}
