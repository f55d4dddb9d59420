//! Raw Binary Log Files
//!
//! Framed multi-stream log file format. One file carries any number of named,
//! typed streams; every sample is tagged with its stream id and a
//! `(realtime, logicaltime)` timestamp pair.
//!
//! # Layout
//!
//! ```text
//! prologue (16 bytes):  magic "ROVERLOG" | format version u32 | flags u32
//! block*:
//!   header (8 bytes):   kind u8 | stream id u16 | reserved u8 | payload len u32
//!   payload:
//!     kind=1 declaration: name | type name | type definition | metadata map
//!     kind=2 sample:      realtime i64 | logicaltime i64 | data bytes
//! ```
//!
//! All integers are little-endian. When the `FLAG_COMPRESSED` prologue flag is
//! set, sample data bytes are deflate-compressed per sample.
//!
//! The prologue carries framing only, no semantic content; dataset identity
//! digests skip it (see [`crate::store::digest`]).

pub mod compress;
pub mod reader;
pub mod writer;

pub use reader::{LogReader, RawBlock, StreamDeclaration};
pub use writer::LogWriter;

use crate::replay::time::Nanos;
use std::fmt;
use std::io;

/// Prologue magic bytes.
pub const MAGIC: [u8; 8] = *b"ROVERLOG";

/// Current log file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Total prologue size in bytes.
pub const PROLOGUE_SIZE: u64 = 16;

/// Prologue flag: sample data bytes are deflate-compressed.
pub const FLAG_COMPRESSED: u32 = 1;

/// Block header size in bytes.
pub const BLOCK_HEADER_SIZE: u64 = 8;

/// Conventional extension of log files inside a dataset.
pub const LOG_EXTENSION: &str = "rlog";

/// Block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    StreamDeclaration = 1,
    Sample = 2,
}

impl BlockKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        match kind {
            1 => Some(Self::StreamDeclaration),
            2 => Some(Self::Sample),
            _ => None,
        }
    }
}

/// One decoded sample: its timestamp pair and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Wall-clock instant the sample was recorded.
    pub realtime: Nanos,
    /// Semantic timestamp; the alignment ordering key.
    pub logical: Nanos,
    pub data: Vec<u8>,
}

/// Errors from log file reading and writing.
#[derive(Debug)]
pub enum LogError {
    Io(io::Error),
    BadMagic { found: [u8; 8] },
    UnsupportedVersion { found: u32, expected: u32 },
    /// A block header or payload extended past end-of-file.
    TruncatedBlock { position: u64 },
    UnknownBlockKind { kind: u8, position: u64 },
    /// A sample referenced a stream id that was never declared.
    UnknownStream { stream_id: u16, position: u64 },
    /// Expected one block kind, found another (positional reads).
    UnexpectedBlock { position: u64, found: u8 },
    Compression(String),
    BadDeclaration { reason: String },
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "log I/O error: {}", e),
            Self::BadMagic { found } => {
                write!(f, "bad log file magic: {:?}", String::from_utf8_lossy(found))
            }
            Self::UnsupportedVersion { found, expected } => {
                write!(f, "unsupported log format version {} (expected {})", found, expected)
            }
            Self::TruncatedBlock { position } => {
                write!(f, "truncated block at offset {}", position)
            }
            Self::UnknownBlockKind { kind, position } => {
                write!(f, "unknown block kind {} at offset {}", kind, position)
            }
            Self::UnknownStream { stream_id, position } => {
                write!(f, "undeclared stream id {} at offset {}", stream_id, position)
            }
            Self::UnexpectedBlock { position, found } => {
                write!(f, "unexpected block kind {} at offset {}", found, position)
            }
            Self::Compression(reason) => write!(f, "sample compression error: {}", reason),
            Self::BadDeclaration { reason } => write!(f, "bad stream declaration: {}", reason),
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for LogError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
