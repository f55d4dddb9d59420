//! Lazy Stream Handles
//!
//! A [`LazyStream`] is a handle to one named, typed stream inside a log file.
//! Construction only needs the index summary; the backing file is opened and
//! the sample position table loaded on the first read operation, then cached
//! for the handle's lifetime.
//!
//! Narrowing the logical-time interval (`from_logical_time`/`to_logical_time`)
//! returns a *new* handle sharing the same backing; it only adjusts bounds and
//! never touches disk. The positional seek implied by the bounds happens
//! lazily on first read.

use crate::logfile::{LogError, LogReader, Sample};
use crate::replay::time::{Nanos, TimeInterval};
use crate::stream::index::{FileIndex, IndexError, SamplePosition};
use crate::stream::typereg::{TypeDescriptor, TypeError, TypeRegistry};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::debug;

// =============================================================================
// BACKING
// =============================================================================

/// Shared backing of one stream: paths, the file index, and the lazily
/// opened reader + position table.
struct StreamBacking {
    log_path: PathBuf,
    idx_path: PathBuf,
    /// Slot of this stream in the file index.
    slot: usize,
    index: Rc<FileIndex>,
    opened: Option<OpenedStream>,
}

struct OpenedStream {
    reader: LogReader,
    positions: Vec<SamplePosition>,
}

impl StreamBacking {
    fn ensure_open(&mut self) -> Result<&mut OpenedStream, StreamError> {
        if self.opened.is_none() {
            let reader = LogReader::open(&self.log_path)?;
            let positions = self.index.load_positions(&self.idx_path, self.slot)?;
            debug!(
                log = %self.log_path.display(),
                samples = positions.len(),
                "stream backing opened"
            );
            self.opened = Some(OpenedStream { reader, positions });
        }
        Ok(self.opened.as_mut().expect("just opened"))
    }
}

// =============================================================================
// LAZY STREAM
// =============================================================================

/// Deferred-open handle to one data stream.
#[derive(Clone)]
pub struct LazyStream {
    name: String,
    typ: TypeDescriptor,
    metadata: BTreeMap<String, String>,
    /// Total sample count of the backing stream (un-narrowed).
    size: u64,
    interval_realtime: Option<TimeInterval>,
    interval_logicaltime: Option<TimeInterval>,
    /// Narrowing bounds on logical time, inclusive.
    from: Option<Nanos>,
    to: Option<Nanos>,
    backing: Rc<RefCell<StreamBacking>>,
}

impl LazyStream {
    /// Build a handle from a file index slot, resolving the stream's type
    /// through the registry.
    pub fn from_index(
        index: Rc<FileIndex>,
        slot: usize,
        log_path: PathBuf,
        idx_path: PathBuf,
        registry: &mut TypeRegistry,
    ) -> Result<Self, StreamError> {
        let summary = &index.streams[slot];
        let typ = registry.resolve(&summary.typ)?;
        Ok(Self {
            name: summary.name.clone(),
            typ,
            metadata: summary.metadata.clone(),
            size: summary.size,
            interval_realtime: summary.interval_realtime,
            interval_logicaltime: summary.interval_logicaltime,
            from: None,
            to: None,
            backing: Rc::new(RefCell::new(StreamBacking {
                log_path,
                idx_path,
                slot,
                index,
                opened: None,
            })),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.typ
    }

    #[inline]
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Total sample count of the backing stream, ignoring narrowing.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Recorded realtime interval of the backing stream.
    #[inline]
    pub fn interval_realtime(&self) -> Option<TimeInterval> {
        self.interval_realtime
    }

    /// Logical-time interval, with narrowing bounds applied. Computed from
    /// recorded bounds only; never opens the file.
    pub fn interval_logicaltime(&self) -> Option<TimeInterval> {
        self.interval_logicaltime
            .and_then(|interval| interval.clamp(self.from, self.to))
    }

    /// Narrow to samples with logical time `>= t`. Returns a new handle
    /// sharing the backing; no disk access.
    pub fn from_logical_time(&self, t: Nanos) -> LazyStream {
        let mut narrowed = self.clone();
        narrowed.from = Some(self.from.map_or(t, |existing| existing.max(t)));
        narrowed
    }

    /// Narrow to samples with logical time `<= t`. Returns a new handle
    /// sharing the backing; no disk access.
    pub fn to_logical_time(&self, t: Nanos) -> LazyStream {
        let mut narrowed = self.clone();
        narrowed.to = Some(self.to.map_or(t, |existing| existing.min(t)));
        narrowed
    }

    /// Whether the backing file has been opened yet.
    pub fn is_open(&self) -> bool {
        self.backing.borrow().opened.is_some()
    }

    /// Sample count within the narrowed interval. Opens the backing when
    /// narrowed; otherwise answered from the summary.
    pub fn sample_count(&self) -> Result<u64, StreamError> {
        if self.from.is_none() && self.to.is_none() {
            return Ok(self.size);
        }
        let (begin, end) = self.narrowed_range()?;
        Ok(end - begin)
    }

    /// Logical time of the idx-th sample within the narrowed interval, from
    /// the position table only (no payload read).
    pub fn logical_time_at(&self, idx: u64) -> Result<Option<Nanos>, StreamError> {
        let (begin, end) = self.narrowed_range()?;
        let absolute = begin + idx;
        if absolute >= end {
            return Ok(None);
        }
        let backing = self.backing.borrow();
        let opened = backing.opened.as_ref().expect("opened by narrowed_range");
        Ok(Some(opened.positions[absolute as usize].logical))
    }

    /// Read the idx-th sample within the narrowed interval.
    pub fn sample_at(&self, idx: u64) -> Result<Option<Sample>, StreamError> {
        let (begin, end) = self.narrowed_range()?;
        let absolute = begin + idx;
        if absolute >= end {
            return Ok(None);
        }
        let mut backing = self.backing.borrow_mut();
        let opened = backing.ensure_open()?;
        let position = opened.positions[absolute as usize].position;
        Ok(Some(opened.reader.read_sample_at(position)?))
    }

    /// Relative index of the first narrowed sample with logical time `>= t`.
    /// Equal to the narrowed sample count when every sample is earlier.
    pub fn first_index_at_or_after(&self, t: Nanos) -> Result<u64, StreamError> {
        let (begin, end) = self.narrowed_range()?;
        let backing = self.backing.borrow();
        let opened = backing.opened.as_ref().expect("opened by narrowed_range");
        let slice = &opened.positions[begin as usize..end as usize];
        Ok(slice.partition_point(|p| p.logical < t) as u64)
    }

    /// Iterate samples within the narrowed interval.
    pub fn iter(&self) -> SampleIter<'_> {
        SampleIter {
            stream: self,
            next: 0,
        }
    }

    /// Absolute [begin, end) range of the narrowed interval in the position
    /// table. First call opens the backing.
    fn narrowed_range(&self) -> Result<(u64, u64), StreamError> {
        let mut backing = self.backing.borrow_mut();
        let opened = backing.ensure_open()?;
        let positions = &opened.positions;
        let begin = match self.from {
            Some(t) => positions.partition_point(|p| p.logical < t) as u64,
            None => 0,
        };
        let end = match self.to {
            Some(t) => positions.partition_point(|p| p.logical <= t) as u64,
            None => positions.len() as u64,
        };
        Ok((begin, end.max(begin)))
    }
}

impl fmt::Debug for LazyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyStream")
            .field("name", &self.name)
            .field("type", &self.typ.name)
            .field("size", &self.size)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Iterator over a stream's samples, in file order.
pub struct SampleIter<'a> {
    stream: &'a LazyStream,
    next: u64,
}

impl Iterator for SampleIter<'_> {
    type Item = Result<Sample, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.stream.sample_at(self.next) {
            Ok(Some(sample)) => {
                self.next += 1;
                Some(Ok(sample))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum StreamError {
    Io(io::Error),
    Index(IndexError),
    Log(LogError),
    Type(TypeError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "stream I/O error: {}", e),
            Self::Index(e) => write!(f, "stream index error: {}", e),
            Self::Log(e) => write!(f, "stream log error: {}", e),
            Self::Type(e) => write!(f, "stream type error: {}", e),
        }
    }
}

impl std::error::Error for StreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Index(e) => Some(e),
            Self::Log(e) => Some(e),
            Self::Type(e) => Some(e),
        }
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<IndexError> for StreamError {
    fn from(e: IndexError) -> Self {
        Self::Index(e)
    }
}

impl From<LogError> for StreamError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

impl From<TypeError> for StreamError {
    fn from(e: TypeError) -> Self {
        Self::Type(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================
