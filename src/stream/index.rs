//! Per-File Stream Indexes
//!
//! A `.idx` file summarizes every stream of one log file (name, type,
//! metadata, sample count, time intervals) and carries a per-sample position
//! table, so streams can be enumerated and seeked without reading the raw
//! payload. Indexes are derived data: they live in the datastore's cache area
//! and are rebuilt by scanning the log whenever missing or stale.
//!
//! # Layout
//!
//! ```text
//! header:    magic "RIDX" | version u32 | created_at i64 | source size u64 | stream count u32
//! summary*:  stream id u16 | name | type name | type definition | metadata map
//!            | sample count u64 | realtime interval 2×i64 | logical interval 2×i64
//!            | table offset u64
//! table*:    (block position u64 | realtime i64 | logicaltime i64) × sample count
//! ```
//!
//! The recorded source file size gates staleness: an index whose source size
//! no longer matches the log file on disk is discarded and rebuilt.

use crate::logfile::{BlockKind, LogError, LogReader};
use crate::replay::time::{Nanos, TimeInterval};
use crate::stream::typereg::TypeDescriptor;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

pub const INDEX_MAGIC: [u8; 4] = *b"RIDX";
pub const INDEX_VERSION: u32 = 1;

/// Extension of index files inside the cache area.
pub const INDEX_EXTENSION: &str = "idx";

// =============================================================================
// INDEX MODEL
// =============================================================================

/// Position of one sample inside its log file, with its timestamp pair.
///
/// Time lookups during alignment hit this table only, never the log payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePosition {
    /// Byte offset of the sample's block header in the log file.
    pub position: u64,
    pub realtime: Nanos,
    pub logical: Nanos,
}

/// Summary of one stream: everything needed to enumerate it lazily.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub stream_id: u16,
    pub name: String,
    pub typ: TypeDescriptor,
    pub metadata: BTreeMap<String, String>,
    /// Total sample count in the backing file.
    pub size: u64,
    /// None when the stream is empty.
    pub interval_realtime: Option<TimeInterval>,
    pub interval_logicaltime: Option<TimeInterval>,
    /// Absolute byte offset of this stream's sample table in the index file.
    /// Zero until the index has been saved.
    pub table_offset: u64,
}

/// Index of one log file: header fields, stream summaries, and (when built by
/// scanning) the in-memory sample tables.
#[derive(Debug, Clone)]
pub struct FileIndex {
    pub created_at: Nanos,
    /// Size of the source log file when the index was built.
    pub source_size: u64,
    pub streams: Vec<StreamSummary>,
    /// Sample tables parallel to `streams`. Present after a scan; absent
    /// after a summary-only load (tables are then read positionally).
    tables: Option<Vec<Vec<SamplePosition>>>,
}

impl FileIndex {
    /// Build an index by scanning a log file.
    pub fn build_from_log(log_path: &Path) -> Result<FileIndex, IndexError> {
        let source_size = std::fs::metadata(log_path)?.len();
        let mut reader = LogReader::open(log_path)?;

        let mut streams: Vec<StreamSummary> = Vec::new();
        let mut tables: Vec<Vec<SamplePosition>> = Vec::new();
        let mut slot_of: BTreeMap<u16, usize> = BTreeMap::new();

        while let Some(block) = reader.next_block()? {
            match block.kind {
                BlockKind::StreamDeclaration => {
                    let decl = LogReader::decode_declaration(&block)?;
                    slot_of.insert(decl.stream_id, streams.len());
                    streams.push(StreamSummary {
                        stream_id: decl.stream_id,
                        name: decl.name,
                        typ: TypeDescriptor::new(decl.type_name, decl.type_definition),
                        metadata: decl.metadata,
                        size: 0,
                        interval_realtime: None,
                        interval_logicaltime: None,
                        table_offset: 0,
                    });
                    tables.push(Vec::new());
                }
                BlockKind::Sample => {
                    let slot = *slot_of.get(&block.stream_id).ok_or(LogError::UnknownStream {
                        stream_id: block.stream_id,
                        position: block.position,
                    })?;
                    let (realtime, logical) = LogReader::decode_sample_times(&block)?;
                    tables[slot].push(SamplePosition {
                        position: block.position,
                        realtime,
                        logical,
                    });

                    let summary = &mut streams[slot];
                    summary.size += 1;
                    let rt = TimeInterval::new(realtime, realtime);
                    let lg = TimeInterval::new(logical, logical);
                    summary.interval_realtime = Some(
                        summary
                            .interval_realtime
                            .map_or(rt, |existing| existing.union(&rt)),
                    );
                    summary.interval_logicaltime = Some(
                        summary
                            .interval_logicaltime
                            .map_or(lg, |existing| existing.union(&lg)),
                    );
                }
            }
        }

        debug!(
            path = %log_path.display(),
            streams = streams.len(),
            samples = tables.iter().map(|t| t.len()).sum::<usize>(),
            "log file scanned"
        );

        Ok(FileIndex {
            created_at: crate::replay::time::datetime_to_nanos(&chrono::Utc::now()),
            source_size,
            streams,
            tables: Some(tables),
        })
    }

    /// Save the index, filling in each summary's table offset.
    ///
    /// Only valid on an index built by [`build_from_log`](Self::build_from_log).
    pub fn save(&mut self, idx_path: &Path) -> Result<(), IndexError> {
        let tables = self.tables.as_ref().ok_or_else(|| IndexError::Corrupt {
            reason: "cannot save a summary-only index".to_string(),
        })?;

        if let Some(parent) = idx_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Two passes: measure the summary section with placeholder offsets
        // (offsets are fixed-width, so lengths do not change), then write for
        // real.
        let summaries_len: u64 = self
            .streams
            .iter()
            .map(|s| encode_summary(s).len() as u64)
            .sum();
        let header_len: u64 = 4 + 4 + 8 + 8 + 4;

        let mut offset = header_len + summaries_len;
        for (summary, table) in self.streams.iter_mut().zip(tables) {
            summary.table_offset = offset;
            offset += table.len() as u64 * 24;
        }

        let mut out = BufWriter::new(File::create(idx_path)?);
        out.write_all(&INDEX_MAGIC)?;
        out.write_u32::<LittleEndian>(INDEX_VERSION)?;
        out.write_i64::<LittleEndian>(self.created_at)?;
        out.write_u64::<LittleEndian>(self.source_size)?;
        out.write_u32::<LittleEndian>(self.streams.len() as u32)?;
        for summary in &self.streams {
            out.write_all(&encode_summary(summary))?;
        }
        for table in tables {
            for entry in table {
                out.write_u64::<LittleEndian>(entry.position)?;
                out.write_i64::<LittleEndian>(entry.realtime)?;
                out.write_i64::<LittleEndian>(entry.logical)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Load header and stream summaries only; sample tables stay on disk.
    ///
    /// Fails with [`IndexError::Stale`] when the recorded source size differs
    /// from `expected_source_size`.
    pub fn load_summary(
        idx_path: &Path,
        expected_source_size: u64,
    ) -> Result<FileIndex, IndexError> {
        let mut input = BufReader::new(File::open(idx_path)?);

        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != INDEX_MAGIC {
            return Err(IndexError::BadMagic { found: magic });
        }
        let version = input.read_u32::<LittleEndian>()?;
        if version != INDEX_VERSION {
            return Err(IndexError::UnsupportedVersion {
                found: version,
                expected: INDEX_VERSION,
            });
        }
        let created_at = input.read_i64::<LittleEndian>()?;
        let source_size = input.read_u64::<LittleEndian>()?;
        if source_size != expected_source_size {
            return Err(IndexError::Stale {
                recorded_size: source_size,
                actual_size: expected_source_size,
            });
        }
        let count = input.read_u32::<LittleEndian>()?;
        let mut streams = Vec::with_capacity(count as usize);
        for _ in 0..count {
            streams.push(decode_summary(&mut input)?);
        }

        Ok(FileIndex {
            created_at,
            source_size,
            streams,
            tables: None,
        })
    }

    /// Load a summary from the cache, rebuilding (and re-saving) the index
    /// from the log when it is missing, stale, or unreadable.
    pub fn load_or_build(log_path: &Path, idx_path: &Path) -> Result<FileIndex, IndexError> {
        let source_size = std::fs::metadata(log_path)?.len();
        match Self::load_summary(idx_path, source_size) {
            Ok(index) => Ok(index),
            Err(e) => {
                if idx_path.exists() {
                    warn!(
                        idx = %idx_path.display(),
                        error = %e,
                        "stream index unusable, rebuilding from log"
                    );
                }
                let mut index = Self::build_from_log(log_path)?;
                if let Err(save_err) = index.save(idx_path) {
                    // An unwritable cache degrades performance, not correctness.
                    warn!(
                        idx = %idx_path.display(),
                        error = %save_err,
                        "failed to write stream index"
                    );
                }
                Ok(index)
            }
        }
    }

    /// Read one stream's sample table, from memory when the index was built
    /// by a scan, positionally from disk otherwise.
    pub fn load_positions(
        &self,
        idx_path: &Path,
        slot: usize,
    ) -> Result<Vec<SamplePosition>, IndexError> {
        if let Some(tables) = &self.tables {
            return Ok(tables[slot].clone());
        }

        let summary = &self.streams[slot];
        let mut input = BufReader::new(File::open(idx_path)?);
        input.seek(SeekFrom::Start(summary.table_offset))?;
        let mut table = Vec::with_capacity(summary.size as usize);
        for _ in 0..summary.size {
            let position = input.read_u64::<LittleEndian>()?;
            let realtime = input.read_i64::<LittleEndian>()?;
            let logical = input.read_i64::<LittleEndian>()?;
            table.push(SamplePosition {
                position,
                realtime,
                logical,
            });
        }
        Ok(table)
    }
}

// =============================================================================
// SUMMARY CODEC
// =============================================================================

fn encode_summary(summary: &StreamSummary) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<LittleEndian>(summary.stream_id).unwrap();
    encode_str16(&mut out, &summary.name);
    encode_str16(&mut out, &summary.typ.name);
    encode_str32(&mut out, &summary.typ.definition);
    out.write_u16::<LittleEndian>(summary.metadata.len() as u16)
        .unwrap();
    for (key, value) in &summary.metadata {
        encode_str16(&mut out, key);
        encode_str16(&mut out, value);
    }
    out.write_u64::<LittleEndian>(summary.size).unwrap();
    let rt = summary.interval_realtime.unwrap_or(TimeInterval::new(0, 0));
    let lg = summary
        .interval_logicaltime
        .unwrap_or(TimeInterval::new(0, 0));
    out.write_i64::<LittleEndian>(rt.start).unwrap();
    out.write_i64::<LittleEndian>(rt.end).unwrap();
    out.write_i64::<LittleEndian>(lg.start).unwrap();
    out.write_i64::<LittleEndian>(lg.end).unwrap();
    out.write_u64::<LittleEndian>(summary.table_offset).unwrap();
    out
}

fn decode_summary<R: Read>(input: &mut R) -> Result<StreamSummary, IndexError> {
    let stream_id = input.read_u16::<LittleEndian>()?;
    let name = decode_str16(input)?;
    let type_name = decode_str16(input)?;
    let type_definition = decode_str32(input)?;
    let count = input.read_u16::<LittleEndian>()?;
    let mut metadata = BTreeMap::new();
    for _ in 0..count {
        let key = decode_str16(input)?;
        let value = decode_str16(input)?;
        metadata.insert(key, value);
    }
    let size = input.read_u64::<LittleEndian>()?;
    let rt_start = input.read_i64::<LittleEndian>()?;
    let rt_end = input.read_i64::<LittleEndian>()?;
    let lg_start = input.read_i64::<LittleEndian>()?;
    let lg_end = input.read_i64::<LittleEndian>()?;
    let table_offset = input.read_u64::<LittleEndian>()?;

    Ok(StreamSummary {
        stream_id,
        name,
        typ: TypeDescriptor::new(type_name, type_definition),
        metadata,
        size,
        interval_realtime: (size > 0).then(|| TimeInterval::new(rt_start, rt_end)),
        interval_logicaltime: (size > 0).then(|| TimeInterval::new(lg_start, lg_end)),
        table_offset,
    })
}

fn encode_str16(out: &mut Vec<u8>, s: &str) {
    out.write_u16::<LittleEndian>(s.len() as u16).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn encode_str32(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<LittleEndian>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn decode_str16<R: Read>(input: &mut R) -> Result<String, IndexError> {
    let len = input.read_u16::<LittleEndian>()? as usize;
    decode_str(input, len)
}

fn decode_str32<R: Read>(input: &mut R) -> Result<String, IndexError> {
    let len = input.read_u32::<LittleEndian>()? as usize;
    decode_str(input, len)
}

fn decode_str<R: Read>(input: &mut R, len: usize) -> Result<String, IndexError> {
    let mut bytes = vec![0u8; len];
    input.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| IndexError::Corrupt {
        reason: "non-UTF-8 string in index".to_string(),
    })
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug)]
pub enum IndexError {
    Io(io::Error),
    Log(LogError),
    BadMagic { found: [u8; 4] },
    UnsupportedVersion { found: u32, expected: u32 },
    /// The index no longer matches the log file it was built from.
    Stale { recorded_size: u64, actual_size: u64 },
    Corrupt { reason: String },
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "index I/O error: {}", e),
            Self::Log(e) => write!(f, "index build error: {}", e),
            Self::BadMagic { found } => {
                write!(f, "bad index magic: {:?}", String::from_utf8_lossy(found))
            }
            Self::UnsupportedVersion { found, expected } => {
                write!(f, "unsupported index version {} (expected {})", found, expected)
            }
            Self::Stale {
                recorded_size,
                actual_size,
            } => write!(
                f,
                "stale index: built for a {}-byte log, log is now {} bytes",
                recorded_size, actual_size
            ),
            Self::Corrupt { reason } => write!(f, "corrupt index: {}", reason),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Log(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for IndexError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<LogError> for IndexError {
    fn from(e: LogError) -> Self {
        Self::Log(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logfile::LogWriter;
    use std::collections::BTreeMap;

    fn write_fixture(path: &Path) {
        let mut writer = LogWriter::create(path, false).unwrap();
        let a = writer
            .declare_stream("odometry.pose", "/base/Pose", "struct { p : double[3] }", &BTreeMap::new())
            .unwrap();
        let b = writer
            .declare_stream("lidar.scan", "/base/Scan", "", &BTreeMap::new())
            .unwrap();
        writer.append_sample(a, 5, 100, b"p0").unwrap();
        writer.append_sample(b, 7, 150, b"s0").unwrap();
        writer.append_sample(a, 9, 200, b"p1").unwrap();
        writer.flush().unwrap();
    }

    #[test]
    fn test_build_scan() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fixture.rlog");
        write_fixture(&log);

        let index = FileIndex::build_from_log(&log).unwrap();
        assert_eq!(index.streams.len(), 2);

        let odo = &index.streams[0];
        assert_eq!(odo.name, "odometry.pose");
        assert_eq!(odo.size, 2);
        assert_eq!(odo.interval_logicaltime, Some(TimeInterval::new(100, 200)));
        assert_eq!(odo.interval_realtime, Some(TimeInterval::new(5, 9)));

        let positions = index.load_positions(Path::new("unused"), 0).unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0].logical, 100);
        assert_eq!(positions[1].logical, 200);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fixture.rlog");
        let idx = dir.path().join("cache/fixture.idx");
        write_fixture(&log);

        let mut built = FileIndex::build_from_log(&log).unwrap();
        built.save(&idx).unwrap();

        let loaded = FileIndex::load_summary(&idx, built.source_size).unwrap();
        assert_eq!(loaded.streams.len(), 2);
        assert_eq!(loaded.streams[0].name, built.streams[0].name);
        assert_eq!(loaded.streams[0].size, built.streams[0].size);
        assert_eq!(
            loaded.streams[0].interval_logicaltime,
            built.streams[0].interval_logicaltime
        );

        // Positional table reads match the scan
        for slot in 0..2 {
            let from_disk = loaded.load_positions(&idx, slot).unwrap();
            let from_scan = built.load_positions(&idx, slot).unwrap();
            assert_eq!(from_disk, from_scan);
        }
    }

    #[test]
    fn test_stale_index_detected_and_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("fixture.rlog");
        let idx = dir.path().join("fixture.idx");
        write_fixture(&log);

        let mut built = FileIndex::build_from_log(&log).unwrap();
        built.save(&idx).unwrap();

        // Grow the log file behind the index's back
        {
            let mut writer = LogWriter::create(&log, false).unwrap();
            let a = writer
                .declare_stream("odometry.pose", "/base/Pose", "", &BTreeMap::new())
                .unwrap();
            for i in 0..5 {
                writer.append_sample(a, i, i * 10, b"x").unwrap();
            }
            writer.flush().unwrap();
        }

        let new_size = std::fs::metadata(&log).unwrap().len();
        assert!(matches!(
            FileIndex::load_summary(&idx, new_size),
            Err(IndexError::Stale { .. })
        ));

        let rebuilt = FileIndex::load_or_build(&log, &idx).unwrap();
        assert_eq!(rebuilt.streams[0].size, 5);

        // The rebuild also refreshed the on-disk index
        let reloaded = FileIndex::load_summary(&idx, new_size).unwrap();
        assert_eq!(reloaded.streams[0].size, 5);
    }

    #[test]
    fn test_empty_stream_has_no_interval() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("empty.rlog");
        let mut writer = LogWriter::create(&log, false).unwrap();
        writer
            .declare_stream("silent.port", "/base/Void", "", &BTreeMap::new())
            .unwrap();
        writer.flush().unwrap();

        let index = FileIndex::build_from_log(&log).unwrap();
        assert_eq!(index.streams[0].size, 0);
        assert_eq!(index.streams[0].interval_logicaltime, None);
        assert_eq!(index.streams[0].interval_realtime, None);
    }
}
