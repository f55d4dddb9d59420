//! Log Reader
//!
//! Sequential block iteration plus positional sample reads. The positional
//! path is what the per-stream index uses to seek by sample index without
//! rescanning the file.

use super::{
    compress, BlockKind, LogError, Sample, BLOCK_HEADER_SIZE, FLAG_COMPRESSED, FORMAT_VERSION,
    MAGIC, PROLOGUE_SIZE,
};
use crate::replay::time::Nanos;
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// One raw block as stored on disk, payload undecoded.
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Byte offset of the block header.
    pub position: u64,
    pub kind: BlockKind,
    pub stream_id: u16,
    pub payload: Vec<u8>,
}

/// Decoded stream declaration block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDeclaration {
    pub stream_id: u16,
    pub name: String,
    pub type_name: String,
    pub type_definition: String,
    pub metadata: BTreeMap<String, String>,
}

pub struct LogReader {
    input: BufReader<File>,
    /// Offset of the next block header in sequential iteration.
    offset: u64,
    flags: u32,
}

impl LogReader {
    /// Open a log file and validate its prologue.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let file = File::open(path)?;
        let mut input = BufReader::new(file);

        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|_| LogError::TruncatedBlock { position: 0 })?;
        if magic != MAGIC {
            return Err(LogError::BadMagic { found: magic });
        }
        let version = input.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(LogError::UnsupportedVersion {
                found: version,
                expected: FORMAT_VERSION,
            });
        }
        let flags = input.read_u32::<LittleEndian>()?;

        Ok(Self {
            input,
            offset: PROLOGUE_SIZE,
            flags,
        })
    }

    /// Whether sample data bytes are deflate-compressed.
    #[inline]
    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Read the next block in file order, or `None` at end-of-file.
    pub fn next_block(&mut self) -> Result<Option<RawBlock>, LogError> {
        let position = self.offset;

        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        match self.input.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LogError::Io(e)),
        }

        let kind_byte = header[0];
        let kind = BlockKind::from_u8(kind_byte).ok_or(LogError::UnknownBlockKind {
            kind: kind_byte,
            position,
        })?;
        let stream_id = u16::from_le_bytes([header[1], header[2]]);
        let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let mut payload = vec![0u8; payload_len];
        self.input
            .read_exact(&mut payload)
            .map_err(|_| LogError::TruncatedBlock { position })?;

        self.offset = position + BLOCK_HEADER_SIZE + payload_len as u64;
        Ok(Some(RawBlock {
            position,
            kind,
            stream_id,
            payload,
        }))
    }

    /// Read the sample block at a known byte offset.
    pub fn read_sample_at(&mut self, position: u64) -> Result<Sample, LogError> {
        self.input.seek(SeekFrom::Start(position))?;
        self.offset = position;
        let block = self
            .next_block()?
            .ok_or(LogError::TruncatedBlock { position })?;
        if block.kind != BlockKind::Sample {
            return Err(LogError::UnexpectedBlock {
                position,
                found: block.kind as u8,
            });
        }
        self.decode_sample(&block)
    }

    /// Decode a sample block payload, decompressing when the file requires it.
    pub fn decode_sample(&self, block: &RawBlock) -> Result<Sample, LogError> {
        if block.payload.len() < 16 {
            return Err(LogError::TruncatedBlock {
                position: block.position,
            });
        }
        let mut cursor = &block.payload[..];
        let realtime: Nanos = cursor.read_i64::<LittleEndian>()?;
        let logical: Nanos = cursor.read_i64::<LittleEndian>()?;
        let data = if self.compressed() {
            compress::inflate(cursor)?
        } else {
            cursor.to_vec()
        };
        Ok(Sample {
            realtime,
            logical,
            data,
        })
    }

    /// Decode the timestamps of a sample block without touching its data bytes.
    pub fn decode_sample_times(block: &RawBlock) -> Result<(Nanos, Nanos), LogError> {
        if block.payload.len() < 16 {
            return Err(LogError::TruncatedBlock {
                position: block.position,
            });
        }
        let mut cursor = &block.payload[..];
        let realtime = cursor.read_i64::<LittleEndian>()?;
        let logical = cursor.read_i64::<LittleEndian>()?;
        Ok((realtime, logical))
    }

    /// Decode a stream declaration block payload.
    pub fn decode_declaration(block: &RawBlock) -> Result<StreamDeclaration, LogError> {
        if block.kind != BlockKind::StreamDeclaration {
            return Err(LogError::UnexpectedBlock {
                position: block.position,
                found: block.kind as u8,
            });
        }
        let mut cursor = &block.payload[..];
        let name = read_str16(&mut cursor)?;
        let type_name = read_str16(&mut cursor)?;
        let type_definition = read_str32(&mut cursor)?;
        let count = cursor.read_u16::<LittleEndian>()?;
        let mut metadata = BTreeMap::new();
        for _ in 0..count {
            let key = read_str16(&mut cursor)?;
            let value = read_str16(&mut cursor)?;
            metadata.insert(key, value);
        }
        Ok(StreamDeclaration {
            stream_id: block.stream_id,
            name,
            type_name,
            type_definition,
            metadata,
        })
    }
}

fn read_str16(cursor: &mut &[u8]) -> Result<String, LogError> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    read_str(cursor, len)
}

fn read_str32(cursor: &mut &[u8]) -> Result<String, LogError> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    read_str(cursor, len)
}

fn read_str(cursor: &mut &[u8], len: usize) -> Result<String, LogError> {
    if cursor.len() < len {
        return Err(LogError::BadDeclaration {
            reason: format!("string length {} exceeds remaining payload", len),
        });
    }
    let (bytes, rest) = cursor.split_at(len);
    *cursor = rest;
    String::from_utf8(bytes.to_vec()).map_err(|_| LogError::BadDeclaration {
        reason: "non-UTF-8 string".to_string(),
    })
}
