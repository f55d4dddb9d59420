//! Sequential Log Writer
//!
//! Append-only writer preserving arrival order. Streams must be declared
//! before their first sample; declarations and samples may interleave freely
//! afterwards.

use super::{compress, BlockKind, LogError, BLOCK_HEADER_SIZE, FLAG_COMPRESSED, FORMAT_VERSION, MAGIC};
use crate::replay::time::Nanos;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

pub struct LogWriter {
    out: BufWriter<File>,
    /// Byte offset of the next block header.
    offset: u64,
    next_stream_id: u16,
    compressed: bool,
}

impl LogWriter {
    /// Create a new log file, truncating any existing one and writing the
    /// prologue.
    pub fn create(path: &Path, compressed: bool) -> Result<Self, LogError> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);

        out.write_all(&MAGIC)?;
        out.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        out.write_u32::<LittleEndian>(if compressed { FLAG_COMPRESSED } else { 0 })?;

        debug!(path = %path.display(), compressed, "log file created");
        Ok(Self {
            out,
            offset: super::PROLOGUE_SIZE,
            next_stream_id: 0,
            compressed,
        })
    }

    /// Declare a new stream, returning its id for subsequent samples.
    pub fn declare_stream(
        &mut self,
        name: &str,
        type_name: &str,
        type_definition: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<u16, LogError> {
        let stream_id = self.next_stream_id;
        self.next_stream_id = self
            .next_stream_id
            .checked_add(1)
            .ok_or_else(|| LogError::BadDeclaration {
                reason: "stream id space exhausted".to_string(),
            })?;

        let mut payload = Vec::new();
        write_str16(&mut payload, name)?;
        write_str16(&mut payload, type_name)?;
        write_str32(&mut payload, type_definition)?;
        payload.write_u16::<LittleEndian>(metadata.len() as u16)?;
        for (key, value) in metadata {
            write_str16(&mut payload, key)?;
            write_str16(&mut payload, value)?;
        }

        self.write_block(BlockKind::StreamDeclaration, stream_id, &payload)?;
        Ok(stream_id)
    }

    /// Append one sample. Returns the byte offset of its block header, which
    /// index builders record for positional reads.
    pub fn append_sample(
        &mut self,
        stream_id: u16,
        realtime: Nanos,
        logical: Nanos,
        data: &[u8],
    ) -> Result<u64, LogError> {
        if stream_id >= self.next_stream_id {
            return Err(LogError::UnknownStream {
                stream_id,
                position: self.offset,
            });
        }

        let mut payload = Vec::with_capacity(16 + data.len());
        payload.write_i64::<LittleEndian>(realtime)?;
        payload.write_i64::<LittleEndian>(logical)?;
        if self.compressed {
            payload.extend(compress::deflate(data)?);
        } else {
            payload.extend_from_slice(data);
        }

        self.write_block(BlockKind::Sample, stream_id, &payload)
    }

    fn write_block(
        &mut self,
        kind: BlockKind,
        stream_id: u16,
        payload: &[u8],
    ) -> Result<u64, LogError> {
        let position = self.offset;
        self.out.write_u8(kind as u8)?;
        self.out.write_u16::<LittleEndian>(stream_id)?;
        self.out.write_u8(0)?; // reserved
        self.out.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.out.write_all(payload)?;
        self.offset += BLOCK_HEADER_SIZE + payload.len() as u64;
        Ok(position)
    }

    pub fn flush(&mut self) -> Result<(), LogError> {
        self.out.flush()?;
        Ok(())
    }

    /// Total bytes written so far, prologue included.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }
}

fn write_str16(out: &mut Vec<u8>, s: &str) -> Result<(), LogError> {
    if s.len() > u16::MAX as usize {
        return Err(LogError::BadDeclaration {
            reason: format!("string too long ({} bytes)", s.len()),
        });
    }
    out.write_u16::<LittleEndian>(s.len() as u16)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn write_str32(out: &mut Vec<u8>, s: &str) -> Result<(), LogError> {
    out.write_u32::<LittleEndian>(s.len() as u32)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}
