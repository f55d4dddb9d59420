//! Streaming Sample Compression
//!
//! Byte-oriented compression adapter over `flate2`. The log layer treats this
//! as an opaque transform: bytes in, bytes out, with an explicit `finish` to
//! close a stream. Per-sample payloads use the one-shot helpers; the streaming
//! types exist for callers compressing across chunk boundaries.

use super::LogError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use std::io::{Read, Write};

/// Compress a complete buffer.
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, LogError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish().map_err(LogError::Io)
}

/// Decompress a complete buffer.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, LogError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| LogError::Compression(e.to_string()))?;
    Ok(out)
}

/// Incremental compressor with explicit flush/finish.
pub struct StreamCompressor {
    inner: Compress,
}

impl StreamCompressor {
    pub fn new() -> Self {
        Self {
            inner: Compress::new(Compression::default(), false),
        }
    }

    /// Feed a chunk, returning whatever compressed bytes are available.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, LogError> {
        self.run(chunk, FlushCompress::None)
    }

    /// Flush buffered input without ending the stream.
    pub fn flush(&mut self) -> Result<Vec<u8>, LogError> {
        self.run(&[], FlushCompress::Sync)
    }

    /// End the stream, returning the remaining compressed bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, LogError> {
        self.run(&[], FlushCompress::Finish)
    }

    fn run(&mut self, chunk: &[u8], flush: FlushCompress) -> Result<Vec<u8>, LogError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        let mut offset = 0;
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .compress(&chunk[offset..], &mut buf, flush)
                .map_err(|e| LogError::Compression(e.to_string()))?;
            offset += (self.inner.total_in() - before_in) as usize;
            out.extend_from_slice(&buf[..(self.inner.total_out() - before_out) as usize]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if offset >= chunk.len() && (self.inner.total_out() - before_out) == 0 {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for StreamCompressor {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental decompressor, the inverse of [`StreamCompressor`].
pub struct StreamDecompressor {
    inner: Decompress,
}

impl StreamDecompressor {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// Feed a compressed chunk, returning whatever plain bytes are available.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, LogError> {
        self.run(chunk, FlushDecompress::None)
    }

    /// End the stream, returning the remaining decompressed bytes.
    pub fn finish(mut self) -> Result<Vec<u8>, LogError> {
        self.run(&[], FlushDecompress::Finish)
    }

    fn run(&mut self, chunk: &[u8], flush: FlushDecompress) -> Result<Vec<u8>, LogError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        let mut offset = 0;
        loop {
            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();
            let status = self
                .inner
                .decompress(&chunk[offset..], &mut buf, flush)
                .map_err(|e| LogError::Compression(e.to_string()))?;
            offset += (self.inner.total_in() - before_in) as usize;
            out.extend_from_slice(&buf[..(self.inner.total_out() - before_out) as usize]);

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if offset >= chunk.len() && (self.inner.total_out() - before_out) == 0 {
                        break;
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Default for StreamDecompressor {
    fn default() -> Self {
        Self::new()
    }
}
