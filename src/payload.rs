//! Compressed payload stream.
//!
//! Every distinct blob of a pack is appended to one LZMA stream. The writer
//! hands back the uncompressed offset of each write; the reader walks the same
//! stream strictly front to back.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;
use xz2::read::XzDecoder;
use xz2::stream::{LzmaOptions, Stream};
use xz2::write::XzEncoder;

use crate::ArchiverError;

/// Compression preset used when none is configured.
pub const DEFAULT_LEVEL: u32 = 8;

fn lzma_encoder(level: u32) -> Result<Stream, ArchiverError> {
    let options = LzmaOptions::new_preset(level)?;
    Ok(Stream::new_lzma_encoder(&options)?)
}

fn lzma_decoder() -> Result<Stream, ArchiverError> {
    Ok(Stream::new_lzma_decoder(u64::MAX)?)
}

/// Compresses `data` as a standalone stream.
pub fn compress_block(data: &[u8], level: u32) -> Result<Vec<u8>, ArchiverError> {
    let mut encoder = XzEncoder::new_stream(Vec::new(), lzma_encoder(level)?);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`compress_block`].
pub fn decompress_block(data: &[u8]) -> Result<Vec<u8>, ArchiverError> {
    let mut decoder = XzDecoder::new_stream(data, lzma_decoder()?);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

struct ActiveOutput {
    path: PathBuf,
    encoder: XzEncoder<BufWriter<File>>,
}

/// Append-only compressed output. At most one stream is open at a time.
pub struct PayloadWriter {
    level: u32,
    active: Option<ActiveOutput>,
    written: u64,
}

impl PayloadWriter {
    pub fn new(level: u32) -> Self {
        PayloadWriter {
            level,
            active: None,
            written: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Creates `path` and starts a fresh stream on it.
    pub fn open(&mut self, path: &Path) -> Result<(), ArchiverError> {
        if self.active.is_some() {
            return Err(ArchiverError::AlreadyOpen);
        }
        let file = File::create(path).map_err(|e| ArchiverError::io(e, path))?;
        let encoder = XzEncoder::new_stream(BufWriter::new(file), lzma_encoder(self.level)?);
        self.active = Some(ActiveOutput {
            path: path.to_path_buf(),
            encoder,
        });
        self.written = 0;
        Ok(())
    }

    /// Appends `data` and returns the uncompressed offset of its first byte.
    pub fn write(&mut self, data: &[u8]) -> Result<u64, ArchiverError> {
        let out = self
            .active
            .as_mut()
            .ok_or_else(|| ArchiverError::InvalidArgument("payload output is not open".into()))?;
        let offset = self.written;
        out.encoder.write_all(data).map_err(|e| ArchiverError::io(e, &out.path))?;
        self.written += data.len() as u64;
        Ok(offset)
    }

    /// Uncompressed bytes written to the current stream so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finishes the stream and flushes it to disk. Returns the total number
    /// of uncompressed bytes written.
    pub fn close(&mut self) -> Result<u64, ArchiverError> {
        if let Some(out) = self.active.take() {
            let writer = out.encoder.finish().map_err(|e| ArchiverError::io(e, &out.path))?;
            let file = writer.into_inner().map_err(|e| ArchiverError::io(e.into_error(), &out.path))?;
            file.sync_all().map_err(|e| ArchiverError::io(e, &out.path))?;
            debug!(path = %out.path.display(), bytes = self.written, "payload stream closed");
        }
        Ok(self.written)
    }
}

/// Sequential cursor over a compressed payload span.
pub struct PayloadReader<R: Read> {
    decoder: XzDecoder<R>,
    consumed: u64,
}

impl<R: Read> PayloadReader<R> {
    /// `span` must yield exactly the compressed payload bytes.
    pub fn new(span: R) -> Result<Self, ArchiverError> {
        Ok(PayloadReader {
            decoder: XzDecoder::new_stream(span, lzma_decoder()?),
            consumed: 0,
        })
    }

    /// Reads the next `n` decompressed bytes.
    pub fn read_exactly(&mut self, n: u64) -> Result<Vec<u8>, ArchiverError> {
        let mut buf = Vec::with_capacity(n as usize);
        let got = (&mut self.decoder).take(n).read_to_end(&mut buf)? as u64;
        self.consumed += got;
        if got < n {
            return Err(ArchiverError::ShortRead { requested: n, available: got });
        }
        Ok(buf)
    }

    /// Decompressed bytes handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }
}
