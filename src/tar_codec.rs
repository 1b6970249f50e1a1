//! TAR container with optional compression
//!
//! Entries are written with GNU headers, which handle long paths and sizes
//! beyond the 8 GiB octal limit. The container is layered over one of the
//! [`TarCompression`] streams.
//!
//! A source that fails or shrinks after its header was written is padded with
//! zeros up to the declared size so the rest of the archive stays readable;
//! the entry is then reported as a per-entry failure.

use crate::block_compress::{Bzip2Blocks, GzipBlocks, ParallelBlockWriter};
use crate::codec::{source_error, ArchiveOutput, ArchiveSink, Codec};
use crate::context::BackupContext;
use crate::error::{ArchiveError, Result};
use crate::supplier::InputSupplier;
use crate::types::ArchiveFormat;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};
use tar::{Builder, EntryType, Header};
use tracing::{debug, warn};

/// Compression layer under the TAR container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    /// Plain TAR
    None,
    /// Single-threaded gzip
    Gzip,
    /// Block-parallel gzip
    ParallelGzip,
    /// Single-threaded bzip2
    Bzip2,
    /// Block-parallel bzip2
    ParallelBzip2,
    /// XZ (LZMA2), single-threaded
    Lzma,
}

/// TAR-family codec
#[derive(Debug, Clone)]
pub struct TarCodec {
    compression: TarCompression,
}

impl TarCodec {
    /// Codec with an explicit compression layer
    pub fn new(compression: TarCompression) -> Self {
        Self { compression }
    }

    /// Uncompressed TAR
    pub fn plain() -> Self {
        Self::new(TarCompression::None)
    }

    /// Sequential `.tar.gz`
    pub fn gzip() -> Self {
        Self::new(TarCompression::Gzip)
    }

    /// Parallel `.tar.gz`
    pub fn parallel_gzip() -> Self {
        Self::new(TarCompression::ParallelGzip)
    }

    /// Sequential `.tar.bz2`
    pub fn bzip2() -> Self {
        Self::new(TarCompression::Bzip2)
    }

    /// Parallel `.tar.bz2`
    pub fn parallel_bzip2() -> Self {
        Self::new(TarCompression::ParallelBzip2)
    }

    /// `.tar.xz`
    pub fn lzma() -> Self {
        Self::new(TarCompression::Lzma)
    }

    /// Compression layer in use
    pub fn compression(&self) -> TarCompression {
        self.compression
    }

    fn compressor(&self, sink: Box<dyn ArchiveSink>, core_limit: usize) -> Result<Box<dyn CompressedSink>> {
        Ok(match self.compression {
            TarCompression::None => Box::new(Plain(sink)),
            TarCompression::Gzip => Box::new(GzEncoder::new(sink, Compression::default())),
            TarCompression::ParallelGzip => {
                Box::new(ParallelBlockWriter::new(sink, GzipBlocks::default(), core_limit)?)
            }
            TarCompression::Bzip2 => Box::new(bzip2::write::BzEncoder::new(sink, bzip2::Compression::best())),
            TarCompression::ParallelBzip2 => {
                Box::new(ParallelBlockWriter::new(sink, Bzip2Blocks::default(), core_limit)?)
            }
            TarCompression::Lzma => Box::new(xz2::write::XzEncoder::new(sink, 6)),
        })
    }
}

impl Codec for TarCodec {
    fn format(&self) -> ArchiveFormat {
        match self.compression {
            TarCompression::None => ArchiveFormat::Tar,
            TarCompression::Gzip | TarCompression::ParallelGzip => ArchiveFormat::Gzip,
            TarCompression::Bzip2 | TarCompression::ParallelBzip2 => ArchiveFormat::Bzip2,
            TarCompression::Lzma => ArchiveFormat::Lzma,
        }
    }

    fn is_parallel(&self) -> bool {
        matches!(
            self.compression,
            TarCompression::ParallelGzip | TarCompression::ParallelBzip2
        )
    }

    fn open_archive_stream(
        &self,
        sink: Box<dyn ArchiveSink>,
        ctx: &BackupContext,
        core_limit: usize,
    ) -> Result<Box<dyn ArchiveOutput>> {
        debug!(job = %ctx.id(), compression = ?self.compression, core_limit, "Opening tar stream");
        let builder = Builder::new(self.compressor(sink, core_limit)?);
        Ok(Box::new(TarOutput { builder: Some(builder) }))
    }
}

/// Compression stream that needs an explicit end-of-stream step
trait CompressedSink: Write + Send {
    fn finish_stream(self: Box<Self>) -> io::Result<()>;
}

struct Plain(Box<dyn ArchiveSink>);

impl Write for Plain {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl CompressedSink for Plain {
    fn finish_stream(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

impl CompressedSink for GzEncoder<Box<dyn ArchiveSink>> {
    fn finish_stream(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.flush()
    }
}

impl CompressedSink for bzip2::write::BzEncoder<Box<dyn ArchiveSink>> {
    fn finish_stream(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.flush()
    }
}

impl CompressedSink for xz2::write::XzEncoder<Box<dyn ArchiveSink>> {
    fn finish_stream(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.flush()
    }
}

impl<F: crate::block_compress::BlockFormat> CompressedSink for ParallelBlockWriter<Box<dyn ArchiveSink>, F> {
    fn finish_stream(self: Box<Self>) -> io::Result<()> {
        (*self).finish()?.flush()
    }
}

struct TarOutput {
    builder: Option<Builder<Box<dyn CompressedSink>>>,
}

impl TarOutput {
    fn builder(&mut self) -> Result<&mut Builder<Box<dyn CompressedSink>>> {
        self.builder
            .as_mut()
            .ok_or_else(|| ArchiveError::internal("tar archive already closed"))
    }
}

impl ArchiveOutput for TarOutput {
    fn write_entry(&mut self, mut supplier: Box<dyn InputSupplier>) -> Result<()> {
        let path = supplier.path().to_string();
        let stream = supplier.open().map_err(|e| source_error(&path, e))?;

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(stream.metadata.size);
        header.set_mode(stream.metadata.mode);
        header.set_mtime(stream.metadata.modified.timestamp().max(0) as u64);

        let mut reader = PaddedReader::new(stream.reader, stream.metadata.size);
        self.builder()?.append_data(&mut header, &path, &mut reader)?;

        if reader.short_by > 0 {
            warn!(path = %path, missing = reader.short_by, "File shrank while archiving; entry zero-padded");
        }
        match reader.error.take() {
            Some(err) => Err(source_error(&path, err)),
            None => Ok(()),
        }
    }

    fn finish(&mut self) -> Result<()> {
        let builder = self
            .builder
            .take()
            .ok_or_else(|| ArchiveError::internal("tar archive already closed"))?;
        builder.into_inner()?.finish_stream()?;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the builder drops the compressor and any worker pool it owns
        self.builder.take();
    }
}

/// Reader that always yields exactly `size` bytes
///
/// Once the source fails or ends early the remainder is filled with zeros.
/// The source error is kept for the caller, never returned to the tar writer.
struct PaddedReader {
    inner: Box<dyn Read + Send>,
    remaining: u64,
    inner_done: bool,
    short_by: u64,
    error: Option<io::Error>,
}

impl PaddedReader {
    fn new(inner: Box<dyn Read + Send>, size: u64) -> Self {
        Self {
            inner,
            remaining: size,
            inner_done: false,
            short_by: 0,
            error: None,
        }
    }

    fn pad(&mut self, buf: &mut [u8]) -> usize {
        let n = (buf.len() as u64).min(self.remaining) as usize;
        buf[..n].fill(0);
        self.remaining -= n as u64;
        n
    }
}

impl Read for PaddedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.inner_done {
            return Ok(self.pad(buf));
        }

        match self.inner.read(buf) {
            Ok(0) => {
                self.inner_done = true;
                self.short_by = self.remaining;
                Ok(self.pad(buf))
            }
            Ok(n) => {
                let n = (n as u64).min(self.remaining) as usize;
                self.remaining -= n as u64;
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Err(e),
            Err(e) => {
                self.inner_done = true;
                self.error = Some(e);
                Ok(self.pad(buf))
            }
        }
    }
}
