//! Pluggable archive formats
//!
//! A [`Codec`] turns a raw byte sink into an [`ArchiveOutput`] that accepts
//! entries. The pipeline drives every format through the same four steps:
//!
//! 1. [`Codec::open_archive_stream`] wraps the sink in the format's
//!    container and compression layers.
//! 2. [`ArchiveOutput::write_entry`] writes one file or blob.
//! 3. [`ArchiveOutput::finish`] completes the stream (parallel codecs merge
//!    their outstanding work here). Only called on success.
//! 4. [`ArchiveOutput::close`] releases codec resources such as worker pools.
//!    Always called, with or without `finish`.
//!
//! Parallel codecs may also defer work past `write_entry`; the pipeline calls
//! [`ArchiveOutput::await_entries`] before writing the status trailer so that
//! every file has been hashed and is ordered before the trailer.
//!
//! ## Available codecs
//!
//! | Format | Sequential | Parallel |
//! |--------|------------|----------|
//! | ZIP    | [`ZipCodec`] | [`ParallelZipCodec`] |
//! | GZIP   | [`TarCodec::gzip`] | [`TarCodec::parallel_gzip`] |
//! | BZIP2  | [`TarCodec::bzip2`] | [`TarCodec::parallel_bzip2`] |
//! | LZMA   | [`TarCodec::lzma`] | – |
//! | TAR    | [`TarCodec::plain`] | – |

use crate::context::BackupContext;
use crate::error::{ArchiveError, Result};
use crate::supplier::InputSupplier;
use crate::types::ArchiveFormat;
use std::fmt;
use std::io::{self, Read, Seek, Write};
use std::sync::Arc;
use tracing::debug;

pub use crate::tar_codec::{TarCodec, TarCompression};
pub use crate::zip_codec::{ParallelZipCodec, ZipCodec};

/// Byte sink an archive is written into
pub trait ArchiveSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> ArchiveSink for T {}

/// Archive format strategy
pub trait Codec: Send + Sync + fmt::Debug {
    /// Format this codec produces
    fn format(&self) -> ArchiveFormat;

    /// Whether entries are compressed on a worker pool
    fn is_parallel(&self) -> bool {
        false
    }

    /// Wrap `sink` into an archive that accepts entries
    fn open_archive_stream(
        &self,
        sink: Box<dyn ArchiveSink>,
        ctx: &BackupContext,
        core_limit: usize,
    ) -> Result<Box<dyn ArchiveOutput>>;
}

/// An open archive
pub trait ArchiveOutput: Send {
    /// Write one entry
    ///
    /// # Errors
    ///
    /// [`ArchiveError::Entry`] means only this entry was lost and the archive
    /// is still consistent. Any other error leaves the archive unusable.
    fn write_entry(&mut self, supplier: Box<dyn InputSupplier>) -> Result<()>;

    /// Wait until every dispatched entry has been written or has failed
    ///
    /// Returns the per-entry failures that happened out of line.
    fn await_entries(&mut self) -> Result<Vec<ArchiveError>> {
        Ok(Vec::new())
    }

    /// Complete the archive stream
    fn finish(&mut self) -> Result<()>;

    /// Release codec resources; safe to call without `finish`
    fn close(&mut self) {}
}

/// Buffer size used when copying entry content
pub(crate) const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Copy an entry into an archive, telling source and sink failures apart
///
/// A read error is a per-entry failure; a write error is fatal.
pub(crate) fn copy_entry(path: &str, reader: &mut dyn Read, writer: &mut dyn Write) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(source_error(path, e)),
        };
        writer.write_all(&buffer[..n])?;
        copied += n as u64;
    }
}

/// Classify an error raised while reading an entry's source
///
/// Wrapped archive errors (aggregator misuse) keep their class; everything
/// else becomes a per-entry failure.
pub(crate) fn source_error(path: &str, err: io::Error) -> ArchiveError {
    if err.get_ref().is_some_and(|inner| inner.is::<ArchiveError>()) {
        return err.into();
    }
    ArchiveError::entry(path, err)
}

/// Choose a codec for a format
///
/// A parallel variant is used when more than one core is available and the
/// destination is not memory backed; parallel ZIP is known to corrupt
/// archives written to tmpfs. LZMA and TAR are always sequential.
pub fn select_codec(format: ArchiveFormat, core_count: usize, memory_backed: bool) -> Arc<dyn Codec> {
    let parallel = core_count > 1 && !memory_backed;
    debug!(%format, core_count, memory_backed, parallel, "Selecting codec");

    match (format, parallel) {
        (ArchiveFormat::Zip, true) => Arc::new(ParallelZipCodec::new()),
        (ArchiveFormat::Zip, false) => Arc::new(ZipCodec::new()),
        (ArchiveFormat::Gzip, true) => Arc::new(TarCodec::parallel_gzip()),
        (ArchiveFormat::Gzip, false) => Arc::new(TarCodec::gzip()),
        (ArchiveFormat::Bzip2, true) => Arc::new(TarCodec::parallel_bzip2()),
        (ArchiveFormat::Bzip2, false) => Arc::new(TarCodec::bzip2()),
        (ArchiveFormat::Lzma, _) => Arc::new(TarCodec::lzma()),
        (ArchiveFormat::Tar, _) => Arc::new(TarCodec::plain()),
    }
}
