//! ZIP codecs
//!
//! [`ZipCodec`] deflates entries one after another on the calling thread.
//! [`ParallelZipCodec`] deflates each entry on a worker into its own
//! single-entry ZIP held in an anonymous temporary file (a scatter part), then
//! copies the already-compressed parts into the destination in submission
//! order without inflating them again.

use crate::block_compress::worker_pool;
use crate::codec::{copy_entry, source_error, ArchiveOutput, ArchiveSink, Codec};
use crate::context::BackupContext;
use crate::error::{ArchiveError, Result};
use crate::supplier::{EntryMetadata, InputSupplier};
use crate::types::ArchiveFormat;
use chrono::{Datelike, Local, Timelike};
use rayon::ThreadPool;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::sync::mpsc::{self, Receiver};
use tracing::{debug, trace, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

type SinkWriter = ZipWriter<Box<dyn ArchiveSink>>;

/// Options for one entry: deflate, ZIP64 when needed, mode and mtime
fn entry_options(metadata: &EntryMetadata) -> SimpleFileOptions {
    let local = metadata.modified.with_timezone(&Local);
    // ZIP timestamps cannot represent anything before 1980
    let modified = u16::try_from(local.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                local.month() as u8,
                local.day() as u8,
                local.hour() as u8,
                local.minute() as u8,
                local.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default();

    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(metadata.size >= u64::from(u32::MAX))
        .unix_permissions(metadata.mode)
        .last_modified_time(modified)
}

fn closed() -> ArchiveError {
    ArchiveError::internal("zip archive already closed")
}

/// Sequential deflate ZIP
#[derive(Debug, Clone, Default)]
pub struct ZipCodec;

impl ZipCodec {
    /// Create the codec
    pub fn new() -> Self {
        Self
    }
}

impl Codec for ZipCodec {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn open_archive_stream(
        &self,
        sink: Box<dyn ArchiveSink>,
        ctx: &BackupContext,
        _core_limit: usize,
    ) -> Result<Box<dyn ArchiveOutput>> {
        debug!(job = %ctx.id(), "Opening sequential zip stream");
        Ok(Box::new(ZipOutput {
            writer: Some(ZipWriter::new(sink)),
        }))
    }
}

struct ZipOutput {
    writer: Option<SinkWriter>,
}

impl ArchiveOutput for ZipOutput {
    fn write_entry(&mut self, mut supplier: Box<dyn InputSupplier>) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(closed)?;
        let path = supplier.path().to_string();
        let mut stream = supplier.open().map_err(|e| source_error(&path, e))?;

        writer.start_file(path.as_str(), entry_options(&stream.metadata))?;
        match copy_entry(&path, &mut stream.reader, writer) {
            Ok(bytes) => {
                trace!(path = %path, bytes, "Entry written");
                Ok(())
            }
            Err(err) if err.is_per_file() => {
                // Drop the half-written entry so the archive stays valid
                writer.abort_file()?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn finish(&mut self) -> Result<()> {
        let writer = self.writer.take().ok_or_else(closed)?;
        writer.finish()?.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        self.writer.take();
    }
}

/// Parallel deflate ZIP built from per-entry scatter parts
#[derive(Debug, Clone, Default)]
pub struct ParallelZipCodec;

impl ParallelZipCodec {
    /// Create the codec
    pub fn new() -> Self {
        Self
    }
}

impl Codec for ParallelZipCodec {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn is_parallel(&self) -> bool {
        true
    }

    fn open_archive_stream(
        &self,
        sink: Box<dyn ArchiveSink>,
        ctx: &BackupContext,
        core_limit: usize,
    ) -> Result<Box<dyn ArchiveOutput>> {
        let threads = core_limit.max(1);
        debug!(job = %ctx.id(), threads, "Opening parallel zip stream");
        Ok(Box::new(ParallelZipOutput {
            writer: Some(ZipWriter::new(sink)),
            pool: Some(worker_pool("zip", threads)?),
            pending: VecDeque::new(),
            max_pending: threads * 4,
            deferred: Vec::new(),
        }))
    }
}

type PartResult = Result<File>;

struct ParallelZipOutput {
    writer: Option<SinkWriter>,
    pool: Option<ThreadPool>,
    pending: VecDeque<(String, Receiver<PartResult>)>,
    max_pending: usize,
    deferred: Vec<ArchiveError>,
}

impl ParallelZipOutput {
    /// Wait for the oldest part and copy it into the archive
    ///
    /// Per-entry failures are kept for `await_entries`; anything else is fatal.
    fn merge_next(&mut self) -> Result<()> {
        let Some((path, rx)) = self.pending.pop_front() else {
            return Ok(());
        };

        let part = rx
            .recv()
            .map_err(|_| ArchiveError::execution(format!("zip worker for {} stopped without a result", path)))?;

        match part {
            Ok(part) => {
                let writer = self.writer.as_mut().ok_or_else(closed)?;
                merge_part(writer, part)?;
                trace!(path = %path, "Scatter part merged");
                Ok(())
            }
            Err(err) if err.is_per_file() => {
                self.deferred.push(err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl ArchiveOutput for ParallelZipOutput {
    fn write_entry(&mut self, supplier: Box<dyn InputSupplier>) -> Result<()> {
        while self.pending.len() >= self.max_pending {
            self.merge_next()?;
        }

        let pool = self.pool.as_ref().ok_or_else(closed)?;
        let path = supplier.path().to_string();
        let (tx, rx) = mpsc::sync_channel(1);
        pool.spawn(move || {
            let _ = tx.send(compress_part(supplier));
        });
        self.pending.push_back((path, rx));
        Ok(())
    }

    fn await_entries(&mut self) -> Result<Vec<ArchiveError>> {
        while !self.pending.is_empty() {
            self.merge_next()?;
        }
        Ok(std::mem::take(&mut self.deferred))
    }

    fn finish(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            self.merge_next()?;
        }
        for late in self.deferred.drain(..) {
            warn!("Entry failed after the last barrier: {}", late);
        }

        let writer = self.writer.take().ok_or_else(closed)?;
        writer.finish()?.flush()?;
        Ok(())
    }

    fn close(&mut self) {
        self.pending.clear();
        self.pool.take();
        self.writer.take();
    }
}

/// Deflate one entry into an anonymous single-entry ZIP
fn compress_part(mut supplier: Box<dyn InputSupplier>) -> PartResult {
    let path = supplier.path().to_string();
    let mut stream = supplier.open().map_err(|e| source_error(&path, e))?;

    let mut part = ZipWriter::new(tempfile::tempfile()?);
    part.start_file(path.as_str(), entry_options(&stream.metadata))?;
    copy_entry(&path, &mut stream.reader, &mut part)?;
    Ok(part.finish()?)
}

/// Copy every entry of a scatter part into the archive without recompressing
fn merge_part(writer: &mut SinkWriter, mut part: File) -> Result<()> {
    part.seek(SeekFrom::Start(0))?;
    let mut archive = ZipArchive::new(part)?;
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index)?;
        writer.raw_copy_file(entry)?;
    }
    Ok(())
}
