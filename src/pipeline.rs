//! Archive pipeline
//!
//! Walks a source tree once and streams every regular file that survives the
//! blacklist into a [`Codec`]. Content hashes flow into a shared
//! [`FileTreeHasher`]; when the walk is over the tree digest and the
//! broken-file ledger are written as the last entry of the archive.
//!
//! Failures are split in two classes:
//!
//! - A file that cannot be read is logged, recorded in the status trailer and
//!   skipped. The archive stays usable.
//! - Anything on the sink side (a full device, a failing compression worker,
//!   the digest being misused) aborts the archive. A full device is reported
//!   as a known issue because the partial archive is corrupt.

use crate::blacklist::Blacklist;
use crate::codec::{ArchiveOutput, ArchiveSink, Codec};
use crate::context::BackupContext;
use crate::error::{ArchiveError, Result};
use crate::supplier::{FileSupplier, StatusSupplier};
use crate::tree_hash::FileTreeHasher;
use crate::types::{CompressionStatus, CompressionStatusBuilder, STATUS_FILENAME};
use crate::utils::{format_elapsed, relative_entry_name};
use chrono::Utc;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use walkdir::WalkDir;

/// Buffer between the codec and the destination file
const SINK_BUFFER_SIZE: usize = 1024 * 1024;

/// Opens the byte sink an archive is written into
pub type SinkOpener = Arc<dyn Fn(&Path) -> io::Result<Box<dyn ArchiveSink>> + Send + Sync>;

/// Sink opener writing to a buffered file, truncating what was there
pub fn default_sink_opener() -> SinkOpener {
    Arc::new(|path: &Path| -> io::Result<Box<dyn ArchiveSink>> {
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        Ok(Box::new(BufWriter::with_capacity(SINK_BUFFER_SIZE, file)))
    })
}

/// Outcome of a successful pipeline run
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    /// Archive that was written
    pub archive: PathBuf,
    /// Status trailer embedded in the archive
    pub status: CompressionStatus,
    /// Wall-clock time spent compressing
    pub elapsed: Duration,
}

/// Streams a directory tree into an archive
#[derive(Clone)]
pub struct ArchivePipeline {
    codec: Arc<dyn Codec>,
    blacklist: Blacklist,
    sink_opener: SinkOpener,
}

impl fmt::Debug for ArchivePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchivePipeline")
            .field("codec", &self.codec)
            .field("blacklist", &self.blacklist)
            .finish_non_exhaustive()
    }
}

impl ArchivePipeline {
    /// Create a pipeline writing through `codec`
    pub fn new(codec: Arc<dyn Codec>, blacklist: Blacklist) -> Self {
        Self {
            codec,
            blacklist,
            sink_opener: default_sink_opener(),
        }
    }

    /// Replace how the destination is opened
    pub fn with_sink_opener(mut self, opener: SinkOpener) -> Self {
        self.sink_opener = opener;
        self
    }

    /// Codec in use
    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Archive `source_dir` into `dest_file`
    ///
    /// The elapsed time is logged and sent to the initiator whether or not
    /// the run succeeds.
    ///
    /// # Errors
    ///
    /// Per-file read failures do not fail the run; they are listed in the
    /// returned status. Every other failure is returned, with a full storage
    /// device reported as [`ArchiveError::DeviceExhausted`].
    #[instrument(skip(self, ctx), fields(job = %ctx.id(), format = %self.codec.format()))]
    pub fn create_archive(
        &self,
        source_dir: &Path,
        dest_file: &Path,
        ctx: &BackupContext,
        core_limit: usize,
    ) -> Result<ArchiveReport> {
        info!("Compressing {:?} into {:?}", source_dir, dest_file);
        let start = Instant::now();

        let result = self.write_archive(source_dir, dest_file, ctx, core_limit);
        let elapsed = start.elapsed();

        let result = result.map_err(|err| {
            let err = err.classify(dest_file);
            if err.is_known_issue() {
                error!("Storage device ran out of space; {:?} is corrupt: {}", dest_file, err);
            } else {
                error!("An error occurred while compressing {:?}: {}", source_dir, err);
            }
            ctx.notify_error_if_interactive(&err.user_message());
            err
        });

        let took = format_elapsed(elapsed);
        info!("Compression took {}", took);
        ctx.notify_info(&format!("Compression took: {}", took));

        let status = result?;
        Ok(ArchiveReport {
            archive: dest_file.to_path_buf(),
            status,
            elapsed,
        })
    }

    fn write_archive(
        &self,
        source_dir: &Path,
        dest_file: &Path,
        ctx: &BackupContext,
        core_limit: usize,
    ) -> Result<CompressionStatus> {
        let sink = (self.sink_opener)(dest_file)?;
        let mut output = self.codec.open_archive_stream(sink, ctx, core_limit)?;

        let result = self
            .write_entries(output.as_mut(), source_dir, ctx)
            .and_then(|status| {
                output.finish()?;
                Ok(status)
            });
        output.close();
        result
    }

    fn write_entries(
        &self,
        output: &mut dyn ArchiveOutput,
        source_dir: &Path,
        ctx: &BackupContext,
    ) -> Result<CompressionStatus> {
        let hasher = Arc::new(FileTreeHasher::new());
        let mut status = CompressionStatusBuilder::new(
            self.codec.format(),
            ctx.started_at().with_timezone(&Utc),
            ctx.initiator(),
        )
        .comment(ctx.comment().map(str::to_string));

        let walker = WalkDir::new(source_dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(source_dir) {
                Ok(relative) => !self.blacklist.is_blacklisted(relative),
                Err(_) => true,
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => return Err(err.into()),
                Err(err) => {
                    let path = err
                        .path()
                        .and_then(|p| relative_entry_name(p, source_dir).ok())
                        .unwrap_or_else(|| "<unknown>".to_string());
                    record_failure(ArchiveError::entry(path, io::Error::from(err)), &mut status, ctx)?;
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let relative = relative_entry_name(entry.path(), source_dir)?;
            if relative == STATUS_FILENAME {
                warn!("Skipping {:?}: the name is reserved for the status trailer", entry.path());
                continue;
            }

            trace!("Adding {}", relative);
            let supplier = FileSupplier::new(entry.into_path(), relative, Arc::clone(&hasher));
            if let Err(err) = output.write_entry(Box::new(supplier)) {
                record_failure(err, &mut status, ctx)?;
            }
        }

        for err in output.await_entries()? {
            record_failure(err, &mut status, ctx)?;
        }

        let tree = hasher.finalize()?;
        debug!(
            files = tree.file_count,
            bytes = tree.total_size,
            broken = status.broken_count(),
            "Tree digest {}",
            tree.digest
        );

        let status = status.build(tree);
        output.write_entry(Box::new(StatusSupplier::new(status.to_bytes()?)))?;
        Ok(status)
    }
}

/// Contain a per-file failure, or hand back anything fatal
fn record_failure(err: ArchiveError, status: &mut CompressionStatusBuilder, ctx: &BackupContext) -> Result<()> {
    if !err.is_per_file() {
        return Err(err);
    }
    if let ArchiveError::Entry { path, source } = &err {
        error!(path = %path, "Failed to archive file: {}", source);
        status.add_broken_file(path.clone(), source);
        ctx.notify_error_if_interactive(&err.user_message());
    }
    Ok(())
}
