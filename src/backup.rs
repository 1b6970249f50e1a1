//! Backup job orchestration
//!
//! A [`BackupJob`] turns a [`BackupContext`] and a [`BackupConfig`] into one
//! archive under the host's backup root:
//!
//! 1. Names the archive after the job's start time and comment.
//! 2. Quiesces the host for the duration of the run. Persistence and the
//!    watchdog are restored on every exit path, including unwinding.
//! 3. Creates the empty destination, picks a codec for the configured format,
//!    core budget and destination volume, and runs the [`ArchivePipeline`].
//! 4. On success hands retention cleanup back to the host and announces
//!    completion. On failure removes the partial archive in
//!    [`crate::types::ErrorHandlingMode::Strict`] and tells interactive initiators.
//!
//! # Examples
//!
//! ```rust,no_run
//! use treearchive::backup::BackupJob;
//! use treearchive::context::{BackupContext, Host};
//! use treearchive::types::BackupConfig;
//! use std::sync::Arc;
//!
//! # fn example(host: Arc<dyn Host>) -> treearchive::Result<()> {
//! let ctx = BackupContext::builder().host(host).build()?;
//! let outcome = BackupJob::new(ctx, BackupConfig::default()).run()?;
//! println!("wrote {:?}", outcome.report.archive);
//! # Ok(())
//! # }
//! ```

use crate::blacklist::Blacklist;
use crate::codec::select_codec;
use crate::context::{BackupContext, FollowupJob, Host};
use crate::error::Result;
use crate::pipeline::{ArchivePipeline, ArchiveReport, SinkOpener};
use crate::types::BackupConfig;
use crate::utils::{backup_file_name, effective_core_count, is_memory_backed};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

/// Message sent when a job completes
pub const DONE_MESSAGE: &str = "Done!";

/// Message sent to interactive initiators when a job fails
pub const FAILURE_MESSAGE: &str = "An error occurred while creating a new backup file!";

/// Result of a successful job
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    /// What the pipeline wrote
    pub report: ArchiveReport,
    /// Compression threads granted to the codec
    pub core_count: usize,
    /// Whether a parallel codec was used
    pub parallel: bool,
}

/// One backup run
pub struct BackupJob {
    ctx: BackupContext,
    config: BackupConfig,
    sink_opener: Option<SinkOpener>,
    available_cores: usize,
}

impl BackupJob {
    /// Create a job; nothing happens until [`BackupJob::run`]
    pub fn new(ctx: BackupContext, config: BackupConfig) -> Self {
        Self {
            ctx,
            config,
            sink_opener: None,
            available_cores: num_cpus::get(),
        }
    }

    /// Write through a custom sink instead of a buffered file
    pub fn with_sink_opener(mut self, opener: SinkOpener) -> Self {
        self.sink_opener = Some(opener);
        self
    }

    /// Override the number of cores considered available
    pub fn with_available_cores(mut self, cores: usize) -> Self {
        self.available_cores = cores;
        self
    }

    /// Job context
    pub fn context(&self) -> &BackupContext {
        &self.ctx
    }

    /// Job configuration
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Where the archive will be written
    pub fn archive_path(&self) -> PathBuf {
        let name = backup_file_name(&self.ctx.started_at(), self.ctx.comment(), self.config.format);
        self.ctx.host().backup_root().join(name)
    }

    /// Run the job to completion on the calling thread
    ///
    /// # Errors
    ///
    /// Returns the first error after cleanup; a full device surfaces as
    /// [`crate::ArchiveError::DeviceExhausted`]. Invalid blacklist patterns
    /// fail before the host is touched. Every failure is logged and reported
    /// to interactive initiators.
    #[instrument(skip(self), fields(job = %self.ctx.id(), initiator = %self.ctx.initiator()))]
    pub fn run(&self) -> Result<BackupOutcome> {
        let archive = self.archive_path();
        let host = self.ctx.host();

        let (blacklist, _suspension) = match self.prepare(host.as_ref(), &archive) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.on_failure(&archive, false, &err);
                return Err(err);
            }
        };

        let mut created = false;
        let result = self.execute(&archive, blacklist, &mut created);

        match result {
            Ok(outcome) => {
                self.on_success();
                Ok(outcome)
            }
            Err(err) => {
                self.on_failure(&archive, created, &err);
                Err(err)
            }
        }
    }

    fn prepare<'h>(&self, host: &'h dyn Host, archive: &Path) -> Result<(Blacklist, HostSuspension<'h>)> {
        let blacklist = Blacklist::new(&self.config.file_blacklist)?;
        info!("Starting backup into {:?}", archive);
        let suspension = HostSuspension::begin(host)?;
        Ok((blacklist, suspension))
    }

    fn execute(&self, archive: &Path, blacklist: Blacklist, created: &mut bool) -> Result<BackupOutcome> {
        create_destination(archive).map_err(|e| e.classify(archive))?;
        *created = true;

        let core_count = effective_core_count(self.config.compression_core_count_limit, self.available_cores);
        let memory_backed = is_memory_backed(archive);
        if memory_backed && core_count > 1 {
            warn!("{:?} is on a memory-backed volume; compressing sequentially", archive);
        }

        let codec = select_codec(self.config.format, core_count, memory_backed);
        let parallel = codec.is_parallel();
        debug!(core_count, parallel, "Codec selected for {}", self.config.format);

        let mut pipeline = ArchivePipeline::new(codec, blacklist);
        if let Some(opener) = &self.sink_opener {
            pipeline = pipeline.with_sink_opener(opener.clone());
        }

        let source = self.ctx.host().source_dir();
        let report = pipeline.create_archive(&source, archive, &self.ctx, core_count)?;
        Ok(BackupOutcome {
            report,
            core_count,
            parallel,
        })
    }

    fn on_success(&self) {
        let host = self.ctx.host();
        let cleanup = FollowupJob::Cleanup {
            backup_root: host.backup_root(),
        };
        if let Err(e) = host.submit_followup(cleanup) {
            warn!("Failed to schedule backup cleanup: {}", e);
        }

        if self.config.broadcast_backup_done {
            self.ctx.notifier().broadcast(DONE_MESSAGE);
        } else {
            self.ctx.notify_info(DONE_MESSAGE);
        }
    }

    fn on_failure(&self, archive: &Path, created: bool, err: &crate::ArchiveError) {
        error!("Backup failed: {}", err);

        if self.config.error_handling_mode.is_strict() && created {
            match fs::remove_file(archive) {
                Ok(()) => info!("Removed incomplete archive {:?}", archive),
                Err(e) => error!("Failed to remove incomplete archive {:?}: {}", archive, e),
            }
        }

        self.ctx.notify_error_if_interactive(FAILURE_MESSAGE);
    }
}

/// Create the parent directories and the empty archive file
///
/// Refuses to reuse an existing file so that cleanup never removes an archive
/// this job did not create.
fn create_destination(archive: &Path) -> Result<()> {
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent)?;
    }
    File::create_new(archive)?;
    Ok(())
}

/// Keeps the host quiesced while alive
struct HostSuspension<'a> {
    host: &'a dyn Host,
}

impl<'a> HostSuspension<'a> {
    fn begin(host: &'a dyn Host) -> Result<Self> {
        host.suspend_watchdog();
        if let Err(e) = host.suspend_persistence() {
            host.resume_watchdog();
            return Err(e);
        }
        debug!("Host persistence and watchdog suspended");
        Ok(Self { host })
    }
}

impl Drop for HostSuspension<'_> {
    fn drop(&mut self) {
        self.host.resume_persistence();
        self.host.resume_watchdog();
        debug!("Host persistence and watchdog resumed");
    }
}
