//! # treearchive - Backup archives with a tree integrity digest
//!
//! A backup engine that streams a directory tree into a compressed archive
//! while the application owning that tree is quiesced, and embeds a
//! self-describing status record as the last entry of every archive.
//!
//! ## Overview
//!
//! treearchive provides:
//! - ZIP, TAR, TAR+gzip, TAR+bzip2 and TAR+xz archives behind one [`Codec`] trait
//! - Parallel compression for ZIP, gzip and bzip2 on a bounded worker pool
//! - An order-independent SHA-256 digest of the archived tree, so archives
//!   written sequentially and in parallel can be compared
//! - Per-file failure containment: unreadable files are skipped and listed in
//!   the status record instead of aborting the backup
//! - Recognition of a full storage device, with optional removal of the
//!   corrupt partial archive
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use treearchive::{BackupConfig, BackupContext, BackupJob, Host};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! struct World;
//!
//! impl Host for World {
//!     fn source_dir(&self) -> PathBuf { PathBuf::from("./world") }
//!     fn backup_root(&self) -> PathBuf { PathBuf::from("./backups") }
//!     fn suspend_persistence(&self) -> treearchive::Result<()> { Ok(()) }
//!     fn resume_persistence(&self) {}
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = BackupContext::builder()
//!     .comment(Some("before upgrade".to_string()))
//!     .host(Arc::new(World))
//!     .build()?;
//!
//! let outcome = BackupJob::new(ctx, BackupConfig::default()).run()?;
//! println!(
//!     "{} files in {:?}",
//!     outcome.report.status.file_count,
//!     outcome.report.archive
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Verifying an Archive
//!
//! ```rust,no_run
//! use treearchive::verify::{verify_archive, ArchiveReader};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reader = ArchiveReader::open("backups/2024.06.01_04-00-00.tar.gz")?;
//! let report = verify_archive(reader.path(), reader.format())?;
//! assert!(report.is_valid());
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Concepts
//!
//! ### Status Trailer
//!
//! Every archive ends with a `.treearchive_status.json` entry holding the tree
//! digest, file count, total size, the files that could not be read and who
//! started the job. The trailer is never part of its own digest.
//!
//! ### Tree Digest
//!
//! Each file contributes `SHA-256(path ‖ SHA-256(content))`. Contributions are
//! XOR-folded, so the digest does not depend on the order in which workers
//! finish. The final digest also covers the file count and total size.
//!
//! ### Host
//!
//! The [`Host`] is the application whose state is archived. A job suspends
//! its persistence and watchdog for the duration of the run and always
//! restores them, then hands retention cleanup back to it.
//!
//! ## Module Organization
//!
//! - [`backup`]: Job orchestration
//! - [`pipeline`]: Tree walk, per-file failure handling and trailer
//! - [`codec`]: Codec trait and selection policy
//! - [`tree_hash`]: Order-independent tree digest
//! - [`queue`]: Single-consumer job queue
//! - [`verify`]: Reading archives back and checking their digest
//! - [`types`]: Configuration and status records
//! - [`error`]: Error types and classification

// Public API modules
pub mod backup;
pub mod blacklist;
pub mod block_compress;
pub mod codec;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod supplier;
pub mod tree_hash;
pub mod types;
pub mod utils;
pub mod verify;

// Codec implementations, exposed through `codec`
mod tar_codec;
mod zip_codec;

// Re-export main types for convenience
pub use backup::{BackupJob, BackupOutcome};
pub use blacklist::Blacklist;
pub use codec::{select_codec, ArchiveOutput, ArchiveSink, Codec};
pub use context::{BackupContext, BackupContextBuilder, FollowupJob, Host, Notifier, TracingNotifier};
pub use error::{ArchiveError, Result};
pub use pipeline::{ArchivePipeline, ArchiveReport, SinkOpener};
pub use queue::{BackupQueue, JobHandle};
pub use tree_hash::FileTreeHasher;
pub use types::*;
pub use verify::{verify_archive, ArchiveReader, VerificationReport};
