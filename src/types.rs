//! Core data types used throughout treearchive
//!
//! This module contains the configuration surface consumed by a backup job,
//! the enumerations shared across components and the [`CompressionStatus`]
//! record that is embedded as the trailing entry of every archive.
//!
//! ## Examples
//!
//! ```rust
//! use treearchive::types::{ArchiveFormat, BackupConfig, ErrorHandlingMode};
//!
//! let config = BackupConfig {
//!     format: ArchiveFormat::Gzip,
//!     compression_core_count_limit: 4,
//!     error_handling_mode: ErrorHandlingMode::Strict,
//!     ..Default::default()
//! };
//! assert_eq!(config.format.extension(), ".tar.gz");
//! ```

use crate::error::{ArchiveError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Reserved name of the status trailer written at the root of every archive
pub const STATUS_FILENAME: &str = ".treearchive_status.json";

/// Version of the [`CompressionStatus`] layout
pub const STATUS_VERSION: u32 = 1;

/// Archive container and compression format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArchiveFormat {
    /// Deflate-compressed ZIP
    #[default]
    Zip,
    /// TAR compressed with bzip2
    Bzip2,
    /// TAR compressed with gzip
    Gzip,
    /// TAR compressed with LZMA2 in an XZ container
    Lzma,
    /// Uncompressed TAR
    Tar,
}

impl ArchiveFormat {
    /// All formats, in configuration order
    pub const ALL: [ArchiveFormat; 5] = [
        ArchiveFormat::Zip,
        ArchiveFormat::Bzip2,
        ArchiveFormat::Gzip,
        ArchiveFormat::Lzma,
        ArchiveFormat::Tar,
    ];

    /// File extension, including the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Bzip2 => ".tar.bz2",
            ArchiveFormat::Gzip => ".tar.gz",
            ArchiveFormat::Lzma => ".tar.xz",
            ArchiveFormat::Tar => ".tar",
        }
    }

    /// Infer the format of an existing archive from its file name
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        [
            ArchiveFormat::Bzip2,
            ArchiveFormat::Gzip,
            ArchiveFormat::Lzma,
            ArchiveFormat::Zip,
            ArchiveFormat::Tar,
        ]
        .into_iter()
        .find(|format| name.ends_with(format.extension()))
    }

    /// Whether entries live in a TAR container
    pub fn is_tar(&self) -> bool {
        !matches!(self, ArchiveFormat::Zip)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveFormat::Zip => "ZIP",
            ArchiveFormat::Bzip2 => "BZIP2",
            ArchiveFormat::Gzip => "GZIP",
            ArchiveFormat::Lzma => "LZMA",
            ArchiveFormat::Tar => "TAR",
        };
        f.write_str(name)
    }
}

/// What to do with a partially written archive when a job fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorHandlingMode {
    /// Delete the partial archive
    #[default]
    Strict,
    /// Leave the partial archive in place
    Lenient,
}

impl ErrorHandlingMode {
    /// Whether partial output must be deleted on failure
    pub fn is_strict(&self) -> bool {
        matches!(self, ErrorHandlingMode::Strict)
    }
}

/// Who asked for a backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionInitiator {
    /// A person interacting with the host; receives notices
    InteractiveUser,
    /// The host's console
    Console,
    /// A timer or scheduler
    Scheduled,
    /// Another program calling the library
    Programmatic,
}

impl ActionInitiator {
    /// Whether failure notices should be surfaced to the initiator
    pub fn is_interactive(&self) -> bool {
        matches!(self, ActionInitiator::InteractiveUser)
    }
}

impl fmt::Display for ActionInitiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionInitiator::InteractiveUser => "user",
            ActionInitiator::Console => "console",
            ActionInitiator::Scheduled => "scheduler",
            ActionInitiator::Programmatic => "api",
        };
        f.write_str(name)
    }
}

/// Configuration consumed by a backup job
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Archive format to produce
    pub format: ArchiveFormat,
    /// Maximum compression threads; zero or negative means all cores
    pub compression_core_count_limit: i32,
    /// Announce completion to everyone instead of only the initiator
    pub broadcast_backup_done: bool,
    /// Cleanup behavior on failure
    pub error_handling_mode: ErrorHandlingMode,
    /// Relative-path patterns excluded from every archive
    pub file_blacklist: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::Zip,
            compression_core_count_limit: 0,
            broadcast_backup_done: false,
            error_handling_mode: ErrorHandlingMode::Strict,
            file_blacklist: Vec::new(),
        }
    }
}

impl BackupConfig {
    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: BackupConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration can drive a job
    pub fn validate(&self) -> Result<()> {
        crate::blacklist::Blacklist::new(&self.file_blacklist).map(|_| ())
    }
}

/// Result of finalizing a [`crate::tree_hash::FileTreeHasher`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSummary {
    /// Tree digest as lowercase hex
    pub digest: String,
    /// Number of files folded into the digest
    pub file_count: u64,
    /// Sum of the sizes of those files
    pub total_size: u64,
}

/// Self-describing summary embedded as the last entry of an archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionStatus {
    /// Layout version of this record
    pub version: u32,
    /// Version of the crate that wrote the archive
    pub writer_version: String,
    /// Archive format
    pub format: ArchiveFormat,
    /// Order-independent digest of the archived tree
    pub tree_hash: String,
    /// Number of archived files (trailer excluded)
    pub file_count: u64,
    /// Uncompressed size of the archived files
    pub total_size: u64,
    /// Files that could not be archived, with the reason
    pub broken_files: BTreeMap<String, String>,
    /// When the job started
    pub started_at: DateTime<Utc>,
    /// When the trailer was built
    pub finished_at: DateTime<Utc>,
    /// Host that produced the archive
    pub hostname: Option<String>,
    /// Who asked for the backup
    pub initiator: ActionInitiator,
    /// Free-text comment attached to the job
    pub comment: Option<String>,
}

impl CompressionStatus {
    /// Whether every walked file made it into the archive
    pub fn is_complete(&self) -> bool {
        self.broken_files.is_empty()
    }

    /// Serialize for embedding in the archive
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a trailer read back from an archive
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let status: CompressionStatus = serde_json::from_slice(bytes)?;
        if status.version > STATUS_VERSION {
            return Err(ArchiveError::VerificationFailed(format!(
                "status version {} is newer than supported version {}",
                status.version, STATUS_VERSION
            )));
        }
        Ok(status)
    }
}

/// Accumulates a [`CompressionStatus`] while an archive is written
#[derive(Debug, Clone)]
pub struct CompressionStatusBuilder {
    format: ArchiveFormat,
    started_at: DateTime<Utc>,
    initiator: ActionInitiator,
    comment: Option<String>,
    broken_files: BTreeMap<String, String>,
}

impl CompressionStatusBuilder {
    /// Start a status for a job
    pub fn new(format: ArchiveFormat, started_at: DateTime<Utc>, initiator: ActionInitiator) -> Self {
        Self {
            format,
            started_at,
            initiator,
            comment: None,
            broken_files: BTreeMap::new(),
        }
    }

    /// Attach the job comment
    pub fn comment(mut self, comment: Option<String>) -> Self {
        self.comment = comment;
        self
    }

    /// Record a file that could not be archived
    pub fn add_broken_file(&mut self, path: impl Into<String>, reason: impl fmt::Display) {
        self.broken_files.insert(path.into(), reason.to_string());
    }

    /// Number of broken files recorded so far
    pub fn broken_count(&self) -> usize {
        self.broken_files.len()
    }

    /// Produce the immutable snapshot
    pub fn build(self, tree: TreeSummary) -> CompressionStatus {
        CompressionStatus {
            version: STATUS_VERSION,
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
            format: self.format,
            tree_hash: tree.digest,
            file_count: tree.file_count,
            total_size: tree.total_size,
            broken_files: self.broken_files,
            started_at: self.started_at,
            finished_at: Utc::now(),
            hostname: hostname::get().ok().and_then(|h| h.into_string().ok()),
            initiator: self.initiator,
            comment: self.comment,
        }
    }
}
