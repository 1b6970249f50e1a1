//! Error types for treearchive
//!
//! This module defines every error that can occur while walking a tree,
//! writing an archive or running a backup job. Errors are classified so that
//! callers can tell a full storage device (a known, user-actionable condition
//! that leaves a corrupt archive behind) apart from generic I/O failures and
//! from failures that only concern a single file.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the treearchive library
pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Main error type for all archive operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// I/O errors during setup, traversal or finalization
    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    /// The storage device ran out of space while the archive was written
    #[error("No space left on device while writing {path:?}")]
    DeviceExhausted {
        /// Archive being written
        path: PathBuf,
        /// Error that reported the condition
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A single entry could not be archived; the archive itself is intact
    #[error("Failed to archive {path}: {source}")]
    Entry {
        /// Archive-relative path of the entry
        path: String,
        /// Underlying read error
        #[source]
        source: io::Error,
    },

    /// A compression worker failed or disappeared
    #[error("Execution failure: {0}")]
    Execution(String),

    /// `update` was called on a closed hash aggregator
    #[error("Hash aggregator is already closed")]
    AggregatorClosed,

    /// `finalize` was called twice on the same hash aggregator
    #[error("Hash aggregator was already finalized")]
    AggregatorFinalized,

    /// Errors from the ZIP writer or reader
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Walk directory error from walkdir crate
    #[error("Walk directory error: {0}")]
    WalkDir(#[from] walkdir::Error),

    /// Blacklist pattern parsing error
    #[error("Invalid blacklist pattern: {0}")]
    InvalidPattern(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A host collaborator call failed
    #[error("Host operation failed: {0}")]
    Host(String),

    /// Archive verification failed
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<io::Error> for ArchiveError {
    /// Readers and writers can only report `io::Error`, so archive errors raised
    /// inside them travel wrapped. Unwrap them here to keep the original class.
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<ArchiveError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(archive) = inner.downcast::<ArchiveError>() {
                    return *archive;
                }
            }
            return ArchiveError::Internal("lost wrapped archive error".to_string());
        }
        ArchiveError::Io(err)
    }
}

impl ArchiveError {
    /// Create an execution error with a custom message
    pub fn execution(msg: impl Into<String>) -> Self {
        ArchiveError::Execution(msg.into())
    }

    /// Create a host error with a custom message
    pub fn host(msg: impl Into<String>) -> Self {
        ArchiveError::Host(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        ArchiveError::Internal(msg.into())
    }

    /// Create a per-entry failure
    pub fn entry(path: impl Into<String>, source: io::Error) -> Self {
        ArchiveError::Entry {
            path: path.into(),
            source,
        }
    }

    /// Wrap this error so it can cross an `io::Read`/`io::Write` boundary
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }

    /// Check if this error is the known "device full" corruption case
    pub fn is_known_issue(&self) -> bool {
        matches!(self, ArchiveError::DeviceExhausted { .. })
    }

    /// Check if this error only concerns a single entry
    pub fn is_per_file(&self) -> bool {
        matches!(self, ArchiveError::Entry { .. }) && !self.is_aggregator_misuse() && !self.is_device_full()
    }

    /// Check if this error reveals the hash aggregator being used after close
    pub fn is_aggregator_misuse(&self) -> bool {
        match self {
            ArchiveError::AggregatorClosed | ArchiveError::AggregatorFinalized => true,
            ArchiveError::Entry { source, .. } | ArchiveError::Io(source) => source
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<ArchiveError>())
                .is_some_and(ArchiveError::is_aggregator_misuse),
            _ => false,
        }
    }

    /// Check if anything in this error's chain says the storage device is full
    pub fn is_device_full(&self) -> bool {
        self.is_known_issue() || chain_reports_device_full(self)
    }

    /// Reclassify a fatal error as `DeviceExhausted` when the device is full
    pub fn classify(self, archive: impl Into<PathBuf>) -> Self {
        if self.is_known_issue() || !self.is_device_full() {
            return self;
        }
        ArchiveError::DeviceExhausted {
            path: archive.into(),
            source: Box::new(self),
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            ArchiveError::DeviceExhausted { path, .. } => format!(
                "Backup failed. The file {:?} is corrupt: the storage device ran out of space. \
                 This is a known issue; free some space and run the backup again.",
                path
            ),
            ArchiveError::Entry { path, .. } => {
                format!("Something went wrong while compressing {}. The backup continues without it.", path)
            }
            ArchiveError::AggregatorClosed | ArchiveError::AggregatorFinalized => {
                "Internal error: the integrity digest was used after it was finalized.".to_string()
            }
            _ => "Something went wrong while compressing files!".to_string(),
        }
    }
}

/// Walk an error chain looking for a storage-full I/O error
pub(crate) fn chain_reports_device_full(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::StorageFull {
                return true;
            }
            if let Some(inner) = io_err.get_ref() {
                if chain_reports_device_full(inner) {
                    return true;
                }
            }
        }
        if let Some(zip::result::ZipError::Io(io_err)) = e.downcast_ref::<zip::result::ZipError>() {
            if chain_reports_device_full(io_err) {
                return true;
            }
        }
        current = e.source();
    }
    false
}
