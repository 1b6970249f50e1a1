//! Order-independent integrity digest over a file tree
//!
//! Every archived file contributes a fingerprint, `SHA-256(path ‖ content hash)`,
//! which is folded into a running 32-byte aggregate with XOR. Because XOR is
//! commutative and associative the result does not depend on the order in
//! which compression workers finish, so the digest of a tree can be computed
//! while entries are written in parallel.
//!
//! ```text
//!   a.txt ──► SHA-256("a.txt" ‖ h1) ─┐
//!   b/c.txt ► SHA-256("b/c.txt" ‖ h2) ┼─► XOR ─► SHA-256(aggregate ‖ count ‖ size)
//!   ...                              ─┘
//! ```
//!
//! The file count and total size are mixed in when the aggregator is
//! finalized, which also closes it for good.
//!
//! ## Example
//!
//! ```rust
//! use treearchive::tree_hash::{content_hash, FileTreeHasher};
//!
//! let hasher = FileTreeHasher::new();
//! hasher.update("a.txt", &content_hash(b"alpha"), 5).unwrap();
//! hasher.update("b/c.txt", &content_hash(b"gamma"), 5).unwrap();
//!
//! let summary = hasher.finalize().unwrap();
//! assert_eq!(summary.file_count, 2);
//! assert!(hasher.update("late.txt", &content_hash(b""), 0).is_err());
//! ```

use crate::error::{ArchiveError, Result};
use crate::types::{TreeSummary, STATUS_FILENAME};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// SHA-256 digest of a file's content
pub type ContentHash = [u8; 32];

/// Hash an in-memory buffer the same way file content is hashed
pub fn content_hash(data: &[u8]) -> ContentHash {
    Sha256::digest(data).into()
}

#[derive(Debug, Default)]
struct HasherState {
    aggregate: [u8; 32],
    files: u64,
    bytes: u64,
    closed: bool,
}

/// Collects per-file fingerprints into one tree digest
///
/// # Thread Safety
///
/// All state sits behind one mutex, so the aggregate, the file count and the
/// byte total are always observed together. Share it with `Arc`.
#[derive(Debug, Default)]
pub struct FileTreeHasher {
    state: Mutex<HasherState>,
}

impl FileTreeHasher {
    /// Create an open aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one file into the digest
    ///
    /// `path` is the archive-relative, `/`-separated path. The status trailer
    /// is silently ignored so an archive never hashes its own summary.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::AggregatorClosed`] once [`finalize`](Self::finalize)
    /// has run.
    pub fn update(&self, path: &str, content_hash: &ContentHash, size: u64) -> Result<()> {
        if self.state.lock().closed {
            return Err(ArchiveError::AggregatorClosed);
        }

        if path == STATUS_FILENAME {
            return Ok(());
        }

        let fingerprint = fingerprint(path, content_hash);

        let mut state = self.state.lock();
        if state.closed {
            return Err(ArchiveError::AggregatorClosed);
        }
        for (acc, byte) in state.aggregate.iter_mut().zip(fingerprint.iter()) {
            *acc ^= byte;
        }
        state.files += 1;
        state.bytes += size;
        trace!(path, size, files = state.files, "Folded file into tree digest");
        Ok(())
    }

    /// Number of files folded in so far
    pub fn files_processed(&self) -> u64 {
        self.state.lock().files
    }

    /// Whether the aggregator has been finalized
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Close the aggregator and compute the tree digest
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::AggregatorFinalized`] if called more than once.
    pub fn finalize(&self) -> Result<TreeSummary> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ArchiveError::AggregatorFinalized);
        }
        state.closed = true;

        debug!(
            files = state.files,
            bytes = state.bytes,
            raw = %hex::encode(state.aggregate),
            "Closing tree hasher"
        );

        let mut hasher = Sha256::new();
        hasher.update(state.aggregate);
        hasher.update(state.files.to_le_bytes());
        hasher.update(state.bytes.to_le_bytes());

        Ok(TreeSummary {
            digest: hex::encode(hasher.finalize()),
            file_count: state.files,
            total_size: state.bytes,
        })
    }
}

fn fingerprint(path: &str, content_hash: &ContentHash) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(content_hash);
    hasher.finalize().into()
}
