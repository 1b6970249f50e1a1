//! Byte sources for archive entries
//!
//! An [`InputSupplier`] produces the stream for exactly one archive entry. The
//! stream is opened lazily so that parallel codecs can open files on their
//! worker threads instead of holding a descriptor per queued entry.
//!
//! [`FileSupplier`] reads a file from disk. It captures size, mode and mtime
//! from the same handle it reads, never reads past the size observed at open
//! (the tree may be changing underneath us), and reports its SHA-256 content
//! hash to the shared [`FileTreeHasher`] once the stream has been read to its
//! end. [`StatusSupplier`] serves the in-memory status trailer.

use crate::tree_hash::{ContentHash, FileTreeHasher};
use crate::types::STATUS_FILENAME;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Cursor, Read, Take};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Metadata stored alongside an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Number of bytes the stream will produce
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
    /// Last modification time
    pub modified: DateTime<Utc>,
}

/// An opened entry: its metadata and the bytes to write
pub struct EntryStream {
    /// Metadata captured when the entry was opened
    pub metadata: EntryMetadata,
    /// Entry content
    pub reader: Box<dyn Read + Send>,
}

/// Producer of the content of one archive entry
pub trait InputSupplier: Send {
    /// Archive-relative, `/`-separated path of the entry
    fn path(&self) -> &str;

    /// Short name for messages
    fn display_name(&self) -> &str {
        let path = self.path();
        path.rsplit('/').next().unwrap_or(path)
    }

    /// Open the entry for reading
    fn open(&mut self) -> io::Result<EntryStream>;
}

/// Supplier backed by a file on disk
#[derive(Debug)]
pub struct FileSupplier {
    source: PathBuf,
    path: String,
    hasher: Arc<FileTreeHasher>,
}

impl FileSupplier {
    /// Create a supplier for `source`, archived as `path`
    pub fn new(source: PathBuf, path: String, hasher: Arc<FileTreeHasher>) -> Self {
        Self { source, path, hasher }
    }

    /// File on disk
    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl InputSupplier for FileSupplier {
    fn path(&self) -> &str {
        &self.path
    }

    fn open(&mut self) -> io::Result<EntryStream> {
        let file = File::open(&self.source)?;
        let meta = file.metadata()?;

        let metadata = EntryMetadata {
            size: meta.len(),
            mode: file_mode(&meta),
            modified: meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
        };

        let reader = HashingReader {
            inner: file.take(metadata.size),
            digest: Sha256::new(),
            bytes: 0,
            path: self.path.clone(),
            hasher: Arc::clone(&self.hasher),
            reported: false,
        };

        Ok(EntryStream {
            metadata,
            reader: Box::new(reader),
        })
    }
}

/// Reader that hashes what passes through and reports at end of stream
struct HashingReader {
    inner: Take<File>,
    digest: Sha256,
    bytes: u64,
    path: String,
    hasher: Arc<FileTreeHasher>,
    reported: bool,
}

impl Read for HashingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.digest.update(&buf[..n]);
            self.bytes += n as u64;
        } else if !buf.is_empty() && !self.reported {
            self.reported = true;
            let content: ContentHash = std::mem::take(&mut self.digest).finalize().into();
            self.hasher
                .update(&self.path, &content, self.bytes)
                .map_err(|e| e.into_io())?;
        }
        Ok(n)
    }
}

/// Supplier for the in-memory status trailer
#[derive(Debug, Clone)]
pub struct StatusSupplier {
    data: Arc<[u8]>,
}

impl StatusSupplier {
    /// Wrap serialized status bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self { data: data.into() }
    }
}

impl InputSupplier for StatusSupplier {
    fn path(&self) -> &str {
        STATUS_FILENAME
    }

    fn open(&mut self) -> io::Result<EntryStream> {
        Ok(EntryStream {
            metadata: EntryMetadata {
                size: self.data.len() as u64,
                mode: 0o644,
                modified: Utc::now(),
            },
            reader: Box::new(Cursor::new(Arc::clone(&self.data))),
        })
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}
