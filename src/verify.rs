//! Reading archives back
//!
//! [`ArchiveReader`] streams the entries of an archive in any supported
//! format. [`verify_archive`] uses it to recompute the tree digest from the
//! archived content and compares it with the digest recorded in the status
//! trailer.

use crate::error::{ArchiveError, Result};
use crate::tree_hash::{ContentHash, FileTreeHasher};
use crate::types::{ArchiveFormat, CompressionStatus, TreeSummary, STATUS_FILENAME};
use flate2::read::MultiGzDecoder;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::EntryType;
use tracing::{debug, info, instrument, warn};

type Visitor<'a> = dyn FnMut(&str, &mut dyn Read) -> Result<()> + 'a;

/// Sequential reader over the entries of an archive
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    path: PathBuf,
    format: ArchiveFormat,
}

impl ArchiveReader {
    /// Reader for an archive of a known format
    pub fn new(path: impl Into<PathBuf>, format: ArchiveFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    /// Reader with the format inferred from the file name
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidConfiguration`] for unknown extensions.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = ArchiveFormat::from_path(&path).ok_or_else(|| {
            ArchiveError::InvalidConfiguration(format!("cannot tell the archive format of {:?}", path))
        })?;
        Ok(Self::new(path, format))
    }

    /// Archive format
    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Archive path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call `visit` with the name and content of every file entry, in order
    pub fn for_each_entry<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&str, &mut dyn Read) -> Result<()>,
    {
        let file = BufReader::new(File::open(&self.path)?);
        match self.format {
            ArchiveFormat::Zip => zip_entries(file, &mut visit),
            ArchiveFormat::Tar => tar_entries(file, &mut visit),
            ArchiveFormat::Gzip => tar_entries(MultiGzDecoder::new(file), &mut visit),
            ArchiveFormat::Bzip2 => tar_entries(bzip2::read::MultiBzDecoder::new(file), &mut visit),
            ArchiveFormat::Lzma => tar_entries(xz2::read::XzDecoder::new(file), &mut visit),
        }
    }

    /// Names of every file entry, in archive order
    pub fn entry_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.for_each_entry(|name, _| {
            names.push(name.to_string());
            Ok(())
        })?;
        Ok(names)
    }
}

fn zip_entries(file: BufReader<File>, visit: &mut Visitor<'_>) -> Result<()> {
    let mut archive = zip::ZipArchive::new(file)?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        visit(&name, &mut entry)?;
    }
    Ok(())
}

fn tar_entries<R: Read>(reader: R, visit: &mut Visitor<'_>) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        visit(&name, &mut entry)?;
    }
    Ok(())
}

/// Result of checking an archive against its status trailer
#[derive(Debug, Clone)]
pub struct VerificationReport {
    /// Trailer found in the archive
    pub status: CompressionStatus,
    /// Digest recomputed from the archived content
    pub recomputed: TreeSummary,
    /// File entries folded into the digest, trailer and broken placeholders excluded
    pub entry_count: u64,
    /// Number of status trailers found
    pub trailer_count: usize,
}

impl VerificationReport {
    /// Whether the recomputed digest matches the trailer
    pub fn digest_matches(&self) -> bool {
        self.recomputed.digest == self.status.tree_hash
            && self.recomputed.file_count == self.status.file_count
            && self.recomputed.total_size == self.status.total_size
    }

    /// Digest matches and there is exactly one trailer
    pub fn is_valid(&self) -> bool {
        self.trailer_count == 1 && self.digest_matches()
    }
}

/// Recompute the tree digest of an archive and compare it with its trailer
///
/// Entries the trailer lists as broken are left out of the recomputed digest;
/// TAR archives keep a zero-padded placeholder for them.
///
/// # Errors
///
/// Fails if the archive cannot be read or carries no status trailer. A digest
/// mismatch is not an error; check [`VerificationReport::is_valid`].
#[instrument]
pub fn verify_archive(path: &Path, format: ArchiveFormat) -> Result<VerificationReport> {
    let mut trailers = Vec::new();
    let mut entries: Vec<(String, ContentHash, u64)> = Vec::new();

    ArchiveReader::new(path, format).for_each_entry(|name, content| {
        if name == STATUS_FILENAME {
            let mut raw = Vec::new();
            content.read_to_end(&mut raw)?;
            trailers.push(raw);
            return Ok(());
        }

        let mut digest = Sha256::new();
        let size = io::copy(content, &mut digest)?;
        entries.push((name.to_string(), digest.finalize().into(), size));
        Ok(())
    })?;

    let trailer_count = trailers.len();
    let raw = trailers
        .pop()
        .ok_or_else(|| ArchiveError::VerificationFailed(format!("{:?} has no status trailer", path)))?;
    if trailer_count > 1 {
        warn!("{:?} carries {} status trailers; using the last one", path, trailer_count);
    }
    let status = CompressionStatus::from_bytes(&raw)?;

    let hasher = FileTreeHasher::new();
    let mut entry_count = 0u64;
    for (name, hash, size) in &entries {
        if status.broken_files.contains_key(name) {
            debug!("Skipping placeholder for broken file {}", name);
            continue;
        }
        hasher.update(name, hash, *size)?;
        entry_count += 1;
    }

    let report = VerificationReport {
        status,
        recomputed: hasher.finalize()?,
        entry_count,
        trailer_count,
    };

    if report.is_valid() {
        info!("{:?} verified: {} files", path, report.entry_count);
    } else {
        debug!(
            expected = %report.status.tree_hash,
            actual = %report.recomputed.digest,
            "Digest mismatch for {:?}",
            path
        );
    }
    Ok(report)
}
