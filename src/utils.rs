//! Utility functions for treearchive
//!
//! Path normalization, parallelism budgeting, archive naming and volume
//! detection helpers used by the pipeline and the orchestrator.

use crate::error::{ArchiveError, Result};
use crate::types::ArchiveFormat;
use chrono::{DateTime, Local};
use std::path::{Component, Path};
use std::time::Duration;
use tracing::trace;

/// Timestamp layout used in archive file names
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y.%m.%d_%H-%M-%S";

/// Characters that may not appear in an archive file name
const UNSAFE_FILENAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '#'];

/// Convert a walked path into the `/`-separated name it gets inside the archive
///
/// # Errors
///
/// Returns an error if `path` is not inside `base`.
pub fn relative_entry_name(path: &Path, base: &Path) -> Result<String> {
    let relative = path.strip_prefix(base).map_err(|_| {
        ArchiveError::internal(format!("{:?} is not inside {:?}", path, base))
    })?;

    let parts: Vec<_> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();

    Ok(parts.join("/"))
}

/// Number of compression threads for a configured limit
///
/// A limit of zero or less means "all available cores". The result is never
/// below one.
pub fn effective_core_count(limit: i32, available: usize) -> usize {
    let available = available.max(1);
    if limit <= 0 {
        available
    } else {
        (limit as usize).min(available)
    }
}

/// Strip characters that are unsafe in file names from a comment
pub fn sanitize_comment(comment: &str) -> String {
    comment.chars().filter(|c| !UNSAFE_FILENAME_CHARS.contains(c)).collect()
}

/// Build the archive file name for a job
///
/// `<timestamp>[#<comment>]<extension>`, e.g. `2024.03.01_12-00-00#pre-update.tar.gz`.
pub fn backup_file_name(started_at: &DateTime<Local>, comment: Option<&str>, format: ArchiveFormat) -> String {
    let mut name = started_at.format(FILE_TIMESTAMP_FORMAT).to_string();
    if let Some(comment) = comment {
        let clean = sanitize_comment(comment);
        if !clean.is_empty() {
            name.push('#');
            name.push_str(&clean);
        }
    }
    name.push_str(format.extension());
    name
}

/// Format a duration for user-facing messages, rounded to milliseconds
pub fn format_elapsed(elapsed: Duration) -> String {
    humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)).to_string()
}

/// Whether `path` lives on a memory-backed file system (tmpfs or ramfs)
///
/// Unknown or unsupported platforms report `false`.
#[cfg(target_os = "linux")]
pub fn is_memory_backed(path: &Path) -> bool {
    use nix::sys::statfs::{statfs, TMPFS_MAGIC};

    const RAMFS_MAGIC: u32 = 0x8584_58f6;

    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("/"));

    match statfs(probe) {
        Ok(stat) => {
            let fs_type = stat.filesystem_type();
            let memory = fs_type == TMPFS_MAGIC || is_ramfs_magic(fs_type.0 as u64, RAMFS_MAGIC);
            trace!("{:?} is on {:?} (memory backed: {})", probe, fs_type, memory);
            memory
        }
        Err(e) => {
            trace!("statfs({:?}) failed: {}", probe, e);
            false
        }
    }
}

/// `f_type` is signed on some targets, so only the low 32 bits are compared
#[cfg(target_os = "linux")]
fn is_ramfs_magic(fs_type: u64, magic: u32) -> bool {
    fs_type as u32 == magic
}

/// Whether `path` lives on a memory-backed file system (tmpfs or ramfs)
///
/// Unknown or unsupported platforms report `false`.
#[cfg(not(target_os = "linux"))]
pub fn is_memory_backed(path: &Path) -> bool {
    trace!("No memory-backed volume detection for {:?} on this platform", path);
    false
}
