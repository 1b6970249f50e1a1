//! Relative-path exclusion for tree walks
//!
//! Patterns use glob syntax and are matched against the path relative to the
//! archived directory. A pattern that names a directory also excludes
//! everything beneath it, so `logs` and `logs/**` behave the same

use crate::error::{ArchiveError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Read-only set of excluded relative-path patterns
#[derive(Debug, Clone)]
pub struct Blacklist {
    globset: GlobSet,
    patterns: Vec<String>,
}

impl Blacklist {
    /// Compiles the given patterns
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let trimmed = pattern.trim().trim_end_matches('/');
            if trimmed.is_empty() {
                continue;
            }

            for candidate in [trimmed.to_string(), format!("{}/**", trimmed)] {
                let glob = Glob::new(&candidate)
                    .map_err(|e| ArchiveError::InvalidPattern(format!("'{}': {}", pattern, e)))?;
                builder.add(glob);
            }
        }

        let globset = builder
            .build()
            .map_err(|e| ArchiveError::InvalidPattern(format!("failed to build blacklist: {}", e)))?;

        Ok(Self {
            globset,
            patterns: patterns.to_vec(),
        })
    }

    /// A blacklist that excludes nothing
    pub fn empty() -> Self {
        Self {
            globset: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// Returns true if the relative path must not be archived
    pub fn is_blacklisted(&self, relative: &Path) -> bool {
        !relative.as_os_str().is_empty() && self.globset.is_match(relative)
    }

    /// Patterns this blacklist was built from
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::empty()
    }
}
