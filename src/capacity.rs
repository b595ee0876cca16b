// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Volatile storage capacity and mount checks.

use nix::sys::statvfs::statvfs;
use std::{
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

/// Measure free space of a file system.
pub trait CapacityProbe {
    /// Bytes available to unprivileged users on file system holding path.
    fn available(&self, path: &Path) -> Result<u64>;
}

/// Capacity probe through statvfs(3).
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl CapacityProbe for StatvfsProbe {
    #[allow(clippy::unnecessary_cast)]
    fn available(&self, path: &Path) -> Result<u64> {
        let stat = statvfs(path).map_err(|errno| CapacityError::Statvfs {
            source: errno,
            path: path.to_path_buf(),
        })?;

        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

/// Capacity probe that always reports the same amount.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl CapacityProbe for FixedProbe {
    fn available(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}

/// Check if path is the root of a mounted file system.
///
/// A directory is a mount point when it lives on a different device than its
/// parent. The file system root always counts as a mount point. Missing paths
/// never do.
pub fn is_mount_point(path: impl AsRef<Path>) -> bool {
    let Ok(path) = fs::canonicalize(path.as_ref()) else {
        return false;
    };
    let Some(parent) = path.parent() else {
        return true;
    };

    match (fs::metadata(&path), fs::metadata(parent)) {
        (Ok(meta), Ok(parent_meta)) => meta.is_dir() && meta.dev() != parent_meta.dev(),
        _ => false,
    }
}

/// Capacity probing error types.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// File system statistics cannot be read.
    #[error("failed to query free space at {:?}", path.display())]
    Statvfs {
        #[source]
        source: nix::errno::Errno,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = CapacityError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn statvfs_reports_free_space() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        assert!(StatvfsProbe.available(dir.path())? > 0);
        Ok(())
    }

    #[test]
    fn statvfs_fails_on_missing_path() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let result = StatvfsProbe.available(&dir.path().join("missing"));
        assert!(matches!(result, Err(CapacityError::Statvfs { .. })));
        Ok(())
    }

    #[test]
    fn plain_directory_is_not_mount_point() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let plain = dir.path().join("ram");
        fs::create_dir(&plain)?;

        assert!(!is_mount_point(&plain));
        assert!(!is_mount_point(dir.path().join("missing")));
        assert!(is_mount_point("/"));

        Ok(())
    }
}
