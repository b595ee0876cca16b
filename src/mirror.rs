// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Mirror copy of directory trees.
//!
//! A __mirror copy__ makes a destination tree an exact replica of a source
//! tree. It copies whatever is new or changed, and deletes whatever exists at
//! the destination but not at the source. Regular files, directories, and
//! symbolic links are mirrored. File content, permissions, and modification
//! times are preserved so that build tools see the same tree on both sides.
//!
//! # Quick Check
//!
//! A regular file whose size and modification time already match at the
//! destination is left alone. This keeps repeated mirror copies of an
//! unchanged tree cheap.
//!
//! # Exclusion Globs
//!
//! Exclusion globs follow gitignore syntax relative to the root of each tree.
//! Excluded paths are neither copied from the source nor deleted from the
//! destination.

use ignore::{overrides::OverrideBuilder, Walk, WalkBuilder};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{self, File, FileTimes, Metadata},
    io,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Allocation unit assumed for volatile storage.
pub const PAGE_SIZE: u64 = 4096;

/// Mirror copy engine.
#[derive(Debug, Default, Clone)]
pub struct Mirror {
    exclude: Vec<String>,
}

impl Mirror {
    /// Construct new mirror copy engine that excludes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude paths matching given globs.
    pub fn exclude(mut self, globs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude.extend(globs.into_iter().map(Into::into));
        self
    }

    /// Make destination an exact replica of source.
    ///
    /// Destination is created if missing. Extraneous destination entries are
    /// removed before anything is copied.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Walk`] if either tree cannot be traversed.
    /// - Return [`MirrorError::Exclude`] if exclusion globs are invalid.
    /// - Return [`MirrorError`] I/O variants if any entry cannot be mirrored.
    #[instrument(skip(self, src, dst), level = "debug")]
    pub fn run(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<MirrorStats> {
        let (src, dst) = (src.as_ref(), dst.as_ref());
        debug!("mirror {:?} to {:?}", src.display(), dst.display());
        let mut stats = MirrorStats::default();

        let src_meta = metadata(src)?;
        prepare_root(dst)?;

        let sources = self.collect(src)?;
        let source_set = sources
            .iter()
            .map(|entry| entry.relative.as_path())
            .collect::<HashSet<_>>();
        let extraneous = self
            .collect(dst)?
            .into_iter()
            .filter(|entry| !source_set.contains(entry.relative.as_path()))
            .collect::<Vec<_>>();
        stats.entries_removed = remove_extraneous(dst, &extraneous)?;

        let mut dirs = vec![(dst.to_path_buf(), src_meta)];
        for entry in &sources {
            let from = src.join(&entry.relative);
            let to = dst.join(&entry.relative);
            match entry.kind {
                EntryKind::Dir => {
                    if mirror_dir(&to)? {
                        stats.dirs_created += 1;
                    }
                    dirs.push((to, entry.metadata.clone()));
                }
                EntryKind::File => match mirror_file(&from, &to, &entry.metadata)? {
                    Some(bytes) => {
                        stats.files_copied += 1;
                        stats.bytes_copied += bytes;
                    }
                    None => stats.files_unchanged += 1,
                },
                EntryKind::Symlink => {
                    if mirror_symlink(&from, &to)? {
                        stats.links_copied += 1;
                    }
                }
                EntryKind::Other => {
                    warn!("skip special file {:?}", from.display());
                }
            }
        }

        // INVARIANT: Apply directory attributes deepest first, after every
        // child has been written, so read-only directories stay writable
        // during the copy and their mtime is not disturbed afterwards.
        for (path, meta) in dirs.iter().rev() {
            preserve_attributes(path, meta)?;
        }

        Ok(stats)
    }

    /// Estimate space a tree occupies once mirrored onto volatile storage.
    ///
    /// Memory-backed file systems hand out whole pages, so every non-empty
    /// regular file is rounded up to a multiple of [`PAGE_SIZE`]. Exclusion
    /// globs apply.
    ///
    /// # Errors
    ///
    /// - Return [`MirrorError::Walk`] if tree cannot be traversed.
    /// - Return [`MirrorError::Exclude`] if exclusion globs are invalid.
    pub fn tree_size(&self, root: impl AsRef<Path>) -> Result<u64> {
        Ok(self
            .collect(root.as_ref())?
            .iter()
            .filter(|entry| entry.kind == EntryKind::File)
            .map(|entry| entry.metadata.len().div_ceil(PAGE_SIZE) * PAGE_SIZE)
            .sum())
    }

    fn walker(&self, root: &Path) -> Result<Walk> {
        let mut builder = WalkBuilder::new(root);
        builder
            .standard_filters(false)
            .follow_links(false)
            .sort_by_file_name(|a, b| a.cmp(b));

        if !self.exclude.is_empty() {
            let mut overrides = OverrideBuilder::new(root);
            for glob in &self.exclude {
                // INVARIANT: Override globs whitelist by default, so negate
                // each one to turn it into an exclusion.
                overrides
                    .add(&format!("!{}", glob.trim_start_matches('!')))
                    .map_err(|err| MirrorError::Exclude {
                        source: err,
                        glob: glob.clone(),
                    })?;
            }
            let overrides = overrides.build().map_err(|err| MirrorError::Exclude {
                source: err,
                glob: self.exclude.join(", "),
            })?;
            builder.overrides(overrides);
        }

        Ok(builder.build())
    }

    fn collect(&self, root: &Path) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        for result in self.walker(root)? {
            let entry = result.map_err(|err| MirrorError::Walk {
                source: err,
                path: root.to_path_buf(),
            })?;

            // INVARIANT: Skip the root itself.
            if entry.depth() == 0 {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| entry.path().to_path_buf());
            let metadata = fs::symlink_metadata(entry.path()).map_err(|err| {
                MirrorError::Metadata {
                    source: err,
                    path: entry.path().to_path_buf(),
                }
            })?;

            entries.push(TreeEntry {
                kind: EntryKind::from(&metadata),
                relative,
                metadata,
            });
        }

        Ok(entries)
    }
}

/// Summary of what a mirror copy did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MirrorStats {
    /// Regular files whose content was copied.
    pub files_copied: u64,

    /// Regular files skipped by quick check.
    pub files_unchanged: u64,

    /// Symbolic links created.
    pub links_copied: u64,

    /// Directories created.
    pub dirs_created: u64,

    /// Destination entries deleted because the source lacks them.
    pub entries_removed: u64,

    /// Bytes of file content copied.
    pub bytes_copied: u64,
}

impl Display for MirrorStats {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{} files copied ({} bytes), {} unchanged, {} links, {} new directories, {} removed",
            self.files_copied,
            self.bytes_copied,
            self.files_unchanged,
            self.links_copied,
            self.dirs_created,
            self.entries_removed,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File,
    Symlink,
    Other,
}

impl From<&Metadata> for EntryKind {
    fn from(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_symlink() {
            Self::Symlink
        } else if file_type.is_dir() {
            Self::Dir
        } else if file_type.is_file() {
            Self::File
        } else {
            Self::Other
        }
    }
}

#[derive(Debug)]
struct TreeEntry {
    relative: PathBuf,
    kind: EntryKind,
    metadata: Metadata,
}

fn metadata(path: &Path) -> Result<Metadata> {
    fs::metadata(path).map_err(|err| MirrorError::Metadata {
        source: err,
        path: path.to_path_buf(),
    })
}

fn prepare_root(dst: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(dst) {
        if meta.is_dir() {
            return Ok(());
        }
        remove_entry(dst, &meta)?;
    }

    mkdirp::mkdirp(dst)
        .map(|_| ())
        .map_err(|err| MirrorError::CreateDir {
            source: err,
            path: dst.to_path_buf(),
        })
}

fn remove_extraneous(dst: &Path, extraneous: &[TreeEntry]) -> Result<u64> {
    let mut removed_dirs: Vec<&Path> = Vec::new();
    let mut count = 0;
    for entry in extraneous {
        // INVARIANT: Walk order puts parents first, so anything under an
        // already removed directory is gone.
        if removed_dirs
            .iter()
            .any(|dir| entry.relative.starts_with(dir))
        {
            continue;
        }

        let path = dst.join(&entry.relative);
        debug!("remove extraneous {:?}", path.display());
        remove_entry(&path, &entry.metadata)?;
        if entry.kind == EntryKind::Dir {
            removed_dirs.push(&entry.relative);
        }
        count += 1;
    }

    Ok(count)
}

fn remove_entry(path: &Path, meta: &Metadata) -> Result<()> {
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|err| MirrorError::Remove {
        source: err,
        path: path.to_path_buf(),
    })
}

fn mirror_dir(to: &Path) -> Result<bool> {
    match fs::symlink_metadata(to) {
        Ok(meta) if meta.is_dir() => return Ok(false),
        Ok(meta) => remove_entry(to, &meta)?,
        Err(_) => {}
    }

    fs::create_dir(to).map_err(|err| MirrorError::CreateDir {
        source: err,
        path: to.to_path_buf(),
    })?;

    Ok(true)
}

fn mirror_file(from: &Path, to: &Path, meta: &Metadata) -> Result<Option<u64>> {
    if let Ok(existing) = fs::symlink_metadata(to) {
        if existing.is_file()
            && existing.len() == meta.len()
            && existing.modified().ok() == meta.modified().ok()
        {
            return Ok(None);
        }

        remove_entry(to, &existing)?;
    }

    let copy_err = |err: io::Error| MirrorError::Copy {
        source: err,
        from: from.to_path_buf(),
        to: to.to_path_buf(),
    };

    let mut reader = File::open(from).map_err(copy_err)?;
    let mut writer = File::create(to).map_err(copy_err)?;
    let bytes = io::copy(&mut reader, &mut writer).map_err(copy_err)?;
    drop(writer);
    preserve_attributes(to, meta)?;

    Ok(Some(bytes))
}

fn mirror_symlink(from: &Path, to: &Path) -> Result<bool> {
    let link_err = |err: io::Error| MirrorError::Link {
        source: err,
        path: to.to_path_buf(),
    };

    let target = fs::read_link(from).map_err(link_err)?;
    if let Ok(existing) = fs::symlink_metadata(to) {
        if existing.file_type().is_symlink()
            && fs::read_link(to).ok().as_deref() == Some(target.as_path())
        {
            return Ok(false);
        }

        remove_entry(to, &existing)?;
    }

    symlink(&target, to).map_err(link_err)?;

    Ok(true)
}

fn preserve_attributes(path: &Path, meta: &Metadata) -> Result<()> {
    let attr_err = |err: io::Error| MirrorError::Attributes {
        source: err,
        path: path.to_path_buf(),
    };

    let modified = meta.modified().map_err(attr_err)?;
    let accessed = meta.accessed().unwrap_or(modified);
    let times = FileTimes::new()
        .set_modified(modified)
        .set_accessed(accessed);

    // INVARIANT: Set times before permissions. A read-only mode would
    // otherwise block opening the file for writing.
    let handle = if meta.is_dir() {
        File::open(path)
    } else {
        File::options().write(true).open(path)
    }
    .map_err(attr_err)?;
    handle.set_times(times).map_err(attr_err)?;
    drop(handle);

    fs::set_permissions(path, meta.permissions()).map_err(attr_err)
}

/// Mirror copy error types.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Tree cannot be traversed.
    #[error("failed to walk {:?}", path.display())]
    Walk {
        #[source]
        source: ignore::Error,
        path: PathBuf,
    },

    /// Exclusion glob is invalid.
    #[error("invalid exclusion glob {glob:?}")]
    Exclude {
        #[source]
        source: ignore::Error,
        glob: String,
    },

    /// Entry metadata cannot be read.
    #[error("failed to read metadata of {:?}", path.display())]
    Metadata {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Directory cannot be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// File content cannot be copied.
    #[error("failed to copy {:?} to {:?}", from.display(), to.display())]
    Copy {
        #[source]
        source: io::Error,
        from: PathBuf,
        to: PathBuf,
    },

    /// Symbolic link cannot be recreated.
    #[error("failed to link {:?}", path.display())]
    Link {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Extraneous entry cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    Remove {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// Permissions or times cannot be preserved.
    #[error("failed to preserve attributes of {:?}", path.display())]
    Attributes {
        #[source]
        source: io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = MirrorError> = std::result::Result<T, E>;
