// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Sync registry management.
//!
//! The __sync registry__ remembers which persistent project tree was mirrored
//! into which volatile tree, so that a project can later be copied back to
//! disk by name alone.
//!
//! # Registry File Layout
//!
//! The registry is a plain text file. Each line records one project in the
//! form `persistent_path|volatile_path`. No project name is stored. Instead,
//! the name of a project is always derived from the final segment of its
//! persistent path. So, `/home/u/git/alpha|/mnt/ramdisk/alpha` records a
//! project named "alpha".
//!
//! Blank lines are ignored. Lines that do not contain the delimiter are
//! skipped with a warning.
//!
//! # Upsert Semantics
//!
//! Recording a project whose name is already in the registry replaces the old
//! line, and the fresh line is moved to the end of the file. Thus, the registry
//! holds at most one line per project name. Older registry files may still
//! contain duplicate names. When that happens, the last line wins.
//!
//! Every write rewrites the whole file through a temporary sibling file that
//! is atomically renamed over the registry. Writers serialize through an
//! advisory lock on a sibling `.lock` file.

use nix::fcntl::{Flock, FlockArg};
use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

const DELIMITER: char = '|';

/// One project recorded in the sync registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    name: String,
    persistent_path: PathBuf,
    volatile_path: PathBuf,
}

impl RegistryEntry {
    /// Construct new registry entry.
    ///
    /// Derives project name from final segment of persistent path.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NamelessPath`] if persistent path has no
    ///   final segment.
    /// - Return [`RegistryError::UnrepresentablePath`] if either path is not
    ///   valid UTF-8, or contains the registry delimiter or a line break.
    pub fn new(
        persistent_path: impl Into<PathBuf>,
        volatile_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let persistent_path = persistent_path.into();
        let volatile_path = volatile_path.into();

        for path in [&persistent_path, &volatile_path] {
            match path.to_str() {
                Some(text) if !text.contains(DELIMITER) && !text.contains(['\n', '\r']) => {}
                _ => return Err(RegistryError::UnrepresentablePath { path: path.clone() }),
            }
        }

        let name = project_name(&persistent_path)?;

        Ok(Self {
            name,
            persistent_path,
            volatile_path,
        })
    }

    /// Name of the project.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of project on persistent storage.
    pub fn persistent_path(&self) -> &Path {
        &self.persistent_path
    }

    /// Location of project on volatile storage.
    pub fn volatile_path(&self) -> &Path {
        &self.volatile_path
    }
}

impl Display for RegistryEntry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(
            fmt,
            "{}{DELIMITER}{}",
            self.persistent_path.display(),
            self.volatile_path.display()
        )
    }
}

impl FromStr for RegistryEntry {
    type Err = RegistryError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let (persistent, volatile) =
            line.split_once(DELIMITER)
                .ok_or_else(|| RegistryError::MalformedLine {
                    line: line.to_string(),
                })?;

        if persistent.is_empty() || volatile.is_empty() {
            return Err(RegistryError::MalformedLine {
                line: line.to_string(),
            });
        }

        Self::new(persistent, volatile)
    }
}

/// Derive project name from the final segment of a path.
///
/// # Errors
///
/// - Return [`RegistryError::NamelessPath`] if path has no final segment,
///   e.g., `/` or `..`.
/// - Return [`RegistryError::UnrepresentablePath`] if final segment is not
///   valid UTF-8.
pub fn project_name(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let name = path.file_name().ok_or_else(|| RegistryError::NamelessPath {
        path: path.to_path_buf(),
    })?;

    name.to_str()
        .map(ToString::to_string)
        .ok_or_else(|| RegistryError::UnrepresentablePath {
            path: path.to_path_buf(),
        })
}

/// Flat-file registry of mirrored projects.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    /// Construct new registry handle.
    ///
    /// Does not touch the file system. A missing registry file is treated as
    /// an empty registry.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every well-formed entry in file order.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Read`] if registry file exists but cannot be
    ///   read.
    pub fn entries(&self) -> Result<Vec<RegistryEntry>> {
        let content = match read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(RegistryError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        let mut entries = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<RegistryEntry>() {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(
                    "skip line {} of {:?}: {err}",
                    number + 1,
                    self.path.display()
                ),
            }
        }

        Ok(entries)
    }

    /// Record a project, replacing any older entry with the same name.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Lock`] if registry lock cannot be acquired.
    /// - Return [`RegistryError::Read`] if registry file cannot be read.
    /// - Return [`RegistryError::Write`] if registry file cannot be written.
    #[instrument(skip(self, entry), fields(name = entry.name()), level = "debug")]
    pub fn record(&self, entry: &RegistryEntry) -> Result<()> {
        let _lock = self.lock()?;
        let mut entries = self.entries()?;
        entries.retain(|old| old.name() != entry.name());
        entries.push(entry.clone());
        debug!("record {entry} into {:?}", self.path.display());
        self.write_entries(&entries)
    }

    /// Find the entry for a project.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::NotFound`] if no entry matches, or the
    ///   registry file does not exist.
    /// - Return [`RegistryError::Read`] if registry file cannot be read.
    pub fn lookup(&self, name: impl AsRef<str>) -> Result<RegistryEntry> {
        let name = name.as_ref();
        self.entries()?
            .into_iter()
            .rev()
            .find(|entry| entry.name() == name)
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    /// List names of every known project.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Read`] if registry file cannot be read.
    pub fn list_known_projects(&self) -> Result<KnownProjects> {
        Ok(KnownProjects {
            entries: self.entries()?,
        })
    }

    /// Remove a project from the registry.
    ///
    /// Returns `true` if anything was removed.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Lock`] if registry lock cannot be acquired.
    /// - Return [`RegistryError::Read`] if registry file cannot be read.
    /// - Return [`RegistryError::Write`] if registry file cannot be written.
    pub fn forget(&self, name: impl AsRef<str>) -> Result<bool> {
        let _lock = self.lock()?;
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|entry| entry.name() != name.as_ref());
        if entries.len() == before {
            return Ok(false);
        }

        self.write_entries(&entries)?;
        Ok(true)
    }

    /// Wipe every entry from the registry.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Lock`] if registry lock cannot be acquired.
    /// - Return [`RegistryError::Write`] if registry file cannot be written.
    pub fn clear(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.write_entries(&[])
    }

    /// Hold exclusive advisory lock for one project.
    ///
    /// Lock files live in a `locks` directory next to the registry file. The
    /// lock is released when the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// - Return [`RegistryError::Write`] if lock file cannot be created.
    /// - Return [`RegistryError::Lock`] if lock cannot be acquired.
    pub fn lock_project(&self, name: impl AsRef<str>) -> Result<ProjectLock> {
        let locks = self.dir().join("locks");
        mkdirp::mkdirp(&locks).map_err(|err| RegistryError::Write {
            source: err,
            path: locks.clone(),
        })?;

        Ok(ProjectLock {
            _flock: acquire(locks.join(format!("{}.lock", name.as_ref())))?,
        })
    }

    fn lock(&self) -> Result<Flock<File>> {
        let dir = self.dir();
        mkdirp::mkdirp(&dir).map_err(|err| RegistryError::Write {
            source: err,
            path: dir.clone(),
        })?;

        acquire(self.path.with_extension("lock"))
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        }
    }

    fn write_entries(&self, entries: &[RegistryEntry]) -> Result<()> {
        let write_err = |source: std::io::Error| RegistryError::Write {
            source,
            path: self.path.clone(),
        };

        // INVARIANT: Temporary file must live on the same file system as the
        // registry so that the final rename is atomic.
        let mut tmp = NamedTempFile::new_in(self.dir()).map_err(write_err)?;
        for entry in entries {
            writeln!(tmp, "{entry}").map_err(write_err)?;
        }
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|err| write_err(err.error))?;

        Ok(())
    }
}

/// Exclusive advisory lock on one project.
pub struct ProjectLock {
    _flock: Flock<File>,
}

fn acquire(lock_path: PathBuf) -> Result<Flock<File>> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| RegistryError::Write {
            source: err,
            path: lock_path.clone(),
        })?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| RegistryError::Lock {
        source: errno,
        path: lock_path,
    })
}

/// Snapshot of distinct project names in registry file order.
///
/// Iteration is lazy and can be restarted any number of times.
#[derive(Debug, Clone, Default)]
pub struct KnownProjects {
    entries: Vec<RegistryEntry>,
}

impl KnownProjects {
    /// Iterate over distinct project names.
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .map(RegistryEntry::name)
            .filter(move |name| seen.insert(*name))
    }

    /// Check if registry holds no projects.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a KnownProjects {
    type Item = &'a str;
    type IntoIter = Box<dyn Iterator<Item = &'a str> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Sync registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No entry matches project name.
    #[error("project {name:?} is not in the sync registry")]
    NotFound { name: String },

    /// Registry line cannot be parsed.
    #[error("malformed registry line {line:?}")]
    MalformedLine { line: String },

    /// Project name cannot be derived from path.
    #[error("cannot derive project name from {:?}", path.display())]
    NamelessPath { path: PathBuf },

    /// Path cannot be stored in registry file layout.
    #[error("path {:?} cannot be stored in the sync registry", path.display())]
    UnrepresentablePath { path: PathBuf },

    /// Registry file cannot be read from.
    #[error("failed to read sync registry at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry file cannot be written to.
    #[error("failed to write sync registry at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry lock cannot be acquired.
    #[error("failed to lock sync registry at {:?}", path.display())]
    Lock {
        #[source]
        source: nix::errno::Errno,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = RegistryError> = std::result::Result<T, E>;
