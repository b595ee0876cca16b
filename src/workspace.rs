// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! RAM workspace management.
//!
//! A __RAM workspace__ is a memory-backed file system, usually tmpfs, that
//! holds copies of projects kept on persistent storage. Builds run much faster
//! against the volatile copy, and edits made there are copied back to disk on
//! demand.
//!
//! # Projects
//!
//! A __project__ is a directory under version control. Its name is the final
//! segment of its persistent path. Each project lands at
//! `<volatile_root>/<name>` when mirrored into the workspace.
//!
//! # Mirroring
//!
//! Projects move between persistent and volatile storage through mirror
//! copies. Both directions delete whatever the destination has that the
//! source lacks. There is no conflict detection. Copying a project back to
//! disk silently destroys any change made to its persistent tree after it was
//! mirrored into the workspace.
//!
//! # Volatile Storage
//!
//! The volatile root is expected to be mounted by the system before ramsync
//! runs. Unless told otherwise, every operation refuses to run when the
//! volatile root is not a mount point, so nothing is ever written into the
//! directory that a missing mount leaves behind.
//!
//! # See Also
//!
//! 1. [`mirror`](crate::mirror)
//! 2. [`registry`](crate::registry)

pub mod bulk;

use crate::{
    capacity::{is_mount_point, CapacityError, CapacityProbe, StatvfsProbe},
    config::WorkspaceSettings,
    mirror::{Mirror, MirrorError, MirrorStats},
    path::{default_registry_file, NoWayHome},
    registry::{project_name, Registry, RegistryEntry, RegistryError},
};

use git2::Repository;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

/// RAM workspace context.
///
/// Carries everything an operation needs: settings, the sync registry, and a
/// way to measure free volatile storage.
#[derive(Debug)]
pub struct Workspace<P = StatvfsProbe>
where
    P: CapacityProbe,
{
    settings: WorkspaceSettings,
    registry: Registry,
    mirror: Mirror,
    probe: P,
}

impl Workspace<StatvfsProbe> {
    /// Construct workspace from settings alone.
    ///
    /// Uses registry path from settings, or the default registry path.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::NoWayHome`] if default registry path cannot
    ///   be determined.
    /// - Return [`WorkspaceError::AbsolutePath`] if a configured path cannot
    ///   be made absolute.
    pub fn try_from_settings(settings: WorkspaceSettings) -> Result<Self> {
        let registry = match &settings.registry {
            Some(path) => Registry::new(path),
            None => Registry::new(default_registry_file()?),
        };

        Self::new(settings, registry, StatvfsProbe)
    }
}

impl<P> Workspace<P>
where
    P: CapacityProbe,
{
    /// Construct new workspace.
    ///
    /// Relative roots and registry paths are resolved against the current
    /// working directory once, here. Every path recorded in the sync registry
    /// is therefore absolute.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::AbsolutePath`] if a path cannot be made
    ///   absolute.
    pub fn new(mut settings: WorkspaceSettings, registry: Registry, probe: P) -> Result<Self> {
        settings.persistent_root = absolute(&settings.persistent_root)?;
        settings.volatile_root = absolute(&settings.volatile_root)?;
        settings.registry = settings.registry.as_deref().map(absolute).transpose()?;
        let registry = Registry::new(absolute(registry.path())?);

        let mirror = Mirror::new().exclude(settings.exclude.iter().cloned());
        Ok(Self {
            settings,
            registry,
            mirror,
            probe,
        })
    }

    /// Workspace settings.
    pub fn settings(&self) -> &WorkspaceSettings {
        &self.settings
    }

    /// Sync registry of workspace.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Check that volatile storage is mounted.
    ///
    /// Always succeeds when settings do not require a mount.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::VolatileStorageNotMounted`] if volatile root
    ///   is missing or not a mount point.
    pub fn ensure_mounted(&self) -> Result<()> {
        let root = &self.settings.volatile_root;
        if self.settings.require_mount && !is_mount_point(root) {
            return Err(WorkspaceError::VolatileStorageNotMounted { path: root.clone() });
        }

        Ok(())
    }

    /// Copy one project from persistent storage into the workspace.
    ///
    /// Mirrors `persistent_path` into `<volatile_root>/<name>`, then records
    /// the project in the sync registry. The registry is only touched after the
    /// copy succeeds.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::VolatileStorageNotMounted`] if volatile
    ///   storage is required but not mounted.
    /// - Return [`WorkspaceError::SourceNotFound`] if path does not exist.
    /// - Return [`WorkspaceError::SourceNotDirectory`] if path is not a
    ///   directory.
    /// - Return [`WorkspaceError::InvalidProjectName`] if no project name can
    ///   be derived from path.
    /// - Return [`WorkspaceError::OverlappingTrees`] if path and its volatile
    ///   copy would nest.
    /// - Return [`WorkspaceError::CopyFailed`] if mirror copy fails.
    /// - Return [`WorkspaceError::Registry`] if registry cannot be updated.
    #[instrument(skip(self, persistent_path), level = "debug")]
    pub fn mirror_to_volatile(&self, persistent_path: impl AsRef<Path>) -> Result<SyncOutcome> {
        self.ensure_mounted()?;

        let given = persistent_path.as_ref();
        let persistent = fs::canonicalize(given).map_err(|err| WorkspaceError::SourceNotFound {
            source: err,
            path: given.to_path_buf(),
        })?;
        if !persistent.is_dir() {
            return Err(WorkspaceError::SourceNotDirectory { path: persistent });
        }

        let name = project_name(&persistent).map_err(|_| WorkspaceError::InvalidProjectName {
            path: persistent.clone(),
        })?;
        let volatile = self.settings.volatile_root.join(&name);
        let resolved_volatile = self.resolved_volatile_root().join(&name);
        if persistent.starts_with(&resolved_volatile) || resolved_volatile.starts_with(&persistent)
        {
            return Err(WorkspaceError::OverlappingTrees {
                persistent,
                volatile,
            });
        }

        let entry = RegistryEntry::new(persistent, volatile)?;
        let _lock = self.registry.lock_project(entry.name())?;
        info!(
            "mirror {:?} into {:?}",
            entry.persistent_path().display(),
            entry.volatile_path().display()
        );
        let stats = self
            .mirror
            .run(entry.persistent_path(), entry.volatile_path())
            .map_err(|err| WorkspaceError::CopyFailed {
                source: err,
                from: entry.persistent_path().to_path_buf(),
                to: entry.volatile_path().to_path_buf(),
            })?;
        info!("{}: {stats}", entry.name());

        self.registry.record(&entry)?;

        Ok(SyncOutcome { entry, stats })
    }

    /// Copy one project from the workspace back to persistent storage.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::VolatileStorageNotMounted`] if volatile
    ///   storage is required but not mounted.
    /// - Return [`WorkspaceError::UnknownProject`] if project is not in the
    ///   sync registry.
    /// - Return [`WorkspaceError::VolatilePathMissing`] if the volatile copy
    ///   of project no longer exists.
    /// - Return [`WorkspaceError::CopyFailed`] if mirror copy fails.
    #[instrument(skip(self, name), level = "debug")]
    pub fn mirror_to_persistent(&self, name: impl AsRef<str>) -> Result<SyncOutcome> {
        self.ensure_mounted()?;

        let entry = self.lookup(name.as_ref())?;
        let _lock = self.registry.lock_project(entry.name())?;
        if !entry.volatile_path().is_dir() {
            return Err(WorkspaceError::VolatilePathMissing {
                name: entry.name().to_string(),
                path: entry.volatile_path().to_path_buf(),
            });
        }

        info!(
            "mirror {:?} back to {:?}",
            entry.volatile_path().display(),
            entry.persistent_path().display()
        );
        let stats = self
            .mirror
            .run(entry.volatile_path(), entry.persistent_path())
            .map_err(|err| WorkspaceError::CopyFailed {
                source: err,
                from: entry.volatile_path().to_path_buf(),
                to: entry.persistent_path().to_path_buf(),
            })?;
        info!("{}: {stats}", entry.name());

        Ok(SyncOutcome { entry, stats })
    }

    /// Find registry entry of a project.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::UnknownProject`] if project is not in the
    ///   sync registry.
    pub fn lookup(&self, name: &str) -> Result<RegistryEntry> {
        self.registry.lookup(name).map_err(|err| match err {
            RegistryError::NotFound { name } => WorkspaceError::UnknownProject { name },
            err => WorkspaceError::Registry(err),
        })
    }

    /// Report state of every known project.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Registry`] if registry cannot be read.
    pub fn status(&self) -> Result<Vec<ProjectStatus>> {
        Ok(self
            .known_entries()?
            .into_iter()
            .map(|entry| {
                let volatile_present = entry.volatile_path().is_dir();
                let branch = volatile_present
                    .then(|| current_branch(entry.volatile_path()))
                    .flatten();
                ProjectStatus {
                    entry,
                    volatile_present,
                    branch,
                }
            })
            .collect())
    }

    /// Drop a project from the sync registry.
    ///
    /// Leaves both trees alone.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::UnknownProject`] if project is not in the
    ///   sync registry.
    pub fn forget(&self, name: impl AsRef<str>) -> Result<()> {
        if !self.registry.forget(name.as_ref())? {
            return Err(WorkspaceError::UnknownProject {
                name: name.as_ref().to_string(),
            });
        }

        debug!("forget {:?}", name.as_ref());
        Ok(())
    }

    /// Every registry entry, one per project name, latest wins.
    fn known_entries(&self) -> Result<Vec<RegistryEntry>> {
        let mut seen = HashSet::new();
        let mut entries = self
            .registry
            .entries()?
            .into_iter()
            .rev()
            .filter(|entry| seen.insert(entry.name().to_string()))
            .collect::<Vec<_>>();
        entries.reverse();

        Ok(entries)
    }

    fn resolved_volatile_root(&self) -> PathBuf {
        let root = &self.settings.volatile_root;
        fs::canonicalize(root).unwrap_or_else(|_| root.clone())
    }
}

/// Result of mirroring one project.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// Registry entry of mirrored project.
    pub entry: RegistryEntry,

    /// What the mirror copy did.
    pub stats: MirrorStats,
}

/// State of a known project.
#[derive(Debug, Clone)]
pub struct ProjectStatus {
    /// Registry entry of project.
    pub entry: RegistryEntry,

    /// Whether the volatile copy still exists.
    pub volatile_present: bool,

    /// Branch checked out in the volatile copy, if any.
    pub branch: Option<String>,
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|err| WorkspaceError::AbsolutePath {
        source: err,
        path: path.to_path_buf(),
    })
}

fn current_branch(path: &Path) -> Option<String> {
    let repository = Repository::open(path).ok()?;
    let head = repository.head().ok()?;
    head.shorthand().map(ToString::to_string)
}

/// All possible error types for workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Source tree does not exist.
    #[error("source {:?} does not exist", path.display())]
    SourceNotFound {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Source is not a directory.
    #[error("source {:?} is not a directory", path.display())]
    SourceNotDirectory { path: PathBuf },

    /// Project name cannot be derived from path.
    #[error("cannot derive project name from {:?}", path.display())]
    InvalidProjectName { path: PathBuf },

    /// Persistent tree and volatile tree would nest inside each other.
    #[error("{:?} and {:?} overlap", persistent.display(), volatile.display())]
    OverlappingTrees {
        persistent: PathBuf,
        volatile: PathBuf,
    },

    /// Mirror copy did not complete.
    #[error("failed to mirror {:?} to {:?}", from.display(), to.display())]
    CopyFailed {
        #[source]
        source: MirrorError,
        from: PathBuf,
        to: PathBuf,
    },

    /// Project is not in the sync registry.
    #[error("unknown project {name:?}")]
    UnknownProject { name: String },

    /// Recorded volatile tree no longer exists.
    #[error("volatile copy of {name:?} at {:?} is gone", path.display())]
    VolatilePathMissing { name: String, path: PathBuf },

    /// Volatile storage cannot hold every project.
    #[error(
        "projects need {required} bytes, but only {available} bytes are free at {:?}",
        path.display()
    )]
    InsufficientCapacity {
        required: u64,
        available: u64,
        path: PathBuf,
    },

    /// Volatile storage is not mounted.
    #[error("volatile storage {:?} is not mounted", path.display())]
    VolatileStorageNotMounted { path: PathBuf },

    /// Persistent root cannot be listed.
    #[error("failed to list persistent root {:?}", path.display())]
    PersistentRoot {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Project tree cannot be measured.
    #[error("failed to measure {:?}", path.display())]
    Measure {
        #[source]
        source: MirrorError,
        path: PathBuf,
    },

    /// Configured path cannot be made absolute.
    #[error("failed to make {:?} absolute", path.display())]
    AbsolutePath {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Default path cannot be determined.
    #[error(transparent)]
    NoWayHome(#[from] NoWayHome),

    /// Sync registry manipulation fails.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Free space cannot be measured.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),
}

/// Friendly result alias :3
pub type Result<T, E = WorkspaceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::FixedProbe;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::fs::{create_dir_all, write};
    use tempfile::TempDir;

    fn workspace(dir: &Path) -> Workspace<FixedProbe> {
        workspace_with_roots(dir.join("git"), dir.join("ram"), dir.join("registry"))
    }

    fn workspace_with_roots(
        persistent_root: PathBuf,
        volatile_root: PathBuf,
        registry: PathBuf,
    ) -> Workspace<FixedProbe> {
        let settings = WorkspaceSettings {
            persistent_root,
            volatile_root,
            registry: None,
            require_mount: false,
            exclude: Vec::new(),
        };
        Workspace::new(settings, Registry::new(registry), FixedProbe(u64::MAX)).unwrap()
    }

    /// Nest directories under `src` whose paths stay well within PATH_MAX,
    /// but exceed it once rebased onto the longer `dst`.
    ///
    /// Copying `src` to `dst` then fails even for the superuser.
    pub(crate) fn nest_past_path_max(src: &Path, dst: &Path) -> anyhow::Result<()> {
        const PATH_MAX: usize = 4096;
        let segment = "d".repeat(100);
        let step = segment.len() + 1;
        let (src_len, dst_len) = (src.as_os_str().len(), dst.as_os_str().len());
        assert!(dst_len >= src_len + 2 * step);

        let mut depth = 0;
        while dst_len + depth * step < PATH_MAX + 50 {
            depth += 1;
        }
        assert!(src_len + depth * step < PATH_MAX - 50);

        let mut path = src.to_path_buf();
        for _ in 0..depth {
            path.push(&segment);
        }
        create_dir_all(&path)?;
        write(path.join("deep.txt"), "deep")?;

        Ok(())
    }

    #[test]
    fn mirror_to_volatile_records_after_copy() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        let project = dir.path().join("git/alpha");
        create_dir_all(&project)?;
        write(project.join("lib.rs"), "pub fn alpha() {}\n")?;

        let outcome = workspace.mirror_to_volatile(&project)?;
        assert_eq!(outcome.entry.name(), "alpha");
        assert_eq!(outcome.stats.files_copied, 1);
        assert!(dir.path().join("ram/alpha/lib.rs").exists());

        let entry = workspace.registry().lookup("alpha")?;
        assert_eq!(entry.volatile_path(), dir.path().join("ram/alpha"));

        Ok(())
    }

    #[test]
    fn mirror_to_volatile_rejects_missing_source() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());

        let result = workspace.mirror_to_volatile(dir.path().join("git/missing"));
        assert!(matches!(result, Err(WorkspaceError::SourceNotFound { .. })));
        assert!(workspace.registry().entries()?.is_empty());

        Ok(())
    }

    #[test]
    fn mirror_to_volatile_rejects_plain_file() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        write(dir.path().join("notes.txt"), "hi")?;

        let result = workspace.mirror_to_volatile(dir.path().join("notes.txt"));
        assert!(matches!(result, Err(WorkspaceError::SourceNotDirectory { .. })));

        Ok(())
    }

    #[test]
    fn mirror_to_volatile_rejects_volatile_copy_as_source() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        create_dir_all(dir.path().join("ram/alpha"))?;

        let result = workspace.mirror_to_volatile(dir.path().join("ram/alpha"));
        assert!(matches!(result, Err(WorkspaceError::OverlappingTrees { .. })));

        Ok(())
    }

    #[test]
    fn unmounted_volatile_storage_is_refused() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let settings = WorkspaceSettings {
            require_mount: true,
            ..workspace(dir.path()).settings().clone()
        };
        let registry = Registry::new(dir.path().join("registry"));
        let workspace = Workspace::new(settings, registry, FixedProbe(0))?;
        create_dir_all(dir.path().join("git/alpha"))?;

        let result = workspace.mirror_to_volatile(dir.path().join("git/alpha"));
        assert!(matches!(
            result,
            Err(WorkspaceError::VolatileStorageNotMounted { .. })
        ));
        assert!(!dir.path().join("ram").exists());

        Ok(())
    }

    #[test]
    fn mirror_to_volatile_rejects_non_utf8_name() -> anyhow::Result<()> {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        let project = dir.path().join("git").join(OsStr::from_bytes(b"caf\xE9"));
        create_dir_all(&project)?;
        write(project.join("menu.txt"), "espresso\n")?;

        let result = workspace.mirror_to_volatile(&project);
        assert!(matches!(
            result,
            Err(WorkspaceError::InvalidProjectName { .. })
        ));
        assert!(!dir.path().join("ram").exists());
        assert!(workspace.registry().entries()?.is_empty());

        Ok(())
    }

    #[test]
    fn mirror_to_volatile_records_nothing_when_copy_fails() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let volatile_root = dir.path().join("r".repeat(250));
        let workspace = workspace_with_roots(
            dir.path().join("git"),
            volatile_root.clone(),
            dir.path().join("registry"),
        );
        let project = dir.path().join("git/alpha");
        nest_past_path_max(&project, &volatile_root.join("alpha"))?;

        let result = workspace.mirror_to_volatile(&project);
        assert!(matches!(result, Err(WorkspaceError::CopyFailed { .. })));
        assert!(workspace.registry().entries()?.is_empty());
        assert!(matches!(
            workspace.lookup("alpha"),
            Err(WorkspaceError::UnknownProject { .. })
        ));

        Ok(())
    }

    #[sealed_test]
    fn relative_roots_are_recorded_absolute() -> anyhow::Result<()> {
        create_dir_all("git/alpha")?;
        write("git/alpha/lib.rs", "pub fn alpha() {}\n")?;
        let workspace = workspace_with_roots(
            PathBuf::from("git"),
            PathBuf::from("ram"),
            PathBuf::from("state/registry"),
        );
        let cwd = std::env::current_dir()?;

        assert_eq!(workspace.settings().volatile_root, cwd.join("ram"));
        assert_eq!(workspace.settings().persistent_root, cwd.join("git"));
        assert_eq!(workspace.registry().path(), cwd.join("state/registry"));

        workspace.mirror_to_volatile("git/alpha")?;
        let entry = workspace.lookup("alpha")?;
        assert!(entry.volatile_path().is_absolute());
        assert!(entry.persistent_path().is_absolute());
        assert_eq!(entry.volatile_path(), cwd.join("ram/alpha"));

        Ok(())
    }

    #[test]
    fn mirror_to_persistent_needs_volatile_copy() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        let project = dir.path().join("git/alpha");
        create_dir_all(&project)?;
        workspace.mirror_to_volatile(&project)?;
        fs::remove_dir_all(dir.path().join("ram/alpha"))?;

        let result = workspace.mirror_to_persistent("alpha");
        assert!(matches!(
            result,
            Err(WorkspaceError::VolatilePathMissing { .. })
        ));
        assert!(project.exists());

        Ok(())
    }

    #[test]
    fn mirror_to_persistent_checks_volatile_copy_under_lock() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        let project = dir.path().join("git/alpha");
        create_dir_all(&project)?;
        write(project.join("lib.rs"), "pub fn alpha() {}\n")?;
        workspace.mirror_to_volatile(&project)?;

        let lock = workspace.registry().lock_project("alpha")?;
        let result = std::thread::scope(|scope| -> anyhow::Result<_> {
            let handle = scope.spawn(|| workspace.mirror_to_persistent("alpha"));
            std::thread::sleep(std::time::Duration::from_millis(200));
            fs::remove_dir_all(dir.path().join("ram/alpha"))?;
            drop(lock);
            Ok(handle.join().unwrap())
        })?;

        assert!(matches!(
            result,
            Err(WorkspaceError::VolatilePathMissing { .. })
        ));
        assert!(project.join("lib.rs").exists());

        Ok(())
    }

    #[test]
    fn status_and_forget() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let workspace = workspace(dir.path());
        for name in ["alpha", "beta"] {
            create_dir_all(dir.path().join("git").join(name))?;
            workspace.mirror_to_volatile(dir.path().join("git").join(name))?;
        }
        fs::remove_dir_all(dir.path().join("ram/beta"))?;

        let status = workspace.status()?;
        let result = status
            .iter()
            .map(|status| (status.entry.name(), status.volatile_present))
            .collect::<Vec<_>>();
        assert_eq!(result, vec![("alpha", true), ("beta", false)]);

        workspace.forget("beta")?;
        assert!(matches!(
            workspace.forget("beta"),
            Err(WorkspaceError::UnknownProject { .. })
        ));
        assert_eq!(workspace.status()?.len(), 1);

        Ok(())
    }
}
