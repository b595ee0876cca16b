// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Bulk workspace operations.
//!
//! Bulk operations apply a single-project mirror to many projects in one
//! pass. Failure of one project is logged and counted, but never stops the
//! remaining projects from being mirrored.
//!
//! Mirroring everything under the persistent root into the workspace is
//! guarded by a capacity check. If the summed size of all candidate projects
//! exceeds free volatile storage, nothing gets copied at all.

use crate::{
    capacity::CapacityProbe,
    registry::{project_name, RegistryEntry},
    workspace::{Result, Workspace, WorkspaceError},
};

use git2::{Repository, RepositoryOpenFlags};
use indicatif::{ProgressBar, ProgressStyle};
use std::{
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Check if directory is a project, i.e., a version controlled tree.
///
/// Does not search parent directories.
pub fn is_project(path: impl AsRef<Path>) -> bool {
    Repository::open_ext(
        path.as_ref(),
        RepositoryOpenFlags::NO_SEARCH,
        &[] as &[&OsStr],
    )
    .is_ok()
}

/// Plan for mirroring every project under persistent root into workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPlan {
    /// Projects to mirror in order.
    pub projects: Vec<PlannedProject>,

    /// Summed size of every project.
    pub required: u64,

    /// Free space of volatile storage.
    pub available: u64,
}

impl BulkPlan {
    /// Check if volatile storage can hold every project.
    pub fn fits(&self) -> bool {
        self.required <= self.available
    }
}

/// One project of a bulk plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedProject {
    /// Name of project.
    pub name: String,

    /// Location of project on persistent storage.
    pub persistent_path: PathBuf,

    /// Location project will have in workspace.
    pub volatile_path: PathBuf,

    /// Estimated size of project on volatile storage.
    pub size: u64,
}

/// Outcome of a bulk operation.
#[derive(Debug, Default)]
pub struct BulkReport {
    /// Projects that were mirrored.
    pub attempted: usize,

    /// Projects that were mirrored without error.
    pub succeeded: usize,

    /// Name and error of each project that failed.
    pub failures: Vec<(String, WorkspaceError)>,
}

impl BulkReport {
    /// Check if every attempted project succeeded.
    pub fn is_complete(&self) -> bool {
        self.succeeded == self.attempted
    }
}

impl<P> Workspace<P>
where
    P: CapacityProbe,
{
    /// Plan mirroring of every project under persistent root.
    ///
    /// Only immediate subdirectories of persistent root that are projects get
    /// planned, in file name order. Symbolic links are skipped. Nothing is
    /// copied.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::VolatileStorageNotMounted`] if volatile
    ///   storage is required but not mounted.
    /// - Return [`WorkspaceError::PersistentRoot`] if persistent root cannot
    ///   be listed.
    /// - Return [`WorkspaceError::Measure`] if a project cannot be measured.
    /// - Return [`WorkspaceError::Capacity`] if free space cannot be measured.
    #[instrument(skip(self), level = "debug")]
    pub fn plan_sync_all(&self) -> Result<BulkPlan> {
        self.ensure_mounted()?;

        let root = &self.settings.persistent_root;
        let root_err = |err: std::io::Error| WorkspaceError::PersistentRoot {
            source: err,
            path: root.clone(),
        };

        let mut candidates = Vec::new();
        for entry in fs::read_dir(root).map_err(root_err)? {
            let entry = entry.map_err(root_err)?;
            let path = entry.path();
            if entry.file_type().map_err(root_err)?.is_symlink() {
                debug!("skip symbolic link {:?}", path.display());
            } else if path.is_dir() && is_project(&path) {
                candidates.push(path);
            } else {
                debug!("skip non-project {:?}", path.display());
            }
        }
        candidates.sort();

        let mut projects = Vec::new();
        for persistent_path in candidates {
            let name = project_name(&persistent_path)?;
            let size = self
                .mirror
                .tree_size(&persistent_path)
                .map_err(|err| WorkspaceError::Measure {
                    source: err,
                    path: persistent_path.clone(),
                })?;
            projects.push(PlannedProject {
                volatile_path: self.settings.volatile_root.join(&name),
                name,
                persistent_path,
                size,
            });
        }

        let required = projects.iter().map(|project| project.size).sum();
        let available = self
            .probe
            .available(&existing_ancestor(&self.settings.volatile_root))?;

        Ok(BulkPlan {
            projects,
            required,
            available,
        })
    }

    /// Mirror every project under persistent root into workspace.
    ///
    /// Fails closed: if volatile storage cannot hold every planned project,
    /// nothing is copied.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::InsufficientCapacity`] if planned projects
    ///   do not fit into volatile storage.
    /// - Return any error of [`Workspace::plan_sync_all`].
    #[instrument(skip(self, bar), level = "debug")]
    pub fn sync_all_to_volatile(&self, bar: ProgressBar) -> Result<BulkReport> {
        let plan = self.plan_sync_all()?;
        if !plan.fits() {
            return Err(WorkspaceError::InsufficientCapacity {
                required: plan.required,
                available: plan.available,
                path: self.settings.volatile_root.clone(),
            });
        }

        info!(
            "mirror {} projects ({} bytes) into {:?}",
            plan.projects.len(),
            plan.required,
            self.settings.volatile_root.display()
        );

        run_bulk(bar, plan.projects, |project| {
            self.mirror_to_volatile(&project.persistent_path)
                .map(|_| ())
                .map_err(|err| (project.name.clone(), err))
        })
    }

    /// Plan copying every known project back to persistent storage.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::Registry`] if registry cannot be read.
    pub fn plan_sync_all_to_persistent(&self) -> Result<Vec<RegistryEntry>> {
        self.known_entries()
    }

    /// Copy every known project back to persistent storage.
    ///
    /// # Errors
    ///
    /// - Return [`WorkspaceError::VolatileStorageNotMounted`] if volatile
    ///   storage is required but not mounted.
    /// - Return [`WorkspaceError::Registry`] if registry cannot be read.
    #[instrument(skip(self, bar), level = "debug")]
    pub fn sync_all_to_persistent(&self, bar: ProgressBar) -> Result<BulkReport> {
        self.ensure_mounted()?;
        let entries = self.plan_sync_all_to_persistent()?;
        info!("mirror {} projects back to disk", entries.len());

        run_bulk(bar, entries, |entry| {
            self.mirror_to_persistent(entry.name())
                .map(|_| ())
                .map_err(|err| (entry.name().to_string(), err))
        })
    }
}

fn run_bulk<T, F>(bar: ProgressBar, items: Vec<T>, mut mirror_one: F) -> Result<BulkReport>
where
    F: FnMut(&T) -> std::result::Result<(), (String, WorkspaceError)>,
{
    let style = ProgressStyle::with_template(
        "{elapsed_precise:.green}  {msg:<30}  [{wide_bar:.yellow/blue}] {pos}/{len}",
    )?
    .progress_chars("-Cco.");
    bar.set_style(style);
    bar.set_length(items.len() as u64);
    bar.enable_steady_tick(Duration::from_millis(100));

    let mut report = BulkReport::default();
    for item in &items {
        report.attempted += 1;
        match mirror_one(item) {
            Ok(()) => report.succeeded += 1,
            Err((name, err)) => {
                bar.suspend(|| warn!("{name}: {err}"));
                report.failures.push((name, err));
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    info!(
        "{} of {} projects mirrored",
        report.succeeded, report.attempted
    );

    Ok(report)
}

/// Closest existing ancestor of path, or path itself if it exists.
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|ancestor| ancestor.exists())
        .unwrap_or(path)
        .to_path_buf()
}
