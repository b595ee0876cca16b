// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT


use anyhow::Result;
use git2::{Repository, RepositoryInitOptions};
use ramsync::{
    capacity::FixedProbe, config::WorkspaceSettings, registry::Registry, workspace::Workspace,
};
use std::{
    collections::BTreeMap,
    fs::{create_dir_all, read, write},
    path::{Path, PathBuf},
};
use tempfile::TempDir;

/// Persistent root, volatile root, and registry inside one temporary directory.
pub(crate) struct WorkspaceFixture {
    dir: TempDir,
}

impl WorkspaceFixture {
    pub(crate) fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        create_dir_all(dir.path().join("git"))?;
        create_dir_all(dir.path().join("ram"))?;

        Ok(Self { dir })
    }

    pub(crate) fn persistent_root(&self) -> PathBuf {
        self.dir.path().join("git")
    }

    pub(crate) fn volatile_root(&self) -> PathBuf {
        self.dir.path().join("ram")
    }

    pub(crate) fn workspace(&self, available: u64) -> Result<Workspace<FixedProbe>> {
        let settings = WorkspaceSettings {
            persistent_root: self.persistent_root(),
            volatile_root: self.volatile_root(),
            registry: None,
            require_mount: false,
            exclude: Vec::new(),
        };
        let registry = Registry::new(self.dir.path().join("state").join("registry"));

        Ok(Workspace::new(settings, registry, FixedProbe(available))?)
    }

    pub(crate) fn project(&self, name: &str) -> Result<ProjectFixture> {
        ProjectFixture::new(self.persistent_root().join(name))
    }
}

/// Version controlled project on persistent storage.
pub(crate) struct ProjectFixture {
    path: PathBuf,
}

impl ProjectFixture {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&path, &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn write(&self, file: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        let target = self.path.join(file);
        if let Some(parent) = target.parent() {
            create_dir_all(parent)?;
        }
        write(target, contents)?;

        Ok(())
    }
}

/// Snapshot every regular file of a tree as relative path to content.
pub(crate) fn snapshot(root: impl AsRef<Path>) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.as_ref().to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let relative = entry.path().strip_prefix(root.as_ref())?.to_path_buf();
                files.insert(relative, read(entry.path())?);
            }
        }
    }

    Ok(files)
}
