// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for the configuration file that ramsync uses to
//! simplify the process of serialization and deserialization. File I/O is
//! left to the caller to figure out.
//!
//! # General Layout
//!
//! The configuration file holds one `[workspace]` table:
//!
//! ```toml
//! [workspace]
//! persistent_root = "$HOME/git"
//! volatile_root = "/mnt/ramdisk"
//! registry = "$HOME/.local/share/ramsync/registry"
//! require_mount = true
//! exclude = ["target/", "node_modules/"]
//! ```
//!
//! Every path field goes through shell expansion when parsed.

use crate::path::{
    default_persistent_root, default_registry_file, NoWayHome, DEFAULT_VOLATILE_ROOT,
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    str::FromStr,
};

/// Top-level configuration file layout.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    /// Workspace settings.
    pub workspace: WorkspaceSettings,
}

impl WorkspaceConfig {
    /// Construct configuration from built-in defaults.
    ///
    /// # Errors
    ///
    /// - Return [`NoWayHome`] if home directory path cannot be determined.
    pub fn try_default() -> Result<Self, NoWayHome> {
        Ok(Self {
            workspace: WorkspaceSettings {
                persistent_root: default_persistent_root()?,
                volatile_root: PathBuf::from(DEFAULT_VOLATILE_ROOT),
                registry: Some(default_registry_file()?),
                require_mount: true,
                exclude: Vec::new(),
            },
        })
    }
}

impl FromStr for WorkspaceConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: WorkspaceConfig =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on every path field.
        let settings = &mut config.workspace;
        settings.persistent_root = expand_path(&settings.persistent_root)?;
        settings.volatile_root = expand_path(&settings.volatile_root)?;
        settings.registry = settings
            .registry
            .as_deref()
            .map(expand_path)
            .transpose()?;

        Ok(config)
    }
}

impl Display for WorkspaceConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Settings of the RAM workspace.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct WorkspaceSettings {
    /// Directory whose immediate subdirectories are candidate projects.
    pub persistent_root: PathBuf,

    /// Mount point of the memory-backed storage area.
    pub volatile_root: PathBuf,

    /// Location of the sync registry file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<PathBuf>,

    /// Refuse to run unless volatile root is a mount point.
    #[serde(default = "default_require_mount")]
    pub require_mount: bool,

    /// Exclusion globs applied to every mirror copy.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_require_mount() -> bool {
    true
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("BLAH", "/home/blah")])]
    fn deserialize_workspace_config() -> anyhow::Result<()> {
        let result: WorkspaceConfig = r#"
            [workspace]
            persistent_root = "$BLAH/git"
            volatile_root = "/mnt/ramdisk"
            registry = "${BLAH}/.ramsync"
            require_mount = false
            exclude = ["target/", "*.o"]
        "#
        .parse()?;

        let expect = WorkspaceConfig {
            workspace: WorkspaceSettings {
                persistent_root: "/home/blah/git".into(),
                volatile_root: "/mnt/ramdisk".into(),
                registry: Some("/home/blah/.ramsync".into()),
                require_mount: false,
                exclude: vec!["target/".into(), "*.o".into()],
            },
        };

        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn deserialize_fills_optional_fields() -> anyhow::Result<()> {
        let result: WorkspaceConfig = r#"
            [workspace]
            persistent_root = "/srv/git"
            volatile_root = "/dev/shm/work"
        "#
        .parse()?;

        assert_eq!(result.workspace.registry, None);
        assert!(result.workspace.require_mount);
        assert!(result.workspace.exclude.is_empty());

        Ok(())
    }

    #[test]
    fn deserialize_rejects_unknown_variable() {
        let result = r#"
            [workspace]
            persistent_root = "$RAMSYNC_UNSET_VARIABLE/git"
            volatile_root = "/mnt/ramdisk"
        "#
        .parse::<WorkspaceConfig>();

        assert!(matches!(result, Err(ConfigError::ShellExpansion(_))));
    }

    #[test]
    fn serialize_workspace_config() {
        let result = WorkspaceConfig {
            workspace: WorkspaceSettings {
                persistent_root: "/home/blah/git".into(),
                volatile_root: "/mnt/ramdisk".into(),
                registry: None,
                require_mount: true,
                exclude: vec!["target/".into(), "node_modules/".into(), "*.o".into()],
            },
        }
        .to_string();

        let expect = indoc! {r#"
            [workspace]
            persistent_root = "/home/blah/git"
            volatile_root = "/mnt/ramdisk"
            require_mount = true
            exclude = [
                "target/",
                "node_modules/",
                "*.o",
            ]
        "#};

        assert_eq!(result, expect);
    }
}
