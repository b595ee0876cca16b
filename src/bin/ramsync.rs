// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ramsync::{
    config::WorkspaceConfig,
    path::default_config_file,
    workspace::{bulk::BulkReport, Workspace},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::ProgressBar;
use inquire::Confirm;
use std::{fs::read_to_string, io::ErrorKind, path::PathBuf, process::exit};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "ramsync [options] <ramsync-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Directory whose projects are mirrored in bulk.
    #[arg(long, global = true, value_name = "path")]
    pub persistent_root: Option<PathBuf>,

    /// Mount point of volatile storage.
    #[arg(long, global = true, value_name = "path")]
    pub volatile_root: Option<PathBuf>,

    /// Path to sync registry file.
    #[arg(long, global = true, value_name = "path")]
    pub registry: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let workspace = self.workspace()?;
        match self.command {
            Command::MirrorToVolatile(opts) => run_mirror_to_volatile(&workspace, opts),
            Command::MirrorToDisk(opts) => run_mirror_to_disk(&workspace, opts),
            Command::SyncAllToVolatile(opts) => run_sync_all_to_volatile(&workspace, opts),
            Command::SyncAllToDisk(opts) => run_sync_all_to_disk(&workspace, opts),
            Command::List => run_list(&workspace),
            Command::Forget(opts) => run_forget(&workspace, opts),
        }
    }

    fn workspace(&self) -> Result<Workspace> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => default_config_file()?,
        };

        let mut config = match read_to_string(&path) {
            Ok(data) => data
                .parse::<WorkspaceConfig>()
                .with_context(|| format!("invalid configuration file {:?}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound && self.config.is_none() => {
                WorkspaceConfig::try_default()?
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot read configuration file {:?}", path.display()))
            }
        };

        let settings = &mut config.workspace;
        if let Some(path) = &self.persistent_root {
            settings.persistent_root = path.clone();
        }
        if let Some(path) = &self.volatile_root {
            settings.volatile_root = path.clone();
        }
        if let Some(path) = &self.registry {
            settings.registry = Some(path.clone());
        }

        Ok(Workspace::try_from_settings(config.workspace)?)
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Mirror a project from persistent storage into the RAM workspace.
    #[command(override_usage = "ramsync mirror-to-volatile [options] <persistent_path>")]
    MirrorToVolatile(MirrorToVolatileOptions),

    /// Mirror a project from the RAM workspace back to persistent storage.
    #[command(override_usage = "ramsync mirror-to-disk [options] <project_name>")]
    MirrorToDisk(MirrorToDiskOptions),

    /// Mirror every project under the persistent root into the RAM workspace.
    #[command(override_usage = "ramsync sync-all-to-volatile [options]")]
    SyncAllToVolatile(SyncAllToVolatileOptions),

    /// Mirror every known project back to persistent storage.
    #[command(override_usage = "ramsync sync-all-to-disk [options]")]
    SyncAllToDisk(SyncAllToDiskOptions),

    /// List known projects and their state.
    #[command(override_usage = "ramsync list [options]")]
    List,

    /// Drop a project from the sync registry.
    #[command(override_usage = "ramsync forget [options] <project_name>")]
    Forget(ForgetOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MirrorToVolatileOptions {
    /// Path to project on persistent storage.
    #[arg(required = true, value_name = "persistent_path")]
    pub persistent_path: PathBuf,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MirrorToDiskOptions {
    /// Name of project to mirror back.
    #[arg(required = true, value_name = "project_name")]
    pub project_name: String,

    /// Overwrite persistent tree without asking.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncAllToVolatileOptions {
    /// Check capacity and show plan without copying anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncAllToDiskOptions {
    /// Show plan without copying anything.
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Overwrite persistent trees without asking.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ForgetOptions {
    /// Name of project to drop from sync registry.
    #[arg(required = true, value_name = "project_name")]
    pub project_name: String,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

fn run_mirror_to_volatile(workspace: &Workspace, opts: MirrorToVolatileOptions) -> Result<()> {
    workspace.mirror_to_volatile(opts.persistent_path)?;
    Ok(())
}

fn run_mirror_to_disk(workspace: &Workspace, opts: MirrorToDiskOptions) -> Result<()> {
    let entry = workspace.lookup(&opts.project_name)?;
    let prompt = format!(
        "overwrite {:?} with {:?}?",
        entry.persistent_path().display(),
        entry.volatile_path().display()
    );
    if !opts.yes && !confirm(&prompt)? {
        warn!("mirror of {:?} to disk cancelled", entry.name());
        return Ok(());
    }

    workspace.mirror_to_persistent(entry.name())?;
    Ok(())
}

fn run_sync_all_to_volatile(workspace: &Workspace, opts: SyncAllToVolatileOptions) -> Result<()> {
    if opts.dry_run {
        let plan = workspace.plan_sync_all()?;
        for project in &plan.projects {
            info!(
                "{:<30} {:>12} bytes  {:?} -> {:?}",
                project.name,
                project.size,
                project.persistent_path.display(),
                project.volatile_path.display()
            );
        }
        info!(
            "{} projects need {} bytes, {} bytes free",
            plan.projects.len(),
            plan.required,
            plan.available
        );
        if !plan.fits() {
            bail!("insufficient capacity in {:?}", workspace.settings().volatile_root.display());
        }

        return Ok(());
    }

    let report = workspace.sync_all_to_volatile(ProgressBar::new(0))?;
    finish_bulk(report)
}

fn run_sync_all_to_disk(workspace: &Workspace, opts: SyncAllToDiskOptions) -> Result<()> {
    let entries = workspace.plan_sync_all_to_persistent()?;
    for entry in &entries {
        info!(
            "{:<30} {:?} -> {:?}",
            entry.name(),
            entry.volatile_path().display(),
            entry.persistent_path().display()
        );
    }

    if opts.dry_run {
        return Ok(());
    }

    let prompt = format!("overwrite {} persistent trees?", entries.len());
    if !opts.yes && !confirm(&prompt)? {
        warn!("mirror to disk cancelled");
        return Ok(());
    }

    let report = workspace.sync_all_to_persistent(ProgressBar::new(0))?;
    finish_bulk(report)
}

fn run_list(workspace: &Workspace) -> Result<()> {
    for status in workspace.status()? {
        let state = if status.volatile_present {
            "mirrored"
        } else {
            "missing"
        };
        println!(
            "{:<30} {:<9} {:<20} {} -> {}",
            status.entry.name(),
            state,
            status.branch.as_deref().unwrap_or("-"),
            status.entry.persistent_path().display(),
            status.entry.volatile_path().display()
        );
    }

    Ok(())
}

fn run_forget(workspace: &Workspace, opts: ForgetOptions) -> Result<()> {
    workspace.forget(&opts.project_name)?;
    info!("forgot {:?}", opts.project_name);
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    Ok(Confirm::new(prompt).with_default(false).prompt()?)
}

fn finish_bulk(report: BulkReport) -> Result<()> {
    if !report.is_complete() {
        for (name, error) in &report.failures {
            error!("{name}: {error}");
        }
        bail!(
            "{} of {} projects failed",
            report.attempted - report.succeeded,
            report.attempted
        );
    }

    Ok(())
}
