//! Ephemeral working directories.
//!
//! Each build or verification stages its inputs into a fresh `cupy-dist-*`
//! directory that is removed when the step ends, whether it succeeded or not.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tempfile::TempDir;
use toml_edit::{DocumentMut, Item, Value};
use tracing::{info, warn};
use walkdir::WalkDir;

const WORKDIR_PREFIX: &str = "cupy-dist-";

/// What happens when the working directory cannot be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupPolicy {
    /// Removal failure is an error.
    Strict,
    /// Removal failure is logged. Windows keeps `.git` objects read-only,
    /// which makes recursive removal fail there.
    WarnOnFailure,
}

pub struct Workdir {
    dir: TempDir,
    policy: CleanupPolicy,
}

impl Workdir {
    pub fn create(policy: CleanupPolicy) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir()
            .context("creating working directory")?;
        info!("Using working directory: {}", dir.path().display());
        Ok(Self { dir, policy })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// Remove the directory, applying the cleanup policy.
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        info!("Removing working directory: {}", path.display());
        match (self.dir.close(), self.policy) {
            (Ok(()), _) => Ok(()),
            (Err(err), CleanupPolicy::WarnOnFailure) => {
                warn!(
                    "Failed to clean-up working directory: {err}\n\n\
                     Please remove the working directory manually: {}",
                    path.display()
                );
                Ok(())
            }
            (Err(err), CleanupPolicy::Strict) => Err(err)
                .with_context(|| format!("removing working directory '{}'", path.display())),
        }
    }
}

/// Run `f` inside a fresh working directory and remove it afterwards.
///
/// If `f` fails, its error is returned and a cleanup failure is only logged.
pub fn with_workdir<T>(policy: CleanupPolicy, f: impl FnOnce(&Workdir) -> Result<T>) -> Result<T> {
    let workdir = Workdir::create(policy)?;
    let result = f(&workdir);
    let cleanup = workdir.close();
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => {
            warn!("{cleanup_err:#}");
            Err(err)
        }
    }
}

/// Deep-copy `src` to `dst` (which must not exist), preserving symlinks.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("directory not found: {}", src.display());
    }
    if dst.exists() {
        bail!("copy destination already exists: {}", dst.display());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("reading symlink '{}'", entry.path().display()))?;
            create_symlink(&link, &target, entry.path())?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating directory '{}'", target.display()))?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' -> '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, target: &Path, _source: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target)
        .with_context(|| format!("creating symlink '{}'", target.display()))
}

#[cfg(windows)]
fn create_symlink(link: &Path, target: &Path, source: &Path) -> Result<()> {
    let result = if source.is_dir() {
        std::os::windows::fs::symlink_dir(link, target)
    } else {
        std::os::windows::fs::symlink_file(link, target)
    };
    result.with_context(|| format!("creating symlink '{}'", target.display()))
}

/// Merge `src` into `dst`: missing directories are created and files
/// overwritten.
pub fn merge_directory(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativizing '{}'", entry.path().display()))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            if !target.exists() {
                info!("Creating directory: {}", target.display());
                fs::create_dir_all(&target)
                    .with_context(|| format!("creating directory '{}'", target.display()))?;
            }
        } else {
            info!("Copying: {} <- {}", target.display(), entry.path().display());
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' -> '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }
    Ok(())
}

pub fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory '{}'", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing '{}'", path.display()))
}

/// Set the distribution name in `<project_dir>/pyproject.toml`.
///
/// Only the `name` value of the `[project]` table is replaced. Layout,
/// comments and key quoting elsewhere in the file survive the edit.
pub fn rewrite_package_name(project_dir: &Path, package_name: &str) -> Result<()> {
    let path = project_dir.join("pyproject.toml");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading project metadata '{}'", path.display()))?;
    let mut doc = content
        .parse::<DocumentMut>()
        .with_context(|| format!("parsing project metadata '{}'", path.display()))?;

    let Some(name) = doc
        .get_mut("project")
        .and_then(|project| project.get_mut("name"))
        .and_then(Item::as_value_mut)
    else {
        bail!(
            "no [project] name field in '{}'; cannot rename package to '{}'",
            path.display(),
            package_name
        );
    };
    let decor = name.decor().clone();
    *name = Value::from(package_name);
    *name.decor_mut() = decor;

    info!("Renamed package to {package_name} in {}", path.display());
    fs::write(&path, doc.to_string())
        .with_context(|| format!("writing project metadata '{}'", path.display()))
}
