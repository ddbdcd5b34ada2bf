//! Optional ("preload") library staging.
//!
//! Preload libraries (cuTENSOR, NCCL, ...) are not linked into the wheel.
//! The build installs them next to the toolkit so the extension modules can
//! be compiled against them, and records the exact versions in the wheel
//! metadata so the installed package can fetch matching binaries later.
//!
//! Library discovery and download are delegated to the library installer
//! shipped with the source tree (`cupyx/tools/install_library.py`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tracing::info;

use crate::config::PlatformKind;
use crate::error::DistError;
use crate::process::{CommandLine, CommandRunner};
use crate::workdir::merge_directory;

/// OS key used by the installer's asset records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOs {
    Linux,
    Windows,
}

impl PreloadOs {
    pub fn as_str(self) -> &'static str {
        match self {
            PreloadOs::Linux => "Linux",
            PreloadOs::Windows => "Windows",
        }
    }
}

/// Directory renames applied when merging an installed library into the
/// Windows toolkit tree.
fn windows_install_map(library: &str) -> &'static [(&'static str, &'static str)] {
    match library {
        "cudnn" => &[("bin", "bin"), ("lib", "lib"), ("include", "include")],
        _ => &[("lib", "bin"), ("include", "include")],
    }
}

/// Per-library entry of `_wheel.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreloadInfo {
    pub version: String,
    pub filenames: Vec<String>,
}

/// Contents of `_wheel.json`:
/// `{"cuda": "12.x", "packaging": "pip", "cutensor": {"version": ..., "filenames": [...]}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WheelMetadata {
    pub kind: PlatformKind,
    pub platform_version: String,
    pub libraries: BTreeMap<String, PreloadInfo>,
}

impl WheelMetadata {
    pub const PACKAGING: &'static str = "pip";

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing wheel metadata")
    }
}

impl Serialize for WheelMetadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2 + self.libraries.len()))?;
        map.serialize_entry(self.kind.as_str(), &self.platform_version)?;
        map.serialize_entry("packaging", Self::PACKAGING)?;
        for (library, info) in &self.libraries {
            map.serialize_entry(library, info)?;
        }
        map.end()
    }
}

#[derive(Debug, Deserialize)]
struct LibraryRecord {
    cuda: String,
    assets: BTreeMap<String, LibraryAsset>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LibraryAsset {
    filenames: Vec<String>,
}

/// Front-end for `cupyx/tools/install_library.py`.
#[derive(Debug, Clone)]
pub struct LibraryInstaller {
    python: String,
    script: PathBuf,
}

impl LibraryInstaller {
    /// Installer shipped with the (copied) source tree.
    pub fn from_source_tree(python: impl Into<String>, source_tree: &Path) -> Self {
        Self {
            python: python.into(),
            script: source_tree.join("cupyx").join("tools").join("install_library.py"),
        }
    }

    fn command(&self, library: &str) -> CommandLine {
        CommandLine::new(&self.python)
            .arg(self.script.display().to_string())
            .args(["--library", library])
    }

    fn records(&self, runner: &mut dyn CommandRunner, library: &str) -> Result<Vec<LibraryRecord>> {
        let stdout = runner.output(&self.command(library).args(["--action", "dump"]))?;
        serde_json::from_str(&stdout)
            .with_context(|| format!("parsing {library} records from the library installer"))
    }

    /// Version and asset filenames of `library` for the platform version.
    pub fn lookup(
        &self,
        runner: &mut dyn CommandRunner,
        library: &str,
        platform_version: &str,
        os: PreloadOs,
    ) -> Result<PreloadInfo> {
        let unsupported = || DistError::UnsupportedPreload {
            library: library.to_string(),
            platform: platform_version.to_string(),
            os: os.as_str().to_string(),
        };

        let records = self.records(runner, library)?;
        let record = records
            .into_iter()
            .find(|record| record.cuda == platform_version)
            .ok_or_else(unsupported)?;
        let Some(version) = record.extra.get(library).and_then(|v| v.as_str()) else {
            bail!("{library} record for {platform_version} has no version field");
        };
        let asset = record.assets.get(os.as_str()).ok_or_else(unsupported)?;
        Ok(PreloadInfo {
            version: version.to_string(),
            filenames: asset.filenames.clone(),
        })
    }

    pub fn install(
        &self,
        runner: &mut dyn CommandRunner,
        library: &str,
        platform_version: &str,
        prefix: &Path,
    ) -> Result<()> {
        runner.run(
            &self
                .command(library)
                .args(["--cuda", platform_version])
                .arg("--prefix")
                .arg(prefix.display().to_string()),
        )
    }
}

/// Install every preload library of a profile under `prefix` and collect the
/// wheel metadata.
///
/// A listed library without a release for the platform version is fatal;
/// libraries the profile does not list are never looked up.
pub fn stage_preloads(
    runner: &mut dyn CommandRunner,
    installer: &LibraryInstaller,
    kind: PlatformKind,
    platform_version: &str,
    preloads: &[String],
    os: PreloadOs,
    prefix: &Path,
) -> Result<WheelMetadata> {
    let mut libraries = BTreeMap::new();
    for library in preloads {
        info!("Preparing preload library {library} for {platform_version} ({})", os.as_str());
        let info = installer.lookup(runner, library, platform_version, os)?;
        installer
            .install(runner, library, platform_version, prefix)
            .with_context(|| format!("installing {library} {}", info.version))?;
        libraries.insert(library.clone(), info);
    }
    Ok(WheelMetadata {
        kind,
        platform_version: platform_version.to_string(),
        libraries,
    })
}

/// Copy a library installed under `prefix` (laid out as
/// `<prefix>/<platform>/<library>/<version>/...`) into the Windows toolkit
/// at `destination`. Linux builds compile against the prefix directly.
///
/// Returns `false` when nothing was installed for the library.
pub fn merge_installed_library(
    prefix: &Path,
    library: &str,
    destination: &Path,
) -> Result<bool> {
    let Some(platform_dir) = single_child(prefix)? else {
        info!("Skip installing {library} (no preloading libraries)");
        return Ok(false);
    };
    let library_dir = platform_dir.join(library);
    if !library_dir.exists() {
        info!("Skip installing {library} (unavailable)");
        return Ok(false);
    }
    let Some(version_dir) = single_child(&library_dir)? else {
        bail!("no installed version under '{}'", library_dir.display());
    };

    let install_map = windows_install_map(library);
    for entry in fs::read_dir(&version_dir)
        .with_context(|| format!("reading '{}'", version_dir.display()))?
    {
        let entry = entry.with_context(|| format!("reading '{}'", version_dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let dst_name = install_map
            .iter()
            .find(|(from, _)| *from == name)
            .map(|(_, to)| (*to).to_string())
            .unwrap_or(name);
        let dst = destination.join(&dst_name);
        if entry.path().is_dir() {
            merge_directory(&entry.path(), &dst)?;
        } else {
            info!("Copying: {} <- {}", dst.display(), entry.path().display());
            fs::copy(entry.path(), &dst).with_context(|| {
                format!("copying '{}' -> '{}'", entry.path().display(), dst.display())
            })?;
        }
    }
    Ok(true)
}

fn single_child(dir: &Path) -> Result<Option<PathBuf>> {
    let mut children = fs::read_dir(dir)
        .with_context(|| format!("reading '{}'", dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("reading '{}'", dir.display()))?;
    match children.len() {
        0 => Ok(None),
        1 => Ok(children.pop()),
        n => bail!("expected a single entry under '{}', found {n}", dir.display()),
    }
}
