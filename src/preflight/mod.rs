//! Preflight checks for build validation.
//!
//! Validates the host before any working directory or container is created,
//! so that environment problems fail fast instead of halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use cupy_release_tools::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("docker") {
//!     println!("docker not installed");
//! }
//!
//! let tools = &[("docker", "docker-ce")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::WindowsProfile;
use crate::error::DistError;
use crate::naming::Arch;

/// Host tools required by container-based builds.
///
/// Each tuple is (command_name, package_name).
pub const LINUX_REQUIRED_TOOLS: &[(&str, &str)] = &[("docker", "docker-ce")];

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Facts about the machine running the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    /// `std::env::consts::OS` of the host, e.g. `linux` or `windows`.
    pub os: String,
    pub arch: Arch,
    /// `uid:gid` handed to agents so they can return file ownership.
    pub owner: Option<(u32, u32)>,
}

impl HostInfo {
    pub fn detect() -> Result<Self> {
        Ok(Self {
            os: env::consts::OS.to_string(),
            arch: Arch::host()?,
            owner: current_owner(),
        })
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }

    pub fn chown_arg(&self) -> Option<String> {
        self.owner.map(|(uid, gid)| format!("{uid}:{gid}"))
    }
}

#[cfg(unix)]
fn current_owner() -> Option<(u32, u32)> {
    // SAFETY: getuid/getgid cannot fail and touch no memory.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    Some((uid, gid))
}

#[cfg(not(unix))]
fn current_owner() -> Option<(u32, u32)> {
    None
}

/// Host environment variables consulted by builds and verifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    /// `HCC_AMDGPU_TARGET`: GPU architectures ROCm code is compiled for.
    pub amdgpu_target: Option<String>,
    /// `CUPY_RELEASE_VIDEO_GROUP`: host group owning `/dev/kfd`.
    pub video_group: Option<String>,
    /// `CUDA_PATH`: toolkit root that Windows preload libraries are merged into.
    pub cuda_path: Option<PathBuf>,
}

impl RuntimeEnv {
    pub const AMDGPU_TARGET: &'static str = "HCC_AMDGPU_TARGET";
    pub const VIDEO_GROUP: &'static str = "CUPY_RELEASE_VIDEO_GROUP";
    pub const CUDA_PATH: &'static str = "CUDA_PATH";

    pub fn from_env() -> Self {
        Self {
            amdgpu_target: non_empty_var(Self::AMDGPU_TARGET),
            video_group: non_empty_var(Self::VIDEO_GROUP),
            cuda_path: non_empty_var(Self::CUDA_PATH).map(PathBuf::from),
        }
    }

    pub fn require_amdgpu_target(&self) -> Result<&str, DistError> {
        self.amdgpu_target
            .as_deref()
            .ok_or(DistError::MissingEnv(Self::AMDGPU_TARGET))
    }

    pub fn require_cuda_path(&self) -> Result<&Path, DistError> {
        self.cuda_path
            .as_deref()
            .ok_or(DistError::MissingEnv(Self::CUDA_PATH))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

/// First `PATH` entry containing a file called `name`.
pub fn find_file_in_path(name: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    find_file_in_dirs(name, env::split_paths(&path))
}

pub fn find_file_in_dirs(name: &str, dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

type CudaRuntimeGetVersion = unsafe extern "C" fn(*mut c_int) -> c_int;

/// CUDA Runtime version (`major * 1000 + minor * 10`) reported by the named
/// runtime library, or `None` when it cannot be loaded.
pub fn system_cuda_version(cudart_lib: &str) -> Option<u32> {
    let filename = libloading::library_filename(cudart_lib);
    let candidates = [filename.as_os_str(), OsStr::new(cudart_lib)];
    for candidate in candidates {
        // SAFETY: loading the CUDA runtime runs no initialisers beyond its own.
        let Ok(lib) = (unsafe { libloading::Library::new(candidate) }) else {
            continue;
        };
        // SAFETY: cudaRuntimeGetVersion has this signature in every CUDA release.
        let Ok(func) = (unsafe { lib.get::<CudaRuntimeGetVersion>(b"cudaRuntimeGetVersion\0") })
        else {
            debug!("{candidate:?} has no cudaRuntimeGetVersion");
            continue;
        };
        let mut version: c_int = 0;
        // SAFETY: the out-pointer is valid for the duration of the call.
        let status = unsafe { func(&mut version) };
        if status != 0 {
            debug!("cudaRuntimeGetVersion failed with status {status}");
            return None;
        }
        return u32::try_from(version).ok();
    }
    None
}

/// Checks for builds that run directly on a Windows host instead of inside a
/// container.
///
/// `probe` returns the installed CUDA Runtime version for a runtime library
/// name (see [`system_cuda_version`]).
pub fn check_windows_environment(
    host: &HostInfo,
    cuda_version: &str,
    profile: &WindowsProfile,
    probe: impl FnOnce(&str) -> Option<u32>,
) -> Result<(), DistError> {
    if !host.is_windows() {
        return Err(DistError::PlatformMismatch(host.os.clone()));
    }

    let current = probe(&profile.cudart_lib)
        .ok_or_else(|| DistError::CudaRuntimeMissing(profile.cudart_lib.clone()))?;
    if !profile.check_version.contains(current) {
        return Err(DistError::CudaVersionMismatch {
            expected: cuda_version.to_string(),
            actual: current,
        });
    }
    Ok(())
}

/// `__version__` declared in `<source>/cupy/_version.py`.
pub fn source_version(source_tree: &Path) -> Result<String> {
    let path = source_tree.join("cupy").join("_version.py");
    let content = fs::read_to_string(&path)
        .with_context(|| format!("reading version file '{}'", path.display()))?;
    for line in content.lines() {
        let Some(rest) = line.trim().strip_prefix("__version__") else {
            continue;
        };
        let Some(value) = rest.trim_start().strip_prefix('=') else {
            continue;
        };
        let value = value.trim();
        let unquoted = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')));
        if let Some(version) = unquoted.filter(|v| !v.is_empty()) {
            return Ok(version.to_string());
        }
    }
    bail!("no __version__ assignment in '{}'", path.display())
}
