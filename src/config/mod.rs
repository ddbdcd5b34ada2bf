//! Build/verify configuration matrix.
//!
//! The matrix is embedded TOML, parsed and validated the first time it is
//! requested, and read-only afterwards. A malformed entry fails the whole load
//! instead of surfacing when some later build happens to touch it.

mod description;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::Result;
use serde::Deserialize;

use crate::error::DistError;
use crate::naming::Arch;

pub use description::{
    SDIST_LONG_DESCRIPTION, WHEEL_LONG_DESCRIPTION_CUDA, WHEEL_LONG_DESCRIPTION_ROCM,
};

const MATRIX_TOML: &str = include_str!("matrix.toml");

/// Optional libraries the library installer knows about.
pub const KNOWN_PRELOADS: &[&str] = &["cutensor", "nccl", "cudnn", "cusparselt"];

static MATRIX: OnceLock<Matrix> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Cuda,
    Rocm,
}

impl PlatformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformKind::Cuda => "cuda",
            PlatformKind::Rocm => "rocm",
        }
    }
}

/// OS family of a verification system; selects `verifier/Dockerfile.<os>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Rhel,
    Debian,
    Default,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseInfo {
    pub major_version: String,
    pub image_repository: String,
    pub cython_version: String,
    pub sdist_package: String,
    pub github_repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PythonProfile {
    /// Exact interpreter build installed in the builder image.
    pub version: String,
    pub python_tag: String,
    pub abi_tag: String,
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifySystem {
    pub name: String,
    pub os: OsFamily,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformProfile {
    pub name: String,
    pub kind: PlatformKind,
    pub platform_version: Option<String>,
    pub arch: Option<Arch>,
    pub image: String,
    pub dockerfile: String,
    pub libs: Vec<String>,
    pub includes: Vec<String>,
    pub preloads: Vec<String>,
    pub system_packages: Vec<String>,
    pub verify_image: String,
    pub verify_systems: Vec<VerifySystem>,
}

impl PlatformProfile {
    /// Architecture the distribution is built for.
    pub fn arch(&self) -> Arch {
        self.arch.unwrap_or(Arch::X86_64)
    }

    /// Version string recorded for this platform; ROCm profiles carry their
    /// own, CUDA profiles are identified by their matrix key.
    pub fn platform_version<'a>(&'a self, key: &'a str) -> &'a str {
        self.platform_version.as_deref().unwrap_or(key)
    }

    /// Base image for one verification system.
    pub fn verify_image_for(&self, system: &VerifySystem) -> String {
        self.verify_image.replace("{system}", &system.name)
    }
}

/// Accepted CUDA runtime versions, `min <= x < max`, on the
/// `major * 1000 + minor * 10` encoding reported by `cudaRuntimeGetVersion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "[u32; 2]")]
pub struct CudaVersionRange {
    pub min: u32,
    pub max: u32,
}

impl From<[u32; 2]> for CudaVersionRange {
    fn from([min, max]: [u32; 2]) -> Self {
        Self { min, max }
    }
}

impl CudaVersionRange {
    pub fn contains(&self, version: u32) -> bool {
        self.min <= version && version < self.max
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindowsProfile {
    pub name: String,
    pub kind: PlatformKind,
    pub libs: Vec<String>,
    pub preloads: Vec<String>,
    pub cudart_lib: String,
    pub check_version: CudaVersionRange,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Matrix {
    pub release: ReleaseInfo,
    python: BTreeMap<String, PythonProfile>,
    sdist: PlatformProfile,
    linux: BTreeMap<String, PlatformProfile>,
    windows: BTreeMap<String, WindowsProfile>,
}

impl Matrix {
    /// The embedded matrix, parsed and validated on first use.
    pub fn load() -> Result<&'static Matrix> {
        if let Some(matrix) = MATRIX.get() {
            return Ok(matrix);
        }
        let matrix = Self::from_toml_str(MATRIX_TOML)?;
        Ok(MATRIX.get_or_init(|| matrix))
    }

    pub fn from_toml_str(raw: &str) -> Result<Matrix> {
        let matrix: Matrix = toml::from_str(raw).map_err(|err| DistError::InvalidMatrix {
            key: "<document>".to_string(),
            reason: err.to_string(),
        })?;
        matrix.validate()?;
        Ok(matrix)
    }

    pub fn sdist(&self) -> &PlatformProfile {
        &self.sdist
    }

    pub fn linux_profile(&self, key: &str) -> Result<&PlatformProfile, DistError> {
        self.linux.get(key).ok_or_else(|| DistError::UnknownConfig {
            table: "wheel-linux",
            key: key.to_string(),
            available: join_keys(self.linux.keys()),
        })
    }

    pub fn windows_profile(&self, key: &str) -> Result<&WindowsProfile, DistError> {
        self.windows.get(key).ok_or_else(|| DistError::UnknownConfig {
            table: "wheel-win",
            key: key.to_string(),
            available: join_keys(self.windows.keys()),
        })
    }

    pub fn python(&self, version: &str) -> Result<&PythonProfile, DistError> {
        self.python.get(version).ok_or_else(|| DistError::UnknownConfig {
            table: "python",
            key: version.to_string(),
            available: self.python_versions().join(", "),
        })
    }

    /// Short python versions in numeric order.
    pub fn python_versions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = self.python.keys().map(String::as_str).collect();
        versions.sort_by_key(|v| version_sort_key(v));
        versions
    }

    /// Exact interpreter builds, space separated, for image build arguments.
    pub fn pyenv_versions(&self) -> String {
        self.python_versions()
            .iter()
            .filter_map(|v| self.python.get(*v))
            .map(|p| p.version.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn linux_profiles(&self) -> impl Iterator<Item = (&str, &PlatformProfile)> {
        self.linux.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn windows_profiles(&self) -> impl Iterator<Item = (&str, &WindowsProfile)> {
        self.windows.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// reST long description for a wheel of the given profile.
    pub fn wheel_long_description(&self, kind: PlatformKind, platform_version: &str) -> String {
        let template = match kind {
            PlatformKind::Cuda => WHEEL_LONG_DESCRIPTION_CUDA,
            PlatformKind::Rocm => WHEEL_LONG_DESCRIPTION_ROCM,
        };
        template.replace("{version}", platform_version)
    }

    fn validate(&self) -> Result<(), DistError> {
        let release = &self.release;
        if release.major_version.parse::<u32>().is_err() {
            return Err(invalid("release", "major_version must be an integer"));
        }
        for (field, value) in [
            ("image_repository", &release.image_repository),
            ("cython_version", &release.cython_version),
            ("github_repository", &release.github_repository),
        ] {
            if value.trim().is_empty() {
                return Err(invalid("release", &format!("{field} must not be empty")));
            }
        }
        validate_package_name("release", &release.sdist_package)?;

        if self.python.is_empty() {
            return Err(invalid("python", "at least one python version is required"));
        }
        for (short, profile) in &self.python {
            if !profile.version.starts_with(&format!("{short}.")) {
                return Err(invalid(
                    short,
                    &format!("exact version '{}' does not match", profile.version),
                ));
            }
            if !profile.python_tag.starts_with("cp") || !profile.abi_tag.starts_with("cp") {
                return Err(invalid(short, "python/abi tags must be CPython tags"));
            }
        }

        if self.sdist.name != release.sdist_package {
            return Err(invalid(
                "sdist",
                &format!(
                    "package name '{}' differs from release.sdist_package '{}'",
                    self.sdist.name, release.sdist_package
                ),
            ));
        }
        validate_platform_profile("sdist", &self.sdist)?;
        for (key, profile) in &self.linux {
            validate_platform_profile(key, profile)?;
        }

        for (key, profile) in &self.windows {
            validate_package_name(key, &profile.name)?;
            if profile.kind != PlatformKind::Cuda {
                return Err(invalid(key, "Windows wheels are CUDA only"));
            }
            if profile.cudart_lib.trim().is_empty() {
                return Err(invalid(key, "cudart_lib must not be empty"));
            }
            if profile.check_version.min >= profile.check_version.max {
                return Err(invalid(key, "check_version must be [min, max) with min < max"));
            }
            validate_preloads(key, &profile.preloads)?;
        }
        Ok(())
    }
}

fn validate_platform_profile(key: &str, profile: &PlatformProfile) -> Result<(), DistError> {
    validate_package_name(key, &profile.name)?;
    if profile.image.trim().is_empty() || profile.dockerfile.trim().is_empty() {
        return Err(invalid(key, "image and dockerfile must not be empty"));
    }
    match profile.kind {
        PlatformKind::Rocm => {
            if profile.platform_version.is_none() {
                return Err(invalid(key, "ROCm profiles require platform_version"));
            }
            if !profile.preloads.is_empty() {
                return Err(invalid(key, "ROCm profiles cannot have preloads"));
            }
        }
        PlatformKind::Cuda => validate_preloads(key, &profile.preloads)?,
    }
    if profile.verify_systems.is_empty() {
        return Err(invalid(key, "at least one verify system is required"));
    }
    let default_only =
        profile.verify_systems.len() == 1 && profile.verify_systems[0].name == "default";
    if !default_only && !profile.verify_image.contains("{system}") {
        return Err(invalid(key, "verify_image must contain '{system}'"));
    }
    Ok(())
}

fn validate_preloads(key: &str, preloads: &[String]) -> Result<(), DistError> {
    for lib in preloads {
        if !KNOWN_PRELOADS.contains(&lib.as_str()) {
            return Err(invalid(
                key,
                &format!(
                    "unknown preload library '{lib}' (expected one of: {})",
                    KNOWN_PRELOADS.join(", ")
                ),
            ));
        }
    }
    Ok(())
}

fn validate_package_name(key: &str, name: &str) -> Result<(), DistError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(invalid(key, &format!("invalid package name '{name}'")))
    }
}

fn invalid(key: &str, reason: &str) -> DistError {
    DistError::InvalidMatrix {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn join_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    keys.map(String::as_str).collect::<Vec<_>>().join(", ")
}

fn version_sort_key(version: &str) -> Vec<u32> {
    version
        .split('.')
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}
