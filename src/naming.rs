//! Distribution file naming.
//!
//! The controller uses these functions to locate and rename artifacts, and the
//! asset checker uses the same functions to predict what a release must
//! contain. Keep them the only place the filename grammar is spelled out.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::Deserialize;

use crate::config::PythonProfile;

/// Platform tag of every Windows wheel.
pub const WHEEL_WINDOWS_PLATFORM_TAG: &str = "win_amd64";

/// CPU architectures wheels are built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum Arch {
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "aarch64")]
    Aarch64,
}

impl Arch {
    pub fn as_str(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Aarch64 => "aarch64",
        }
    }

    /// Architecture of the machine running this binary.
    pub fn host() -> anyhow::Result<Self> {
        std::env::consts::ARCH.parse()
    }

    /// Value for `docker --platform`.
    pub fn docker_platform(self) -> &'static str {
        match self {
            Arch::X86_64 => "linux/amd64",
            Arch::Aarch64 => "linux/arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            other => bail!("unsupported architecture '{other}'; expected x86_64 or aarch64"),
        }
    }
}

/// `cupy-1.2.3.tar.gz`
pub fn sdist_name(package_name: &str, version: &str) -> String {
    format!("{package_name}-{version}.tar.gz")
}

/// Wheel distribution component: project name with `-` replaced by `_`.
pub fn distribution_name(package_name: &str) -> String {
    package_name.replace('-', "_")
}

/// `{dist}-{version}-{python_tag}-{abi_tag}-{platform_tag}.whl` (PEP 491).
pub fn wheel_name(
    package_name: &str,
    version: &str,
    python: &PythonProfile,
    platform_tag: &str,
) -> String {
    format!(
        "{}-{}-{}-{}-{}.whl",
        distribution_name(package_name),
        version,
        python.python_tag,
        python.abi_tag,
        platform_tag
    )
}

/// Linux platform tag; the build tool emits `linux_*` and releases carry
/// `manylinux2014_*`.
pub fn wheel_linux_platform_tag(arch: Arch, manylinux: bool) -> String {
    if manylinux {
        format!("manylinux2014_{arch}")
    } else {
        format!("linux_{arch}")
    }
}
