//! Container image lifecycle and container execution.
//!
//! Only command lines are produced here; running them is the job of a
//! [`CommandRunner`](crate::process::CommandRunner).

use std::path::{Path, PathBuf};

use crate::config::{OsFamily, PlatformKind, ReleaseInfo};
use crate::error::DistError;
use crate::naming::Arch;
use crate::preflight::RuntimeEnv;
use crate::process::CommandLine;

const DOCKER: &str = "docker";
const EMULATION_IMAGE: &str = "multiarch/qemu-user-static";

/// Mount point of the working directory inside containers.
pub const CONTAINER_WORKDIR: &str = "/work";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRole {
    Build,
    Verify,
}

impl ImageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageRole::Build => "build",
            ImageRole::Verify => "verify",
        }
    }
}

/// `{repository}:{role}-{key}[-{system}]-v{major}`
///
/// Tags are deterministic so a previously pushed image can seed the build
/// cache.
pub fn image_tag(release: &ReleaseInfo, role: ImageRole, key: &str, system: Option<&str>) -> String {
    let mut tag = format!("{}:{}-{}", release.image_repository, role.as_str(), key);
    if let Some(system) = system {
        tag.push('-');
        tag.push_str(system);
    }
    tag.push_str(&format!("-v{}", release.major_version));
    tag
}

/// Verifier Dockerfile for an OS family.
pub fn verify_dockerfile(os: OsFamily) -> &'static str {
    match os {
        OsFamily::Rhel => "Dockerfile.rhel",
        OsFamily::Debian => "Dockerfile.debian",
        OsFamily::Default => "Dockerfile",
    }
}

/// Only non-default architectures are passed to `--platform`.
fn platform_flag(arch: Arch) -> Option<&'static str> {
    match arch {
        Arch::X86_64 => None,
        Arch::Aarch64 => Some(arch.docker_platform()),
    }
}

/// A `docker build` invocation.
#[derive(Debug, Clone)]
pub struct ImageBuild {
    tag: String,
    context: PathBuf,
    dockerfile: String,
    base_image: String,
    arch: Arch,
    build_args: Vec<(String, String)>,
}

impl ImageBuild {
    pub fn new(
        tag: impl Into<String>,
        context: impl Into<PathBuf>,
        dockerfile: impl Into<String>,
        base_image: impl Into<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            context: context.into(),
            dockerfile: dockerfile.into(),
            base_image: base_image.into(),
            arch: Arch::X86_64,
            build_args: Vec::new(),
        }
    }

    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn build_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_args.push((key.into(), value.into()));
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn command(&self) -> CommandLine {
        let mut cmd = CommandLine::new(DOCKER)
            .arg("build")
            .env("DOCKER_BUILDKIT", "1")
            .args(["--tag", self.tag.as_str(), "--cache-from", self.tag.as_str()])
            .args(["--build-arg", "BUILDKIT_INLINE_CACHE=1"])
            .arg("--build-arg")
            .arg(format!("base_image={}", self.base_image));
        if let Some(platform) = platform_flag(self.arch) {
            cmd = cmd.args(["--platform", platform]);
        }
        for (key, value) in &self.build_args {
            cmd = cmd.arg("--build-arg").arg(format!("{key}={value}"));
        }
        cmd.arg("--file")
            .arg(self.context.join(&self.dockerfile).display().to_string())
            .arg(self.context.display().to_string())
    }
}

pub fn push_command(tag: &str) -> CommandLine {
    CommandLine::new(DOCKER).args(["push", tag])
}

pub fn remove_command(tag: &str) -> CommandLine {
    CommandLine::new(DOCKER).args(["rmi", tag])
}

/// Registers QEMU binfmt handlers so foreign-architecture images can run.
pub fn emulation_command() -> CommandLine {
    CommandLine::new(DOCKER).args([
        "run",
        "--rm",
        "--privileged",
        EMULATION_IMAGE,
        "--reset",
        "-p",
        "yes",
    ])
}

/// A `docker run` of an agent with the working directory mounted.
#[derive(Debug, Clone)]
pub struct RunSpec<'a> {
    pub image: &'a str,
    pub workdir: &'a Path,
    pub arch: Arch,
    pub kind: PlatformKind,
    /// Whether the agent needs a GPU. Packaging-only runs do not.
    pub gpu: bool,
    pub agent_args: &'a [String],
}

impl RunSpec<'_> {
    pub fn command(&self, runtime: &RuntimeEnv) -> Result<CommandLine, DistError> {
        let mut cmd = CommandLine::new(DOCKER)
            .args(["run", "--rm", "--volume"])
            .arg(format!("{}:{CONTAINER_WORKDIR}", self.workdir.display()))
            .args(["--workdir", CONTAINER_WORKDIR]);
        if let Some(platform) = platform_flag(self.arch) {
            cmd = cmd.args(["--platform", platform]);
        }
        if self.gpu {
            match self.kind {
                PlatformKind::Cuda => cmd = cmd.args(["--gpus", "all"]),
                PlatformKind::Rocm => {
                    let target = runtime.require_amdgpu_target()?;
                    cmd = cmd
                        .args(["--device", "/dev/kfd", "--device", "/dev/dri", "--env"])
                        .arg(format!("{}={target}", RuntimeEnv::AMDGPU_TARGET));
                    if let Some(group) = &runtime.video_group {
                        cmd = cmd.args(["--group-add", group.as_str()]);
                    }
                }
            }
        }
        Ok(cmd.arg(self.image).args(self.agent_args.iter().cloned()))
    }
}
