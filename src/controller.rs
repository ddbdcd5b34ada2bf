//! Build/verify controller.
//!
//! Resolves a request against the configuration matrix, stages a working
//! directory, prepares the container image and runs the builder or verifier
//! agent. Linux builds and verifications run in containers; Windows ones run
//! the agent directly on the host interpreter.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use tracing::info;

use crate::agent::{BuildAgentArgs, BuildKind, VerifyAgentArgs, SOURCE_DIR, TESTS_DIR};
use crate::config::{
    Matrix, PlatformKind, PlatformProfile, PythonProfile, WindowsProfile, SDIST_LONG_DESCRIPTION,
};
use crate::docker::{
    emulation_command, image_tag, push_command, remove_command, verify_dockerfile, ImageBuild,
    ImageRole, RunSpec,
};
use crate::error::DistError;
use crate::naming::{
    sdist_name, wheel_linux_platform_tag, wheel_name, Arch, WHEEL_WINDOWS_PLATFORM_TAG,
};
use crate::preflight::{
    check_windows_environment, find_file_in_path, source_version, system_cuda_version, HostInfo,
    RuntimeEnv,
};
use crate::preload::{
    merge_installed_library, stage_preloads, LibraryInstaller, PreloadOs, WheelMetadata,
};
use crate::process::{CommandLine, CommandRunner};
use crate::workdir::{copy_tree, rewrite_package_name, with_workdir, write_file, CleanupPolicy, Workdir};

/// Matrix key used for the source distribution.
pub const SDIST_KEY: &str = "sdist";

const DESCRIPTION_FILE: &str = "description.rst";
const WHEEL_METADATA_FILE: &str = "_wheel.json";
const PRELOAD_PREFIX_DIR: &str = "cuda_lib";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    Build,
    Verify,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Build => "build",
            Action::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Target {
    Sdist,
    WheelLinux,
    WheelWin,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Sdist => "sdist",
            Target::WheelLinux => "wheel-linux",
            Target::WheelWin => "wheel-win",
        }
    }
}

/// Run-time switches shared by every step of an invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Prepare images but skip the build/verify run itself.
    pub dry_run: bool,
    /// Push images after building them.
    pub push: bool,
    /// Remove images after the run.
    pub rmi: bool,
}

#[derive(Debug, Clone)]
pub enum Job {
    Build { source: PathBuf, output: PathBuf },
    Verify { dist: PathBuf, tests: Vec<PathBuf> },
}

#[derive(Debug, Clone)]
pub struct Request {
    pub target: Target,
    /// Platform key (`12.x`, `rocm-6.2`, ...); wheels only.
    pub cuda: Option<String>,
    /// Short python version (`3.11`).
    pub python: String,
    pub job: Job,
}

impl Request {
    pub fn action(&self) -> Action {
        match self.job {
            Job::Build { .. } => Action::Build,
            Job::Verify { .. } => Action::Verify,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SelectedProfile<'m> {
    Linux(&'m PlatformProfile),
    Windows(&'m WindowsProfile),
}

/// A request resolved against the matrix.
#[derive(Debug, Clone)]
pub struct Selection<'m> {
    pub target: Target,
    /// Matrix key, `sdist` for source distributions.
    pub key: String,
    pub python: &'m PythonProfile,
    pub profile: SelectedProfile<'m>,
}

impl<'m> Selection<'m> {
    fn linux(&self) -> Result<&'m PlatformProfile, DistError> {
        match self.profile {
            SelectedProfile::Linux(profile) => Ok(profile),
            SelectedProfile::Windows(_) => Err(DistError::InvalidRequest(format!(
                "{} is not a Linux target",
                self.target.as_str()
            ))),
        }
    }

    fn windows(&self) -> Result<&'m WindowsProfile, DistError> {
        match self.profile {
            SelectedProfile::Windows(profile) => Ok(profile),
            SelectedProfile::Linux(_) => Err(DistError::InvalidRequest(format!(
                "{} is not a Windows target",
                self.target.as_str()
            ))),
        }
    }
}

/// Look up every matrix entry a request needs.
pub fn resolve<'m>(
    matrix: &'m Matrix,
    target: Target,
    cuda: Option<&str>,
    python: &str,
) -> Result<Selection<'m>, DistError> {
    let (key, profile) = match (target, cuda) {
        (Target::Sdist, Some(cuda)) => {
            return Err(DistError::InvalidRequest(format!(
                "sdist is platform independent; got a platform version '{cuda}'"
            )))
        }
        (Target::Sdist, None) => (SDIST_KEY.to_string(), SelectedProfile::Linux(matrix.sdist())),
        (_, None) => {
            return Err(DistError::InvalidRequest(format!(
                "{} requires a platform version (--cuda)",
                target.as_str()
            )))
        }
        (Target::WheelLinux, Some(key)) => (
            key.to_string(),
            SelectedProfile::Linux(matrix.linux_profile(key)?),
        ),
        (Target::WheelWin, Some(key)) => (
            key.to_string(),
            SelectedProfile::Windows(matrix.windows_profile(key)?),
        ),
    };
    Ok(Selection {
        target,
        key,
        python: matrix.python(python)?,
        profile,
    })
}

/// What a Linux build produces and where it goes.
struct LinuxBuildPlan {
    kind: BuildKind,
    package: String,
    long_description: String,
    /// Name written by the build tool under `cupy/dist/`.
    built_name: String,
    /// Name published in the release.
    release_name: String,
}

pub struct Controller<'m, R> {
    matrix: &'m Matrix,
    runner: R,
    host: HostInfo,
    tools_dir: PathBuf,
    runtime: RuntimeEnv,
    options: ControllerOptions,
    host_python: String,
    cuda_probe: fn(&str) -> Option<u32>,
    emulation_ready: bool,
}

impl<'m, R: CommandRunner> Controller<'m, R> {
    /// `tools_dir` holds the `builder/` and `verifier/` agent directories.
    pub fn new(matrix: &'m Matrix, runner: R, host: HostInfo, tools_dir: impl Into<PathBuf>) -> Self {
        let host_python = if host.is_windows() { "python" } else { "python3" };
        Self {
            matrix,
            runner,
            host,
            tools_dir: tools_dir.into(),
            runtime: RuntimeEnv::default(),
            options: ControllerOptions::default(),
            host_python: host_python.to_string(),
            cuda_probe: system_cuda_version,
            emulation_ready: false,
        }
    }

    pub fn options(mut self, options: ControllerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn runtime_env(mut self, runtime: RuntimeEnv) -> Self {
        self.runtime = runtime;
        self
    }

    /// Interpreter used for host-side tools and Windows agents.
    pub fn host_python(mut self, python: impl Into<String>) -> Self {
        self.host_python = python.into();
        self
    }

    pub fn cuda_probe(mut self, probe: fn(&str) -> Option<u32>) -> Self {
        self.cuda_probe = probe;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn run(&mut self, request: &Request) -> Result<()> {
        let selection = resolve(self.matrix, request.target, request.cuda.as_deref(), &request.python)?;
        let windows = request.target == Target::WheelWin;
        info!("Starting {} for {}", request.action().as_str(), request.target.as_str());
        match &request.job {
            Job::Build { source, output } if windows => {
                self.build_windows(&selection, source, output).map(drop)
            }
            Job::Build { source, output } => self.build_linux(&selection, source, output).map(drop),
            Job::Verify { dist, tests } if windows => self.verify_windows(&selection, dist, tests),
            Job::Verify { dist, tests } => self.verify_linux(&selection, dist, tests),
        }
    }

    fn build_plan(&self, selection: &Selection<'m>, profile: &PlatformProfile, version: &str) -> LinuxBuildPlan {
        if selection.target == Target::Sdist {
            let package = self.matrix.release.sdist_package.clone();
            let name = sdist_name(&package, version);
            return LinuxBuildPlan {
                kind: BuildKind::Sdist,
                long_description: SDIST_LONG_DESCRIPTION.to_string(),
                built_name: name.clone(),
                release_name: name,
                package,
            };
        }
        let arch = profile.arch();
        LinuxBuildPlan {
            kind: BuildKind::Wheel,
            package: profile.name.clone(),
            long_description: self
                .matrix
                .wheel_long_description(profile.kind, profile.platform_version(&selection.key)),
            built_name: wheel_name(
                &profile.name,
                version,
                selection.python,
                &wheel_linux_platform_tag(arch, false),
            ),
            release_name: wheel_name(
                &profile.name,
                version,
                selection.python,
                &wheel_linux_platform_tag(arch, true),
            ),
        }
    }

    /// Build an sdist or Linux wheel in a container. Returns the path of the
    /// copied distribution, or `None` for a dry run.
    pub fn build_linux(
        &mut self,
        selection: &Selection<'m>,
        source: &Path,
        output: &Path,
    ) -> Result<Option<PathBuf>> {
        let profile = selection.linux()?;
        let version = source_version(source)?;
        let plan = self.build_plan(selection, profile, &version);
        let arch = profile.arch();
        let platform_version = profile.platform_version(&selection.key).to_string();
        info!(
            "Starting {} build from {} (version {}, for {} + Python {})",
            selection.target.as_str(),
            source.display(),
            version,
            selection.key,
            selection.python.version
        );

        let mut agent = BuildAgentArgs::new(plan.kind)
            .python(&selection.python.version)
            .chown(self.host.chown_arg())
            .env(
                "CUPY_INSTALL_LONG_DESCRIPTION",
                format!("../{DESCRIPTION_FILE}"),
            );
        if plan.kind == BuildKind::Wheel {
            agent = agent
                .requires(&selection.python.requires)
                .env("CUPY_INSTALL_NO_RPATH", "1")
                .env("CUPY_INSTALL_WHEEL_METADATA", format!("../{WHEEL_METADATA_FILE}"));
            if !profile.libs.is_empty() {
                agent = agent.env("CUPY_INSTALL_WHEEL_LIBS", profile.libs.join(":"));
            }
            if !profile.includes.is_empty() {
                agent = agent.env("CUPY_INSTALL_WHEEL_INCLUDES", profile.includes.join(":"));
            }
            if profile.kind == PlatformKind::Rocm {
                let target = self.runtime.require_amdgpu_target()?.to_string();
                agent = agent
                    .env("CUPY_INSTALL_USE_HIP", "1")
                    .env(RuntimeEnv::AMDGPU_TARGET, target);
            }
        }
        let agent_args = agent.into_args();
        let tag = image_tag(&self.matrix.release, ImageRole::Build, &selection.key, None);

        with_workdir(CleanupPolicy::Strict, |workdir| {
            let source_copy = workdir.join(SOURCE_DIR);
            info!("Copying source tree from: {}", source.display());
            copy_tree(source, &source_copy)?;
            if plan.kind == BuildKind::Wheel {
                rewrite_package_name(&source_copy, &plan.package)?;
            }
            write_file(&workdir.join(DESCRIPTION_FILE), &plan.long_description)?;

            let docker_ctx = workdir.join("builder");
            info!("Copying builder directory to: {}", docker_ctx.display());
            copy_tree(&self.tools_dir.join("builder"), &docker_ctx)?;

            if plan.kind == BuildKind::Wheel {
                let prefix = docker_ctx.join(PRELOAD_PREFIX_DIR);
                fs::create_dir_all(&prefix)
                    .with_context(|| format!("creating directory '{}'", prefix.display()))?;
                let installer = LibraryInstaller::from_source_tree(&self.host_python, &source_copy);
                let metadata = stage_preloads(
                    &mut self.runner,
                    &installer,
                    profile.kind,
                    &platform_version,
                    &profile.preloads,
                    PreloadOs::Linux,
                    &prefix,
                )?;
                write_wheel_metadata(workdir, &metadata)?;
            }

            self.ensure_emulation(arch)?;
            let build = ImageBuild::new(&tag, &docker_ctx, &profile.dockerfile, &profile.image)
                .arch(arch)
                .build_arg("python_versions", self.matrix.pyenv_versions())
                .build_arg("cython_version", &self.matrix.release.cython_version);
            self.build_image(&build)?;

            if self.options.dry_run {
                info!("Dry run: skipping build");
                return Ok(None);
            }

            info!("Starting build");
            let run = RunSpec {
                image: &tag,
                workdir: workdir.path(),
                arch,
                kind: profile.kind,
                gpu: false,
                agent_args: &agent_args,
            };
            self.runner.run(&run.command(&self.runtime)?)?;
            info!("Finished build");

            let built = source_copy.join("dist").join(&plan.built_name);
            let copied = copy_artifact(&built, output, &plan.release_name)?;
            self.remove_image(&tag)?;
            Ok(Some(copied))
        })
    }

    /// Build a Windows wheel with the host toolchain.
    pub fn build_windows(
        &mut self,
        selection: &Selection<'m>,
        source: &Path,
        output: &Path,
    ) -> Result<Option<PathBuf>> {
        let profile = selection.windows()?;
        check_windows_environment(&self.host, &selection.key, profile, self.cuda_probe)?;
        self.note_python_version(selection.python)?;

        let version = source_version(source)?;
        info!(
            "Starting wheel-win build from {} (version {}, for CUDA {} + Python {})",
            source.display(),
            version,
            selection.key,
            selection.python.version
        );

        let mut bundled = Vec::new();
        for lib in &profile.libs {
            let path = find_file_in_path(lib).ok_or_else(|| DistError::LibraryNotInPath(lib.clone()))?;
            bundled.push(path.display().to_string());
        }
        let cuda_path = if profile.preloads.is_empty() {
            None
        } else {
            Some(self.runtime.require_cuda_path()?.to_path_buf())
        };

        let mut agent = BuildAgentArgs::new(BuildKind::Wheel)
            .requires(&selection.python.requires)
            .env(
                "CUPY_INSTALL_LONG_DESCRIPTION",
                format!("../{DESCRIPTION_FILE}"),
            )
            .env("CUPY_INSTALL_WHEEL_METADATA", format!("../{WHEEL_METADATA_FILE}"));
        if !bundled.is_empty() {
            agent = agent.env("CUPY_INSTALL_WHEEL_LIBS", bundled.join(";"));
        }
        let agent_args = agent.into_args();
        let built_name = wheel_name(&profile.name, &version, selection.python, WHEEL_WINDOWS_PLATFORM_TAG);
        let long_description = self.matrix.wheel_long_description(profile.kind, &selection.key);

        with_workdir(CleanupPolicy::WarnOnFailure, |workdir| {
            let source_copy = workdir.join(SOURCE_DIR);
            info!("Copying source tree from: {}", source.display());
            copy_tree(source, &source_copy)?;
            rewrite_package_name(&source_copy, &profile.name)?;
            write_file(&workdir.join(DESCRIPTION_FILE), &long_description)?;

            let prefix = workdir.join(PRELOAD_PREFIX_DIR);
            fs::create_dir_all(&prefix)
                .with_context(|| format!("creating directory '{}'", prefix.display()))?;
            let installer = LibraryInstaller::from_source_tree(&self.host_python, &source_copy);
            let metadata = stage_preloads(
                &mut self.runner,
                &installer,
                profile.kind,
                &selection.key,
                &profile.preloads,
                PreloadOs::Windows,
                &prefix,
            )?;
            write_wheel_metadata(workdir, &metadata)?;

            if self.options.dry_run {
                info!("Dry run: skipping build");
                return Ok(None);
            }

            if let Some(cuda_path) = &cuda_path {
                for lib in &profile.preloads {
                    merge_installed_library(&prefix, lib, cuda_path)?;
                }
            }

            info!("Starting build");
            let cmd = CommandLine::new(&self.host_python)
                .arg(self.tools_dir.join("builder").join("agent.py").display().to_string())
                .args(agent_args.iter().cloned())
                .current_dir(workdir.path());
            self.runner.run(&cmd)?;
            info!("Finished build");

            let built = source_copy.join("dist").join(&built_name);
            copy_artifact(&built, output, &built_name).map(Some)
        })
    }

    /// Verify a distribution in a container, once per verification system.
    pub fn verify_linux(&mut self, selection: &Selection<'m>, dist: &Path, tests: &[PathBuf]) -> Result<()> {
        let profile = selection.linux()?;
        if profile.kind == PlatformKind::Rocm {
            self.runtime.require_amdgpu_target()?;
        }
        let arch = profile.arch();
        let dist_name = file_name(dist)?;

        let mut agent = VerifyAgentArgs::new(&dist_name)
            .python(&selection.python.version)
            .chown(self.host.chown_arg());
        if selection.target == Target::WheelLinux && profile.kind == PlatformKind::Cuda {
            agent = agent.cuda(&selection.key).preloads(&profile.preloads);
        }
        let agent_args = agent.into_args();

        for system in &profile.verify_systems {
            let base_image = profile.verify_image_for(system);
            let tag = image_tag(
                &self.matrix.release,
                ImageRole::Verify,
                &selection.key,
                Some(&system.name),
            );
            info!(
                "Starting verification for {} on {} with Python {}",
                dist.display(),
                base_image,
                selection.python.version
            );

            with_workdir(CleanupPolicy::Strict, |workdir| {
                stage_verification(workdir, dist, &dist_name, tests)?;
                let docker_ctx = workdir.join("verifier");
                info!("Copying verifier directory to: {}", docker_ctx.display());
                copy_tree(&self.tools_dir.join("verifier"), &docker_ctx)?;

                self.ensure_emulation(arch)?;
                let build = ImageBuild::new(&tag, &docker_ctx, verify_dockerfile(system.os), &base_image)
                    .arch(arch)
                    .build_arg("python_versions", self.matrix.pyenv_versions())
                    .build_arg("system_packages", profile.system_packages.join(" "));
                self.build_image(&build)?;

                if self.options.dry_run {
                    info!("Dry run: skipping verification");
                    return Ok(());
                }

                info!("Starting verification");
                let run = RunSpec {
                    image: &tag,
                    workdir: workdir.path(),
                    arch,
                    kind: profile.kind,
                    gpu: true,
                    agent_args: &agent_args,
                };
                self.runner.run(&run.command(&self.runtime)?)?;
                info!("Finished verification");
                self.remove_image(&tag)
            })?;
        }
        Ok(())
    }

    /// Verify a Windows wheel with the host interpreter.
    pub fn verify_windows(&mut self, selection: &Selection<'m>, dist: &Path, tests: &[PathBuf]) -> Result<()> {
        let profile = selection.windows()?;
        check_windows_environment(&self.host, &selection.key, profile, self.cuda_probe)?;
        self.note_python_version(selection.python)?;
        info!(
            "Starting verification for {} with Python {}",
            dist.display(),
            selection.python.version
        );

        let dist_name = file_name(dist)?;
        let agent_args = VerifyAgentArgs::new(&dist_name)
            .cuda(&selection.key)
            .preloads(&profile.preloads)
            .into_args();

        with_workdir(CleanupPolicy::WarnOnFailure, |workdir| {
            stage_verification(workdir, dist, &dist_name, tests)?;
            if self.options.dry_run {
                info!("Dry run: skipping verification");
                return Ok(());
            }
            info!("Starting verification");
            let cmd = CommandLine::new(&self.host_python)
                .arg(self.tools_dir.join("verifier").join("agent.py").display().to_string())
                .args(agent_args.iter().cloned())
                .current_dir(workdir.path());
            self.runner.run(&cmd)?;
            info!("Finished verification");
            Ok(())
        })
    }

    /// Windows runs use whatever interpreter is installed; differing from the
    /// requested one is allowed but noted.
    fn note_python_version(&mut self, python: &PythonProfile) -> Result<()> {
        let cmd = CommandLine::new(&self.host_python)
            .args(["-c", "import platform; print(platform.python_version())"]);
        let current = self.runner.output(&cmd)?;
        let current = current.trim();
        if current != python.version {
            info!(
                "Note: Building wheel for Python {} using Python {}",
                python.version, current
            );
        }
        Ok(())
    }

    fn ensure_emulation(&mut self, arch: Arch) -> Result<()> {
        if arch == self.host.arch || self.emulation_ready {
            return Ok(());
        }
        info!("Registering emulators for {arch}");
        self.runner.run(&emulation_command())?;
        self.emulation_ready = true;
        Ok(())
    }

    fn build_image(&mut self, build: &ImageBuild) -> Result<()> {
        info!("Building Docker image: {}", build.tag());
        self.runner
            .run(&build.command())
            .with_context(|| format!("building image {}", build.tag()))?;
        if self.options.push {
            info!("Pushing Docker image: {}", build.tag());
            self.runner.run(&push_command(build.tag()))?;
        }
        Ok(())
    }

    fn remove_image(&mut self, tag: &str) -> Result<()> {
        if self.options.rmi {
            info!("Removing Docker image: {tag}");
            self.runner.run(&remove_command(tag))?;
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> Result<String> {
    match path.file_name() {
        Some(name) => Ok(name.to_string_lossy().into_owned()),
        None => bail!("not a file path: {}", path.display()),
    }
}

fn write_wheel_metadata(workdir: &Workdir, metadata: &WheelMetadata) -> Result<()> {
    write_file(&workdir.join(WHEEL_METADATA_FILE), &metadata.to_json_pretty()?)
}

/// Copy the distribution and test directories into the working directory.
fn stage_verification(workdir: &Workdir, dist: &Path, dist_name: &str, tests: &[PathBuf]) -> Result<()> {
    info!("Copying distribution from: {}", dist.display());
    let dist_copy = workdir.join(dist_name);
    fs::copy(dist, &dist_copy)
        .with_context(|| format!("copying '{}' -> '{}'", dist.display(), dist_copy.display()))?;

    let tests_dir = workdir.join(TESTS_DIR);
    fs::create_dir_all(&tests_dir)
        .with_context(|| format!("creating directory '{}'", tests_dir.display()))?;
    for test in tests {
        info!("Copying tests from: {}", test.display());
        copy_tree(test, &tests_dir.join(file_name(test)?))?;
    }
    Ok(())
}

fn copy_artifact(built: &Path, output: &Path, release_name: &str) -> Result<PathBuf> {
    if !built.is_file() {
        bail!("built distribution not found: {}", built.display());
    }
    fs::create_dir_all(output)
        .with_context(|| format!("creating output directory '{}'", output.display()))?;
    let destination = output.join(release_name);
    info!("Copying asset from {} to {}", built.display(), destination.display());
    fs::copy(built, &destination).with_context(|| {
        format!("copying '{}' -> '{}'", built.display(), destination.display())
    })?;
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{expected_sdist, expected_wheels};
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    const VERSION: &str = "14.0.0";

    const CUTENSOR_DUMP: &str = r#"[
        {"cuda": "11.x", "cutensor": "2.1.0", "assets": {"Linux": {"filenames": ["libcutensor.so.2"]}, "Windows": {"filenames": ["cutensor.dll"]}}},
        {"cuda": "12.x", "cutensor": "2.1.0", "assets": {"Linux": {"filenames": ["libcutensor.so.2"]}, "Windows": {"filenames": ["cutensor.dll"]}}}
    ]"#;

    const NCCL_DUMP: &str = r#"[
        {"cuda": "11.x", "nccl": "2.16.5", "assets": {"Linux": {"filenames": ["libnccl.so.2"]}}},
        {"cuda": "12.x", "nccl": "2.25.1", "assets": {"Linux": {"filenames": ["libnccl.so.2"]}}}
    ]"#;

    struct Fixture {
        _temp: TempDir,
        source: PathBuf,
        tools: PathBuf,
        output: PathBuf,
        dist: PathBuf,
        tests: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("cupy-src");
        fs::create_dir_all(source.join("cupy")).unwrap();
        fs::write(
            source.join("cupy/_version.py"),
            format!("__version__ = '{VERSION}'\n"),
        )
        .unwrap();
        fs::write(
            source.join("pyproject.toml"),
            "[project]\nname = \"cupy\"\ndynamic = [\"version\"]\n",
        )
        .unwrap();

        let tools = temp.path().join("tools");
        for (dir, file) in [
            ("builder", "Dockerfile"),
            ("builder", "agent.py"),
            ("verifier", "Dockerfile.debian"),
            ("verifier", "Dockerfile.rhel"),
            ("verifier", "agent.py"),
        ] {
            fs::create_dir_all(tools.join(dir)).unwrap();
            fs::write(tools.join(dir).join(file), "").unwrap();
        }

        let dist = temp.path().join("cupy_cuda12x-14.0.0-cp311-cp311-manylinux2014_x86_64.whl");
        fs::write(&dist, "wheel").unwrap();
        let tests = temp.path().join("cupy_tests");
        fs::create_dir_all(&tests).unwrap();
        fs::write(tests.join("test_core.py"), "def test(): pass\n").unwrap();

        Fixture {
            output: temp.path().join("out"),
            _temp: temp,
            source,
            tools,
            dist,
            tests,
        }
    }

    fn linux_host() -> HostInfo {
        HostInfo {
            os: "linux".into(),
            arch: Arch::X86_64,
            owner: Some((1000, 1000)),
        }
    }

    fn windows_host() -> HostInfo {
        HostInfo {
            os: "windows".into(),
            arch: Arch::X86_64,
            owner: None,
        }
    }

    /// Host path mounted at /work by a `docker run`.
    fn mounted_workdir(cmd: &CommandLine) -> PathBuf {
        let position = cmd.args.iter().position(|a| a == "--volume").unwrap();
        let volume = &cmd.args[position + 1];
        PathBuf::from(volume.strip_suffix(":/work").unwrap())
    }

    /// Runner that answers the library installer and fakes the build tool by
    /// writing `built_name` into the mounted source tree.
    fn building_runner(built_name: String) -> RecordingRunner {
        RecordingRunner::default()
            .with_output("--library cutensor --action dump", CUTENSOR_DUMP)
            .with_output("--library nccl --action dump", NCCL_DUMP)
            .on_run("docker run --rm --volume", move |cmd| {
                let dist = mounted_workdir(cmd).join("cupy/dist");
                fs::create_dir_all(&dist)?;
                fs::write(dist.join(&built_name), "wheel")?;
                Ok(())
            })
    }

    fn build_request(fx: &Fixture, target: Target, cuda: Option<&str>, python: &str) -> Request {
        Request {
            target,
            cuda: cuda.map(str::to_string),
            python: python.to_string(),
            job: Job::Build {
                source: fx.source.clone(),
                output: fx.output.clone(),
            },
        }
    }

    fn leftover_workdirs(cmds: &[CommandLine]) -> Vec<PathBuf> {
        cmds.iter()
            .filter(|c| c.args.first().map(String::as_str) == Some("run") && c.args.contains(&"--volume".to_string()))
            .map(mounted_workdir)
            .filter(|p| p.exists())
            .collect()
    }

    #[test]
    fn test_wheel_linux_build_produces_manylinux_wheel() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let runner = building_runner(
            "cupy_cuda12x-14.0.0-cp311-cp311-linux_x86_64.whl".to_string(),
        )
        .on_run("docker run --rm --volume", |cmd| {
            let workdir = mounted_workdir(cmd);
            let pyproject = fs::read_to_string(workdir.join("cupy/pyproject.toml"))?;
            assert!(pyproject.contains("name = \"cupy-cuda12x\""));
            let metadata = fs::read_to_string(workdir.join("_wheel.json"))?;
            assert!(metadata.contains("\"packaging\": \"pip\""));
            assert!(metadata.contains("\"nccl\""));
            assert!(workdir.join("description.rst").is_file());
            assert!(workdir.join("builder/cuda_lib").is_dir());
            Ok(())
        });
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools);
        let selection = resolve(matrix, Target::WheelLinux, Some("12.x"), "3.11").unwrap();

        let built = controller
            .build_linux(&selection, &fx.source, &fx.output)
            .unwrap()
            .unwrap();

        assert_eq!(
            built.file_name().unwrap(),
            "cupy_cuda12x-14.0.0-cp311-cp311-manylinux2014_x86_64.whl"
        );
        assert!(built.is_file());

        let runner = controller.runner();
        let rendered = runner.rendered();
        assert!(rendered.iter().any(|c| c.starts_with(
            "docker build --tag cupy/cupy-release-tools:build-12.x-v14 --cache-from cupy/cupy-release-tools:build-12.x-v14"
        )));
        let run = rendered.iter().find(|c| c.starts_with("docker run --rm --volume")).unwrap();
        assert!(run.ends_with(
            "cupy/cupy-release-tools:build-12.x-v14 --action wheel --source cupy --python 3.11.11 \
             --chown 1000:1000 --env CUPY_INSTALL_LONG_DESCRIPTION=../description.rst \
             --env CUPY_INSTALL_NO_RPATH=1 --env CUPY_INSTALL_WHEEL_METADATA=../_wheel.json"
        ));
        assert!(!run.contains("--gpus"));
        assert_eq!(runner.count_matching("--prefix"), 2);
        assert_eq!(runner.count_matching("docker push"), 0);
        assert_eq!(runner.count_matching("qemu-user-static"), 0);
        assert!(leftover_workdirs(&runner.commands).is_empty());

        let expected = expected_wheels(matrix, VERSION).unwrap();
        assert!(expected["cupy-cuda12x"].contains(built.file_name().unwrap().to_str().unwrap()));
    }

    #[test]
    fn test_sdist_build_keeps_package_name() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let runner = building_runner("cupy-14.0.0.tar.gz".to_string()).on_run(
            "docker run --rm --volume",
            |cmd| {
                let workdir = mounted_workdir(cmd);
                let pyproject = fs::read_to_string(workdir.join("cupy/pyproject.toml"))?;
                assert!(pyproject.contains("name = \"cupy\""));
                assert!(!workdir.join("_wheel.json").exists());
                Ok(())
            },
        );
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools);
        controller
            .run(&build_request(&fx, Target::Sdist, None, "3.12"))
            .unwrap();

        let sdist = expected_sdist(matrix, VERSION).unwrap();
        assert!(fx.output.join(&sdist).is_file());
        let runner = controller.runner();
        assert_eq!(runner.count_matching("install_library.py"), 0);
        assert_eq!(runner.count_matching("--action sdist --source cupy --python 3.12.8"), 1);
        assert_eq!(runner.count_matching("--requires"), 0);
    }

    #[test]
    fn test_dry_run_skips_container_and_image_removal() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let options = ControllerOptions {
            dry_run: true,
            push: true,
            rmi: true,
        };
        let mut controller =
            Controller::new(matrix, building_runner(String::new()), linux_host(), &fx.tools).options(options);
        controller
            .run(&build_request(&fx, Target::WheelLinux, Some("12.x"), "3.11"))
            .unwrap();

        let runner = controller.runner();
        assert_eq!(runner.count_matching("docker build"), 1);
        assert_eq!(runner.count_matching("docker push cupy/cupy-release-tools:build-12.x-v14"), 1);
        assert_eq!(runner.count_matching("docker run --rm --volume"), 0);
        assert_eq!(runner.count_matching("docker rmi"), 0);
        assert!(!fx.output.exists());
    }

    #[test]
    fn test_push_and_rmi_after_run() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let options = ControllerOptions {
            dry_run: false,
            push: true,
            rmi: true,
        };
        let runner = building_runner("cupy_cuda12x-14.0.0-cp311-cp311-linux_x86_64.whl".to_string());
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools).options(options);
        controller
            .run(&build_request(&fx, Target::WheelLinux, Some("12.x"), "3.11"))
            .unwrap();

        let rendered = controller.runner().rendered();
        let position = |prefix: &str| rendered.iter().position(|c| c.starts_with(prefix)).unwrap();
        assert!(position("docker build") < position("docker push"));
        assert!(position("docker push") < position("docker run --rm --volume"));
        assert!(position("docker run --rm --volume") < position("docker rmi"));
    }

    #[test]
    fn test_cross_arch_registers_emulation_once() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let runner = building_runner("cupy_cuda12x-14.0.0-cp311-cp311-linux_aarch64.whl".to_string());
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools);
        let request = build_request(&fx, Target::WheelLinux, Some("12.x-aarch64"), "3.11");
        controller.run(&request).unwrap();
        controller.run(&request).unwrap();

        let runner = controller.runner();
        assert_eq!(runner.count_matching("multiarch/qemu-user-static"), 1);
        assert_eq!(runner.count_matching("--platform linux/arm64"), 4);
        assert!(fx
            .output
            .join("cupy_cuda12x-14.0.0-cp311-cp311-manylinux2014_aarch64.whl")
            .is_file());
    }

    #[test]
    fn test_rocm_build_requires_amdgpu_target() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let mut controller = Controller::new(matrix, RecordingRunner::default(), linux_host(), &fx.tools);
        let err = controller
            .run(&build_request(&fx, Target::WheelLinux, Some("rocm-6.2"), "3.11"))
            .unwrap_err();
        assert!(err.to_string().contains("HCC_AMDGPU_TARGET"));
        assert!(controller.runner().commands.is_empty());

        let runtime = RuntimeEnv {
            amdgpu_target: Some("gfx90a".into()),
            ..RuntimeEnv::default()
        };
        let runner = building_runner("cupy_rocm_6_2-14.0.0-cp311-cp311-linux_x86_64.whl".to_string());
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools).runtime_env(runtime);
        controller
            .run(&build_request(&fx, Target::WheelLinux, Some("rocm-6.2"), "3.11"))
            .unwrap();
        let rendered = controller.runner().rendered();
        let run = rendered.iter().find(|c| c.starts_with("docker run --rm --volume")).unwrap();
        assert!(run.contains("--env CUPY_INSTALL_USE_HIP=1 --env HCC_AMDGPU_TARGET=gfx90a"));
        assert!(!run.contains("/dev/kfd"));
    }

    #[test]
    fn test_rocm_verify_requires_amdgpu_target_before_image_build() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let options = ControllerOptions {
            push: true,
            ..ControllerOptions::default()
        };
        let mut controller =
            Controller::new(matrix, RecordingRunner::default(), linux_host(), &fx.tools).options(options);
        let request = Request {
            target: Target::WheelLinux,
            cuda: Some("rocm-6.2".into()),
            python: "3.11".into(),
            job: Job::Verify {
                dist: fx.dist.clone(),
                tests: vec![fx.tests.clone()],
            },
        };
        let err = controller.run(&request).unwrap_err();
        assert!(err.to_string().contains("HCC_AMDGPU_TARGET"));
        assert!(controller.runner().commands.is_empty());
    }

    #[test]
    fn test_request_action_follows_job() {
        let fx = fixture();
        let build = build_request(&fx, Target::Sdist, None, "3.10");
        assert_eq!(build.action(), Action::Build);
        assert_eq!(build.action().as_str(), "build");
        let verify = Request {
            job: Job::Verify {
                dist: fx.dist.clone(),
                tests: Vec::new(),
            },
            ..build
        };
        assert_eq!(verify.action(), Action::Verify);
    }

    #[test]
    fn test_resolve_rejects_inconsistent_requests() {
        let matrix = Matrix::load().unwrap();
        assert!(matches!(
            resolve(matrix, Target::Sdist, Some("12.x"), "3.11"),
            Err(DistError::InvalidRequest(_))
        ));
        assert!(matches!(
            resolve(matrix, Target::WheelLinux, None, "3.11"),
            Err(DistError::InvalidRequest(_))
        ));
        assert!(matches!(
            resolve(matrix, Target::WheelLinux, Some("9.2"), "3.11"),
            Err(DistError::UnknownConfig { table: "wheel-linux", .. })
        ));
        assert!(matches!(
            resolve(matrix, Target::WheelWin, Some("rocm-6.2"), "3.11"),
            Err(DistError::UnknownConfig { table: "wheel-win", .. })
        ));
        assert!(matches!(
            resolve(matrix, Target::WheelLinux, Some("12.x"), "2.7"),
            Err(DistError::UnknownConfig { table: "python", .. })
        ));
    }

    #[test]
    fn test_unknown_key_fails_before_any_side_effect() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let mut controller = Controller::new(matrix, RecordingRunner::default(), linux_host(), &fx.tools);
        let mut request = build_request(&fx, Target::WheelLinux, Some("8.0"), "3.11");
        request.job = Job::Build {
            source: fx.source.join("missing"),
            output: fx.output.clone(),
        };
        let err = controller.run(&request).unwrap_err();
        assert!(err.to_string().contains("unknown wheel-linux configuration '8.0'"));
        assert!(controller.runner().commands.is_empty());
        assert!(!fx.output.exists());
    }

    #[test]
    fn test_wheel_win_on_linux_fails_first() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let mut controller = Controller::new(matrix, RecordingRunner::default(), linux_host(), &fx.tools)
            .cuda_probe(|_| panic!("runtime probed on a non-Windows host"));
        let err = controller
            .run(&build_request(&fx, Target::WheelWin, Some("12.x"), "3.11"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DistError>(),
            Some(DistError::PlatformMismatch(_))
        ));
        assert!(controller.runner().commands.is_empty());
        assert!(!fx.output.exists());
    }

    #[test]
    fn test_wheel_win_build_on_windows_host() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let built_name = "cupy_cuda12x-14.0.0-cp311-cp311-win_amd64.whl";
        let cuda_path = fx.output.parent().unwrap().join("cuda");
        fs::create_dir_all(&cuda_path).unwrap();
        let runner = RecordingRunner::default()
            .with_output("platform.python_version", "3.11.9\n")
            .with_output("--library cutensor --action dump", CUTENSOR_DUMP)
            .on_run("agent.py", move |cmd| {
                let dist = cmd.cwd.clone().unwrap().join("cupy/dist");
                fs::create_dir_all(&dist)?;
                fs::write(dist.join(built_name), "wheel")?;
                Ok(())
            });
        let runtime = RuntimeEnv {
            cuda_path: Some(cuda_path),
            ..RuntimeEnv::default()
        };
        let mut controller = Controller::new(matrix, runner, windows_host(), &fx.tools)
            .runtime_env(runtime)
            .cuda_probe(|lib| (lib == "cudart64_12").then_some(12040));
        controller
            .run(&build_request(&fx, Target::WheelWin, Some("12.x"), "3.11"))
            .unwrap();

        assert!(fx.output.join(built_name).is_file());
        let rendered = controller.runner().rendered();
        let agent = rendered.iter().find(|c| c.contains("builder/agent.py")).unwrap();
        assert!(agent.starts_with("python "));
        assert!(agent.contains("--action wheel --source cupy --env"));
        assert!(!agent.contains("--python"));
        assert!(!agent.contains("--chown"));
        assert_eq!(controller.runner().count_matching("docker"), 0);

        let expected = expected_wheels(matrix, VERSION).unwrap();
        assert!(expected["cupy-cuda12x"].contains(built_name));
    }

    /// Windows host runner whose library installer drops cuTENSOR under the
    /// requested prefix.
    fn windows_preload_runner(built_name: &'static str) -> RecordingRunner {
        RecordingRunner::default()
            .with_output("platform.python_version", "3.11.9\n")
            .with_output("--library cutensor --action dump", CUTENSOR_DUMP)
            .on_run("--library cutensor --cuda 12.x --prefix", |cmd| {
                let position = cmd.args.iter().position(|a| a == "--prefix").unwrap();
                let lib = PathBuf::from(&cmd.args[position + 1]).join("12.x/cutensor/2.1.0/lib");
                fs::create_dir_all(&lib)?;
                fs::write(lib.join("cutensor.dll"), "dll")?;
                Ok(())
            })
            .on_run("builder/agent.py", move |cmd| {
                let dist = cmd.cwd.clone().unwrap().join("cupy/dist");
                fs::create_dir_all(&dist)?;
                fs::write(dist.join(built_name), "wheel")?;
                Ok(())
            })
    }

    #[test]
    fn test_wheel_win_dry_run_leaves_cuda_path_untouched() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let built_name = "cupy_cuda12x-14.0.0-cp311-cp311-win_amd64.whl";
        let cuda_path = fx.output.parent().unwrap().join("cuda");
        fs::create_dir_all(&cuda_path).unwrap();
        let runtime = RuntimeEnv {
            cuda_path: Some(cuda_path.clone()),
            ..RuntimeEnv::default()
        };
        let options = ControllerOptions {
            dry_run: true,
            ..ControllerOptions::default()
        };

        let mut controller = Controller::new(matrix, windows_preload_runner(built_name), windows_host(), &fx.tools)
            .options(options)
            .runtime_env(runtime.clone())
            .cuda_probe(|lib| (lib == "cudart64_12").then_some(12040));
        controller
            .run(&build_request(&fx, Target::WheelWin, Some("12.x"), "3.11"))
            .unwrap();
        assert_eq!(controller.runner().count_matching("--prefix"), 1);
        assert_eq!(controller.runner().count_matching("builder/agent.py"), 0);
        assert!(!cuda_path.join("bin").exists());
        assert!(!fx.output.join(built_name).exists());

        let mut controller = Controller::new(matrix, windows_preload_runner(built_name), windows_host(), &fx.tools)
            .runtime_env(runtime)
            .cuda_probe(|lib| (lib == "cudart64_12").then_some(12040));
        controller
            .run(&build_request(&fx, Target::WheelWin, Some("12.x"), "3.11"))
            .unwrap();
        assert!(cuda_path.join("bin/cutensor.dll").is_file());
        assert!(fx.output.join(built_name).is_file());
    }

    #[test]
    fn test_wheel_win_rejects_wrong_cuda_runtime() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let mut controller = Controller::new(matrix, RecordingRunner::default(), windows_host(), &fx.tools)
            .cuda_probe(|_| Some(11080));
        let err = controller
            .run(&build_request(&fx, Target::WheelWin, Some("12.x"), "3.11"))
            .unwrap_err();
        assert!(err.to_string().contains("cannot build wheel for CUDA 12.x using CUDA 11080"));
        assert!(controller.runner().commands.is_empty());
    }

    #[test]
    fn test_verify_linux_runs_each_system() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let dist_name = fx.dist.file_name().unwrap().to_str().unwrap().to_string();
        let runner = RecordingRunner::default().on_run("docker run --rm --volume", move |cmd| {
            let workdir = mounted_workdir(cmd);
            assert!(workdir.join(&dist_name).is_file());
            assert!(workdir.join("tests/cupy_tests/test_core.py").is_file());
            Ok(())
        });
        let options = ControllerOptions {
            rmi: true,
            ..ControllerOptions::default()
        };
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools).options(options);
        let request = Request {
            target: Target::WheelLinux,
            cuda: Some("12.x".into()),
            python: "3.11".into(),
            job: Job::Verify {
                dist: fx.dist.clone(),
                tests: vec![fx.tests.clone()],
            },
        };
        controller.run(&request).unwrap();

        let runner = controller.runner();
        let rendered = runner.rendered();
        assert_eq!(runner.count_matching("docker run --rm --volume"), 2);
        assert!(rendered.iter().any(|c| c.contains("verifier/Dockerfile.debian")
            && c.contains("base_image=nvidia/cuda:12.0.1-runtime-ubuntu22.04")
            && c.contains("--tag cupy/cupy-release-tools:verify-12.x-ubuntu22.04-v14")));
        assert!(rendered.iter().any(|c| c.contains("verifier/Dockerfile.rhel")));
        let run = rendered.iter().find(|c| c.starts_with("docker run --rm --volume")).unwrap();
        assert!(run.contains("--gpus all"));
        assert!(run.ends_with(&format!(
            "--dist {} --python 3.11.11 --cuda 12.x --preload cutensor --preload nccl --chown 1000:1000 tests",
            fx.dist.file_name().unwrap().to_str().unwrap()
        )));
        assert_eq!(runner.count_matching("docker rmi"), 2);
        assert!(leftover_workdirs(&runner.commands).is_empty());
    }

    #[test]
    fn test_failed_verification_propagates_exit_code() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let runner = RecordingRunner::default().failing_on("docker run --rm --volume", 3);
        let mut controller = Controller::new(matrix, runner, linux_host(), &fx.tools);
        let request = Request {
            target: Target::Sdist,
            cuda: None,
            python: "3.10".into(),
            job: Job::Verify {
                dist: fx.dist.clone(),
                tests: vec![fx.tests.clone()],
            },
        };
        let err = controller.run(&request).unwrap_err();
        assert_eq!(crate::error::exit_code_of(&err), 3);
        assert!(leftover_workdirs(&controller.runner().commands).is_empty());
    }

    #[test]
    fn test_verify_windows_runs_host_agent() {
        let fx = fixture();
        let matrix = Matrix::load().unwrap();
        let runner = RecordingRunner::default().with_output("platform.python_version", "3.12.8");
        let mut controller = Controller::new(matrix, runner, windows_host(), &fx.tools)
            .cuda_probe(|_| Some(12000));
        let request = Request {
            target: Target::WheelWin,
            cuda: Some("12.x".into()),
            python: "3.12".into(),
            job: Job::Verify {
                dist: fx.dist.clone(),
                tests: vec![fx.tests.clone()],
            },
        };
        controller.run(&request).unwrap();
        let rendered = controller.runner().rendered();
        let agent = rendered.iter().find(|c| c.contains("verifier/agent.py")).unwrap();
        assert!(agent.ends_with("--cuda 12.x --preload cutensor tests"));
        assert!(controller.runner().commands.last().unwrap().cwd.is_some());
    }
}
