//! Release asset checker.
//!
//! Predicts the files a release must contain from the configuration matrix
//! and the shared naming functions, lists what GitHub and PyPI actually
//! carry, and reports the difference.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::config::Matrix;
use crate::error::DistError;
use crate::naming::{sdist_name, wheel_linux_platform_tag, wheel_name, WHEEL_WINDOWS_PLATFORM_TAG};
use crate::process::{CommandLine, CommandRunner};

const PYPI_URL: &str = "https://pypi.org/pypi";

fn check_major(matrix: &Matrix, version: &str) -> Result<(), DistError> {
    let major = version.split('.').next().unwrap_or_default();
    if major == matrix.release.major_version {
        Ok(())
    } else {
        Err(DistError::InvalidRequest(format!(
            "version {version} is not a {}.x release",
            matrix.release.major_version
        )))
    }
}

/// Wheel filenames expected for `version`, grouped by package name.
pub fn expected_wheels(matrix: &Matrix, version: &str) -> Result<BTreeMap<String, BTreeSet<String>>> {
    check_major(matrix, version)?;
    let mut expected: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for python_key in matrix.python_versions() {
        let python = matrix.python(python_key)?;
        for (_, profile) in matrix.linux_profiles() {
            let tag = wheel_linux_platform_tag(profile.arch(), true);
            expected
                .entry(profile.name.clone())
                .or_default()
                .insert(wheel_name(&profile.name, version, python, &tag));
        }
        for (_, profile) in matrix.windows_profiles() {
            expected
                .entry(profile.name.clone())
                .or_default()
                .insert(wheel_name(&profile.name, version, python, WHEEL_WINDOWS_PLATFORM_TAG));
        }
    }
    Ok(expected)
}

pub fn expected_sdist(matrix: &Matrix, version: &str) -> Result<String> {
    check_major(matrix, version)?;
    Ok(sdist_name(&matrix.release.sdist_package, version))
}

/// Outcome of comparing one expected set with one actual listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub project: String,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub found: Vec<String>,
}

impl CheckReport {
    pub fn passed(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "🔵 Project: {}", self.project);
        for name in &self.missing {
            let _ = writeln!(out, "  ❓ Missing: {name}");
        }
        for name in &self.unexpected {
            let _ = writeln!(out, "  ⚠️  Unexpected: {name}");
        }
        for name in &self.found {
            let _ = writeln!(out, "  👀 Found: {name}");
        }
        if self.passed() {
            out.push_str("  ✅ Check Pass\n");
        } else {
            out.push_str("  ❌ Check Fail\n");
        }
        out
    }
}

pub fn compare(project: &str, expected: &BTreeSet<String>, actual: &[String]) -> CheckReport {
    let actual: BTreeSet<String> = actual.iter().cloned().collect();
    CheckReport {
        project: project.to_string(),
        missing: expected.difference(&actual).cloned().collect(),
        unexpected: actual.difference(expected).cloned().collect(),
        found: actual.intersection(expected).cloned().collect(),
    }
}

/// Somewhere release files are published.
pub trait AssetSource {
    /// Filenames published for `project` at `version`.
    fn list_assets(&mut self, project: &str, version: &str) -> Result<Vec<String>>;
}

/// Assets attached to the GitHub release `v{version}`, listed through `gh`.
///
/// One release carries the files of every project, so `project` is ignored.
pub struct GithubRelease<R> {
    runner: R,
    repository: String,
}

impl<R: CommandRunner> GithubRelease<R> {
    pub fn new(runner: R, repository: impl Into<String>) -> Self {
        Self {
            runner,
            repository: repository.into(),
        }
    }
}

impl<R: CommandRunner> AssetSource for GithubRelease<R> {
    fn list_assets(&mut self, _project: &str, version: &str) -> Result<Vec<String>> {
        let cmd = CommandLine::new("gh")
            .args(["release", "--repo", self.repository.as_str(), "view"])
            .arg(format!("v{version}"))
            .args(["--json", "assets", "--jq", ".assets[].name"]);
        let stdout = self
            .runner
            .output(&cmd)
            .with_context(|| format!("listing assets of GitHub release v{version}"))?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

#[derive(Debug, Deserialize)]
struct ProjectIndex {
    releases: BTreeMap<String, Vec<ReleaseFile>>,
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    filename: String,
}

/// Files of a project release on PyPI, from the JSON API.
pub struct PypiIndex {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl PypiIndex {
    pub fn new() -> Result<Self> {
        Self::with_base_url(PYPI_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("cupy-release-tools/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("creating HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

impl AssetSource for PypiIndex {
    fn list_assets(&mut self, project: &str, version: &str) -> Result<Vec<String>> {
        let url = format!("{}/{project}/json", self.base_url.trim_end_matches('/'));
        info!("Fetching {url}");
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("requesting '{url}'"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let index: ProjectIndex = response
            .error_for_status()
            .with_context(|| format!("requesting '{url}'"))?
            .json()
            .with_context(|| format!("parsing project index '{url}'"))?;
        Ok(files_for_version(index, version))
    }
}

fn files_for_version(mut index: ProjectIndex, version: &str) -> Vec<String> {
    index
        .releases
        .remove(version)
        .unwrap_or_default()
        .into_iter()
        .map(|file| file.filename)
        .collect()
}

/// Which listings to check.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckSelection {
    pub github: bool,
    pub pypi_sdist: bool,
    pub pypi_wheel: bool,
}

/// Run the selected checks, returning one report per project checked.
pub fn check_release(
    matrix: &Matrix,
    version: &str,
    selection: CheckSelection,
    github: &mut dyn AssetSource,
    pypi: &mut dyn AssetSource,
) -> Result<Vec<CheckReport>> {
    let wheels = expected_wheels(matrix, version)?;
    let sdist = expected_sdist(matrix, version)?;
    let mut reports = Vec::new();

    if selection.github {
        let mut expected: BTreeSet<String> = wheels.values().flatten().cloned().collect();
        expected.insert(sdist.clone());
        let actual = github.list_assets(&matrix.release.sdist_package, version)?;
        reports.push(compare("GitHub Release", &expected, &actual));
    }

    if selection.pypi_sdist {
        let project = &matrix.release.sdist_package;
        let actual = pypi.list_assets(project, version)?;
        reports.push(compare(project, &BTreeSet::from([sdist.clone()]), &actual));
    }

    if selection.pypi_wheel {
        for (project, expected) in &wheels {
            let actual = pypi.list_assets(project, version)?;
            reports.push(compare(project, expected, &actual));
        }
    }

    Ok(reports)
}
