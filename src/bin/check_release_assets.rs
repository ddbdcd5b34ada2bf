use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use cupy_release_tools::assets::{check_release, CheckSelection, GithubRelease, PypiIndex};
use cupy_release_tools::config::Matrix;
use cupy_release_tools::logging;
use cupy_release_tools::process::HostRunner;

#[derive(Parser, Debug)]
#[command(name = "check-release-assets", version)]
#[command(about = "Check that a release published every expected file", long_about = None)]
struct Cli {
    /// Release version, e.g. 14.0.0
    #[arg(long)]
    version: String,
    /// Check assets attached to the GitHub release
    #[arg(long)]
    github: bool,
    /// Check the sdist on PyPI
    #[arg(long)]
    pypi_sdist: bool,
    /// Check the wheels on PyPI
    #[arg(long)]
    pypi_wheel: bool,
}

fn run(cli: &Cli) -> Result<bool> {
    let matrix = Matrix::load()?;
    let selection = CheckSelection {
        github: cli.github,
        pypi_sdist: cli.pypi_sdist,
        pypi_wheel: cli.pypi_wheel,
    };
    let mut github = GithubRelease::new(HostRunner, &matrix.release.github_repository);
    let mut pypi = PypiIndex::new()?;
    let reports = check_release(matrix, &cli.version, selection, &mut github, &mut pypi)?;

    let mut success = true;
    for report in &reports {
        println!("{}", report.render());
        success &= report.passed();
    }
    Ok(success)
}

fn main() -> ExitCode {
    logging::init();
    match run(&Cli::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
