use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

use cupy_release_tools::config::Matrix;
use cupy_release_tools::naming::{sdist_name, wheel_linux_platform_tag, wheel_name};
use cupy_release_tools::preflight::source_version;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DistTarget {
    Sdist,
    WheelLinux,
}

#[derive(Parser, Debug)]
#[command(name = "get-dist-info", version)]
#[command(about = "Print the file and package name of a distribution", long_about = None)]
struct Cli {
    /// Distribution kind
    #[arg(long, value_enum)]
    target: DistTarget,
    /// CuPy source tree; must be a clean checkout
    #[arg(long)]
    source: PathBuf,
    /// Platform version of the wheel (e.g. 12.x)
    #[arg(long)]
    cuda: Option<String>,
    /// Python version to build the wheel with
    #[arg(long)]
    python: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let matrix = Matrix::load()?;
    let version = source_version(&cli.source)?;

    let (file_name, package_name) = match cli.target {
        DistTarget::Sdist => {
            let package = &matrix.release.sdist_package;
            (sdist_name(package, &version), package.clone())
        }
        DistTarget::WheelLinux => {
            let (Some(cuda), Some(python)) = (&cli.cuda, &cli.python) else {
                bail!("--cuda and --python are required for wheel-linux");
            };
            let profile = matrix.linux_profile(cuda)?;
            let python = matrix.python(python)?;
            let tag = wheel_linux_platform_tag(profile.arch(), true);
            (
                wheel_name(&profile.name, &version, python, &tag),
                profile.name.clone(),
            )
        }
    };

    println!("DIST_FILE_NAME=\"{file_name}\"");
    println!("DIST_PACKAGE_NAME=\"{package_name}\"");
    Ok(())
}
