use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::error;

use cupy_release_tools::config::Matrix;
use cupy_release_tools::controller::{Action, Controller, ControllerOptions, Job, Request, Target};
use cupy_release_tools::preflight::{check_required_tools, HostInfo, RuntimeEnv, LINUX_REQUIRED_TOOLS};
use cupy_release_tools::process::HostRunner;
use cupy_release_tools::{exit_code_of, logging};

#[derive(Parser, Debug)]
#[command(name = "dist", version)]
#[command(about = "Build or verify a CuPy distribution", long_about = None)]
struct Cli {
    /// Action to perform
    #[arg(long, value_enum)]
    action: Action,
    /// Distribution to build or verify
    #[arg(long, value_enum)]
    target: Target,
    /// Platform version of the wheel (e.g. 12.x, rocm-6.2)
    #[arg(long)]
    cuda: Option<String>,
    /// Python version (e.g. 3.12)
    #[arg(long)]
    python: String,
    /// Prepare images without building or verifying
    #[arg(long)]
    dry_run: bool,
    /// Push container images after building them
    #[arg(long)]
    push: bool,
    /// Remove container images after use
    #[arg(long)]
    rmi: bool,
    /// Directory holding the builder/ and verifier/ agents
    #[arg(long, default_value = ".")]
    tools_dir: PathBuf,

    /// [build] CuPy source tree; must be a clean checkout
    #[arg(long)]
    source: Option<PathBuf>,
    /// [build] Directory to place the built distribution in
    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// [verify] Distribution (sdist or wheel) to verify
    #[arg(long)]
    dist: Option<PathBuf>,
    /// [verify] Directory of unit tests (can be repeated)
    #[arg(long = "test")]
    tests: Vec<PathBuf>,
}

impl Cli {
    fn request(self) -> Result<(Request, ControllerOptions, PathBuf)> {
        let job = match self.action {
            Action::Build => {
                let Some(source) = self.source else {
                    bail!("--source is required for build");
                };
                Job::Build {
                    source,
                    output: self.output,
                }
            }
            Action::Verify => {
                let Some(dist) = self.dist else {
                    bail!("--dist is required for verify");
                };
                if self.tests.is_empty() {
                    bail!("at least one --test is required for verify");
                }
                Job::Verify {
                    dist,
                    tests: self.tests,
                }
            }
        };
        let options = ControllerOptions {
            dry_run: self.dry_run,
            push: self.push,
            rmi: self.rmi,
        };
        let request = Request {
            target: self.target,
            cuda: self.cuda,
            python: self.python,
            job,
        };
        Ok((request, options, self.tools_dir))
    }
}

fn run(cli: Cli) -> Result<()> {
    let matrix = Matrix::load()?;
    let (request, options, tools_dir) = cli.request()?;
    let host = HostInfo::detect()?;
    if request.target != Target::WheelWin {
        check_required_tools(LINUX_REQUIRED_TOOLS)?;
    }

    let mut controller = Controller::new(matrix, HostRunner, host, tools_dir)
        .options(options)
        .runtime_env(RuntimeEnv::from_env());
    controller.run(&request)
}

fn main() -> ExitCode {
    logging::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = exit_code_of(&err).clamp(1, 255);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
