//! Release tooling for CuPy source and wheel distributions.
//!
//! The crate builds and verifies distributions across CUDA/ROCm platform
//! versions, CPU architectures and Python versions:
//!
//! - **Configuration matrix** - Embedded TOML describing every platform profile
//! - **Controller** - Staging, container image preparation and agent runs
//! - **Naming** - The one definition of sdist/wheel filenames
//! - **Asset checker** - Compares published release files against the matrix
//!
//! # Architecture
//!
//! ```text
//! dist (bin)
//!     │
//!     └── controller
//!             ├── config      matrix lookups
//!             ├── preflight   host checks (tools, OS, CUDA runtime)
//!             ├── workdir     cupy-dist-* staging, cleanup
//!             ├── preload     optional libraries, _wheel.json
//!             ├── docker      image build/push/rmi, docker run
//!             ├── agent       builder/verifier argument lists
//!             └── process     CommandRunner boundary
//!
//! check-release-assets (bin) ── assets ── naming ── config
//! get-dist-info (bin) ───────────────────── naming ── config
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use cupy_release_tools::config::Matrix;
//! use cupy_release_tools::controller::{Controller, Job, Request, Target};
//! use cupy_release_tools::preflight::HostInfo;
//! use cupy_release_tools::process::HostRunner;
//!
//! let matrix = Matrix::load()?;
//! let mut controller = Controller::new(matrix, HostRunner, HostInfo::detect()?, ".");
//! controller.run(&Request {
//!     target: Target::WheelLinux,
//!     cuda: Some("12.x".into()),
//!     python: "3.12".into(),
//!     job: Job::Build { source: "cupy".into(), output: ".".into() },
//! })?;
//! ```

pub mod agent;
pub mod assets;
pub mod config;
pub mod controller;
pub mod docker;
pub mod error;
pub mod logging;
pub mod naming;
pub mod preflight;
pub mod preload;
pub mod process;
pub mod workdir;

pub use error::{exit_code_of, DistError};
