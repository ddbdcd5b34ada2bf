//! Error taxonomy for release builds.
//!
//! Every variant is fatal and nothing is retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DistError {
    /// The requested key has no entry in the configuration matrix.
    #[error("unknown {table} configuration '{key}'; available: {available}")]
    UnknownConfig {
        table: &'static str,
        key: String,
        available: String,
    },

    /// The embedded configuration matrix failed validation at load time.
    #[error("invalid configuration matrix entry '{key}': {reason}")]
    InvalidMatrix { key: String, reason: String },

    /// The target/version combination on the command line is inconsistent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("you are on a non-Windows system: {0}")]
    PlatformMismatch(String),

    #[error("cannot build wheel without CUDA Runtime installed ({0} not found)")]
    CudaRuntimeMissing(String),

    #[error("cannot build wheel for CUDA {expected} using CUDA {actual}")]
    CudaVersionMismatch { expected: String, actual: u32 },

    #[error("environment variable {0} must be set")]
    MissingEnv(&'static str),

    #[error("library {0} could not be found in PATH")]
    LibraryNotInPath(String),

    /// A preload library listed in the profile has no release for the platform.
    #[error("{library} is not available for {platform} on {os}")]
    UnsupportedPreload {
        library: String,
        platform: String,
        os: String,
    },

    #[error("command failed with {}: {command}", exit_label(*.code))]
    CommandFailed { command: String, code: Option<i32> },
}

impl DistError {
    /// Exit code the controller process should terminate with.
    pub fn exit_code(&self) -> i32 {
        match self {
            DistError::CommandFailed {
                code: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "signal".to_string(),
    }
}

/// Map an `anyhow` chain to a process exit code.
pub fn exit_code_of(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<DistError>())
        .map(DistError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn command_failure_exit_code_propagates_through_context() {
        let err = Err::<(), _>(DistError::CommandFailed {
            command: "docker build".into(),
            code: Some(125),
        })
        .context("building image")
        .unwrap_err();
        assert_eq!(exit_code_of(&err), 125);
    }

    #[test]
    fn other_errors_exit_with_one() {
        let err = anyhow::Error::new(DistError::MissingEnv("HCC_AMDGPU_TARGET"));
        assert_eq!(exit_code_of(&err), 1);

        let killed = anyhow::Error::new(DistError::CommandFailed {
            command: "docker run".into(),
            code: None,
        });
        assert_eq!(exit_code_of(&killed), 1);
        assert!(killed.to_string().contains("signal"));
    }
}
