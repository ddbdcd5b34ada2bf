//! External process boundary.
//!
//! Every docker, installer and agent invocation goes through a
//! [`CommandRunner`]. Invocations are synchronous: the caller blocks until the
//! child exits, with no timeout.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::info;

use crate::error::DistError;

/// A command line assembled by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

fn quote(token: &str) -> String {
    if !token.is_empty() && !token.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"')
    {
        return token.to_string();
    }
    format!("'{}'", token.replace('\'', r"'\''"))
}

/// Runs external commands on behalf of the controller.
pub trait CommandRunner {
    /// Run to completion with inherited stdio; non-zero exit is an error.
    fn run(&mut self, cmd: &CommandLine) -> Result<()>;

    /// Run to completion and capture stdout.
    fn output(&mut self, cmd: &CommandLine) -> Result<String>;
}

/// Runs commands on the host.
#[derive(Debug, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&mut self, cmd: &CommandLine) -> Result<()> {
        info!("Running command: {cmd}");
        let status = cmd
            .to_command()
            .status()
            .with_context(|| format!("spawning '{}'", cmd.program))?;
        if !status.success() {
            return Err(DistError::CommandFailed {
                command: cmd.to_string(),
                code: status.code(),
            }
            .into());
        }
        Ok(())
    }

    fn output(&mut self, cmd: &CommandLine) -> Result<String> {
        info!("Running command: {cmd}");
        let output = cmd
            .to_command()
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("spawning '{}'", cmd.program))?;
        if !output.status.success() {
            return Err(DistError::CommandFailed {
                command: cmd.to_string(),
                code: output.status.code(),
            }
            .into());
        }
        String::from_utf8(output.stdout)
            .with_context(|| format!("decoding output of '{}'", cmd.program))
    }
}
