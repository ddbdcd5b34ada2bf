//! Argument lists for the builder and verifier agents.
//!
//! The agents run inside the build/verify containers (or directly on the
//! host for Windows) and receive these tokens verbatim.

/// Distribution kind produced by the builder agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Sdist,
    Wheel,
}

impl BuildKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildKind::Sdist => "sdist",
            BuildKind::Wheel => "wheel",
        }
    }
}

/// Source directory name, relative to the working directory.
pub const SOURCE_DIR: &str = "cupy";

/// Tests directory name, relative to the working directory.
pub const TESTS_DIR: &str = "tests";

#[derive(Debug, Clone)]
pub struct BuildAgentArgs {
    kind: BuildKind,
    python: Option<String>,
    requires: Vec<String>,
    chown: Option<String>,
    env: Vec<(String, String)>,
}

impl BuildAgentArgs {
    pub fn new(kind: BuildKind) -> Self {
        Self {
            kind,
            python: None,
            requires: Vec::new(),
            chown: None,
            env: Vec::new(),
        }
    }

    /// Interpreter build to select inside the builder image. Without it the
    /// agent uses its own interpreter.
    pub fn python(mut self, version: impl Into<String>) -> Self {
        self.python = Some(version.into());
        self
    }

    pub fn requires(mut self, requirements: &[String]) -> Self {
        self.requires.extend_from_slice(requirements);
        self
    }

    pub fn chown(mut self, owner: Option<String>) -> Self {
        self.chown = owner;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn into_args(self) -> Vec<String> {
        let mut args = vec![
            "--action".to_string(),
            self.kind.as_str().to_string(),
            "--source".to_string(),
            SOURCE_DIR.to_string(),
        ];
        if let Some(python) = self.python {
            args.extend(["--python".to_string(), python]);
        }
        for req in self.requires {
            args.extend(["--requires".to_string(), req]);
        }
        if let Some(owner) = self.chown {
            args.extend(["--chown".to_string(), owner]);
        }
        for (key, value) in self.env {
            args.extend(["--env".to_string(), format!("{key}={value}")]);
        }
        args
    }
}

#[derive(Debug, Clone)]
pub struct VerifyAgentArgs {
    dist: String,
    python: Option<String>,
    cuda: Option<String>,
    preloads: Vec<String>,
    chown: Option<String>,
}

impl VerifyAgentArgs {
    pub fn new(dist: impl Into<String>) -> Self {
        Self {
            dist: dist.into(),
            python: None,
            cuda: None,
            preloads: Vec::new(),
            chown: None,
        }
    }

    pub fn python(mut self, version: impl Into<String>) -> Self {
        self.python = Some(version.into());
        self
    }

    /// CUDA version the preload libraries are installed for.
    pub fn cuda(mut self, version: impl Into<String>) -> Self {
        self.cuda = Some(version.into());
        self
    }

    pub fn preloads(mut self, libraries: &[String]) -> Self {
        self.preloads.extend_from_slice(libraries);
        self
    }

    pub fn chown(mut self, owner: Option<String>) -> Self {
        self.chown = owner;
        self
    }

    /// Agent options followed by the pytest arguments.
    pub fn into_args(self) -> Vec<String> {
        let mut args = vec!["--dist".to_string(), self.dist];
        if let Some(python) = self.python {
            args.extend(["--python".to_string(), python]);
        }
        if let Some(cuda) = self.cuda {
            args.extend(["--cuda".to_string(), cuda]);
        }
        for lib in self.preloads {
            args.extend(["--preload".to_string(), lib]);
        }
        if let Some(owner) = self.chown {
            args.extend(["--chown".to_string(), owner]);
        }
        args.push(TESTS_DIR.to_string());
        args
    }
}
