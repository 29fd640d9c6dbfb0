//! Process options and environment-driven settings

use std::collections::BTreeMap;
use std::path::PathBuf;
use crate::error::ChainError;
use crate::process::ProcessKind;

/// Default runtime used to host `fork`ed modules.
pub const DEFAULT_RUNTIME: &str = "node";

/// Runtime flags for a forked module, tagged by the form they were given in.
///
/// Both forms end up as arguments to the runtime, in front of the module path.
/// Only one form may be supplied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RuntimeArgs {
    /// No runtime flags
    #[default]
    Inherit,
    /// Flags given as an argv list (`--inspect`, `--no-warnings`, ...)
    ExecArgv(Vec<String>),
    /// Flags given as runtime options
    NodeOptions(Vec<String>),
}

impl RuntimeArgs {
    pub fn args(&self) -> &[String] {
        match self {
            RuntimeArgs::Inherit => &[],
            RuntimeArgs::ExecArgv(a) | RuntimeArgs::NodeOptions(a) => a,
        }
    }

    fn form(&self) -> &'static str {
        match self {
            RuntimeArgs::Inherit => "inherit",
            RuntimeArgs::ExecArgv(_) => "exec_argv",
            RuntimeArgs::NodeOptions(_) => "node_options",
        }
    }
}

/// Options for launching one process.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Working directory; `None` means the current directory
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
    /// Prefer locally built binaries over installed ones
    pub prefer_local: bool,
    /// Turn a non-zero exit into an error from `ProcessHandle::end_checked`
    pub reject_on_failure: bool,
    /// Runtime program for `fork`
    pub runtime: Option<String>,
    pub runtime_args: RuntimeArgs,
    /// Set when both runtime flag forms were supplied
    conflicting: Option<(&'static str, &'static str)>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            prefer_local: true,
            reject_on_failure: false,
            runtime: None,
            runtime_args: RuntimeArgs::Inherit,
            conflicting: None,
        }
    }
}

impl ProcessOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn prefer_local(mut self, prefer: bool) -> Self {
        self.prefer_local = prefer;
        self
    }

    pub fn reject_on_failure(mut self, reject: bool) -> Self {
        self.reject_on_failure = reject;
        self
    }

    pub fn runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Runtime flags as an argv list.
    pub fn exec_argv<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_runtime_args(RuntimeArgs::ExecArgv(args.into_iter().map(Into::into).collect()))
    }

    /// Runtime flags as runtime options.
    pub fn node_options<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_runtime_args(RuntimeArgs::NodeOptions(args.into_iter().map(Into::into).collect()))
    }

    fn set_runtime_args(mut self, args: RuntimeArgs) -> Self {
        let previous = self.runtime_args.form();
        if previous != "inherit" && previous != args.form() {
            self.conflicting = Some((previous, args.form()));
        }
        self.runtime_args = args;
        self
    }

    /// Check the option set for the given process kind.
    pub fn validate(&self, kind: ProcessKind) -> Result<(), ChainError> {
        if let Some((first, second)) = self.conflicting {
            return Err(ChainError::validation(format!(
                "runtime flags given as both `{}` and `{}`; use exactly one",
                first, second
            )));
        }
        if kind == ProcessKind::Spawn {
            if self.runtime_args != RuntimeArgs::Inherit {
                return Err(ChainError::validation(format!(
                    "`{}` only applies to fork, not spawn",
                    self.runtime_args.form()
                )));
            }
            if self.runtime.is_some() {
                return Err(ChainError::validation("`runtime` only applies to fork, not spawn"));
            }
        }
        Ok(())
    }
}

/// Settings read from the environment.
///
/// - `EMX_CLITEST_DEBUG=1` echoes every captured chunk to the console
/// - `EMX_CLITEST_RUNTIME=<program>` picks the runtime for `fork`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub debug: bool,
    pub runtime: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            runtime: DEFAULT_RUNTIME.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let debug = lookup("EMX_CLITEST_DEBUG")
            .map(|v| !matches!(v.as_str(), "" | "0" | "false"))
            .unwrap_or(false);
        let runtime = lookup("EMX_CLITEST_RUNTIME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
        Self { debug, runtime }
    }
}
