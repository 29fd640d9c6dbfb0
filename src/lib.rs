//! emx-clitest: a chainable process harness for CLI E2E testing
//!
//! Spawn a command (or fork a module), interact with it over stdin, wait
//! on its output, and assert on files, streams and the exit code, all as
//! one ordered chain that runs when awaited.
//!
//! # Overview
//!
//! ```no_run
//! # async fn demo() -> Result<(), emx_clitest::ChainError> {
//! use emx_clitest::runner;
//!
//! runner()
//!     .tmpdir()
//!     .spawn("my-tool init --name demo")
//!     .wait_stdout("project name\\?")
//!     .write("demo")
//!     .stdout("created demo")
//!     .file("demo/Cargo.toml")
//!     .code(0)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Steps
//!
//! | Step | Description |
//! |---------|-------------|
//! | `spawn` | Run a command line as the active process |
//! | `fork` | Host a module in the runtime, with a message channel |
//! | `wait` | Wait for stdout/stderr to match, a message, exit or close |
//! | `write` | Write one line to stdin |
//! | `kill` | Signal the active process |
//! | `shell` | Run a command to completion; non-zero exit fails |
//! | `stdout` / `stderr` | Match captured output (substring, regex, partial JSON) |
//! | `file` | Check a file exists, optionally matching its content |
//! | `code` | Check the exit code (re-checked after the process closes) |
//! | `cwd` / `env` | Change the directory/environment of later processes |
//! | `tmpdir` | Switch to a temporary directory owned by the chain |
//! | `mkdir` / `rm` | Create/remove paths |
//! | `tap` / `expect` | Run a closure / an assertion over the context |
//! | `sleep` / `time` | Pause; measure elapsed time |
//!
//! # Environment
//!
//! - `EMX_CLITEST_DEBUG=1` - echo output of every process
//! - `EMX_CLITEST_RUNTIME` - runtime used by `fork` (default `node`)

mod assert;
mod chain;
mod context;
mod error;
mod launch;
mod options;
mod output;
mod parser;
mod process;
mod steps;

pub use assert::{
    compile_regex, does_not_match_file, does_not_match_rule, is_match, match_file, match_rule, Rule,
};
pub use chain::{BoxedStep, ChainRunner, Position, Step};
pub use context::RunnerContext;
pub use error::{ChainError, Comparison, ErrorKind};
pub use launch::{LaunchSpec, Launched, Launcher, OsLauncher, ProcessControl, ProcessEvent};
pub use options::{ProcessOptions, RuntimeArgs, Settings, DEFAULT_RUNTIME};
pub use output::{strip_ansi, strip_final_newline, EOL};
pub use parser::{display_command, split_command, ParseError};
pub use process::{
    Lifecycle, ProcessHandle, ProcessKind, ProcessResult, Transcript, WaitFor, LAUNCH_FAILURE_CODE,
};

/// Start a new chain in the current directory.
pub fn runner() -> ChainRunner {
    ChainRunner::new()
}
