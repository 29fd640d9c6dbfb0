//! Assertion steps: expect, stdout/stderr, file, code

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::assert::{does_not_match_file_labeled, does_not_match_rule, match_file_labeled, match_rule, Rule};
use crate::chain::Step;
use crate::context::RunnerContext;
use crate::error::ChainError;

type Check = Box<dyn Fn(&RunnerContext) -> Result<(), ChainError> + Send + Sync>;

// ──────────────────────────────────────────────────────────
// expect — user assertion over the context
// ──────────────────────────────────────────────────────────

pub(crate) struct ExpectStep {
    name: String,
    check: Check,
}

impl ExpectStep {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&RunnerContext) -> Result<(), ChainError> + Send + Sync + 'static,
    {
        Self { name: name.into(), check: Box::new(check) }
    }
}

#[async_trait]
impl Step for ExpectStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        (self.check)(ctx)
    }
}

// ──────────────────────────────────────────────────────────
// stdout / stderr — match captured output
// ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

pub(crate) struct OutputStep {
    pub stream: Stream,
    pub rule: Rule,
    pub negate: bool,
}

#[async_trait]
impl Step for OutputStep {
    fn name(&self) -> &str {
        match (self.stream, self.negate) {
            (Stream::Stdout, false) => "stdout",
            (Stream::Stdout, true) => "not_stdout",
            (Stream::Stderr, false) => "stderr",
            (Stream::Stderr, true) => "not_stderr",
        }
    }

    fn describe(&self) -> String {
        format!("{} {}", self.name(), self.rule)
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let actual = match self.stream {
            Stream::Stdout => &ctx.result.stdout,
            Stream::Stderr => &ctx.result.stderr,
        };
        if self.negate {
            does_not_match_rule(actual, &self.rule)
        } else {
            match_rule(actual, &self.rule)
        }
    }
}

// ──────────────────────────────────────────────────────────
// file / not_file — check files relative to cwd
// ──────────────────────────────────────────────────────────

pub(crate) struct FileStep {
    pub path: PathBuf,
    pub rule: Option<Rule>,
    pub negate: bool,
}

#[async_trait]
impl Step for FileStep {
    fn name(&self) -> &str {
        if self.negate {
            "not_file"
        } else {
            "file"
        }
    }

    fn describe(&self) -> String {
        match self.rule {
            Some(ref rule) => format!("{} {} {}", self.name(), self.path.display(), rule),
            None => format!("{} {}", self.name(), self.path.display()),
        }
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let full = ctx.resolve(&self.path);
        let label = self.path.display().to_string();
        if self.negate {
            does_not_match_file_labeled(&full, &label, self.rule.as_ref()).await
        } else {
            match_file_labeled(&full, &label, self.rule.as_ref()).await
        }
    }
}

// ──────────────────────────────────────────────────────────
// code — check the exit code
// ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub(crate) enum CodeCheck {
    Equals(i32),
    With(Arc<dyn Fn(i32) -> Result<(), ChainError> + Send + Sync>),
}

impl CodeCheck {
    fn check(&self, code: Option<i32>) -> Result<(), ChainError> {
        match (self, code) {
            (CodeCheck::Equals(expected), Some(code)) if code == *expected => Ok(()),
            (CodeCheck::Equals(expected), Some(code)) => Err(ChainError::assertion(
                format!("Expected exitCode to be {} but got {}", expected, code),
                "strictEqual",
                code.to_string(),
                expected.to_string(),
            )),
            (CodeCheck::Equals(expected), None) => Err(ChainError::assertion(
                format!("Expected exitCode to be {} but the process never exited", expected),
                "strictEqual",
                "null",
                expected.to_string(),
            )),
            (CodeCheck::With(f), Some(code)) => f(code),
            (CodeCheck::With(_), None) => Err(ChainError::assertion(
                "Expected the process to exit but it never reported an exit code",
                "exits",
                "null",
                "exit code",
            )),
        }
    }
}

/// The main-queue check is lenient (skipped until an exit code exists);
/// the end-slot check is strict.
pub(crate) struct CodeStep {
    pub check: CodeCheck,
    pub strict: bool,
}

#[async_trait]
impl Step for CodeStep {
    fn name(&self) -> &str {
        "code"
    }

    fn describe(&self) -> String {
        match self.check {
            CodeCheck::Equals(n) => format!("code {}", n),
            CodeCheck::With(_) => "code <predicate>".to_string(),
        }
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let code = ctx.result.code;
        if code.is_none() && !self.strict {
            debug!("no exit code yet; deferring to the end check");
            ctx.logf("[no exit code yet]");
            return Ok(());
        }
        self.check.check(code)
    }
}
