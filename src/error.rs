//! Chain errors

use std::fmt;
use std::panic::Location;

/// The kind of chain error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An assertion did not hold
    Assertion,
    /// A builder or handle was given invalid input
    Validation,
    /// The process closed before a `wait` condition was met
    WaitClosed,
    /// The process handle has not been started
    NotRunning,
    /// A command expected to succeed exited non-zero
    CommandFailed,
    /// Command string, regex or JSON could not be parsed
    Parse,
    /// IO error
    Io,
    /// Other error
    Other,
}

/// Comparison metadata carried by assertion failures, for diff reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub operator: String,
    pub actual: String,
    pub expected: String,
}

/// A chain error with step and caller context
#[derive(Debug)]
pub struct ChainError {
    pub kind: ErrorKind,
    pub message: String,
    /// Name of the step that failed
    pub step: Option<String>,
    /// Where the failing step was attached, in the caller's code
    pub location: Option<&'static Location<'static>>,
    pub comparison: Option<Comparison>,
    /// Execution log of the chain up to the failure
    pub log: Option<String>,
}

impl ChainError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step: None,
            location: None,
            comparison: None,
            log: None,
        }
    }

    pub fn assertion(
        message: impl Into<String>,
        operator: impl Into<String>,
        actual: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Assertion, message).with_comparison(Comparison {
            operator: operator.into(),
            actual: actual.into(),
            expected: expected.into(),
        })
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, msg)
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Attach the caller location, keeping one that is already set.
    pub fn with_location(mut self, location: &'static Location<'static>) -> Self {
        if self.location.is_none() {
            self.location = Some(location);
        }
        self
    }

    pub fn with_comparison(mut self, comparison: Comparison) -> Self {
        self.comparison = Some(comparison);
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    /// Prefix the message, e.g. with the file an assertion read.
    pub fn prefixed(mut self, prefix: &str) -> Self {
        self.message = format!("{}{}", prefix, self.message);
        self
    }

    pub fn is_assertion(&self) -> bool {
        self.kind == ErrorKind::Assertion
    }

    /// Unified diff of actual vs expected, when both are multi-line text.
    pub fn diff(&self) -> Option<String> {
        let cmp = self.comparison.as_ref()?;
        if !cmp.actual.contains('\n') && !cmp.expected.contains('\n') {
            return None;
        }
        let diff = similar::TextDiff::from_lines(&cmp.expected, &cmp.actual);
        Some(diff.unified_diff().header("expected", "actual").to_string())
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(loc) = self.location {
            write!(f, "{}:{}: ", loc.file(), loc.line())?;
        }
        if let Some(ref step) = self.step {
            write!(f, "{}: ", step)?;
        }
        write!(f, "{}", self.message)?;

        if f.alternate() {
            if let Some(ref cmp) = self.comparison {
                write!(f, "\n  operator: {}", cmp.operator)?;
                match self.diff() {
                    Some(diff) => write!(f, "\n{}", diff)?,
                    None => {
                        write!(f, "\n  actual:   {:?}", cmp.actual)?;
                        write!(f, "\n  expected: {:?}", cmp.expected)?;
                    }
                }
            }
            if let Some(ref log) = self.log {
                write!(f, "\n--- log ---\n{}", log.trim_end())?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}
