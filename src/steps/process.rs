//! Process steps: spawn/fork, wait, write, kill, shell

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::chain::Step;
use crate::context::RunnerContext;
use crate::error::ChainError;
use crate::options::ProcessOptions;
use crate::parser::{display_command, quote_arg};
use crate::process::{ProcessHandle, ProcessKind, WaitFor};

// ──────────────────────────────────────────────────────────
// spawn / fork — start the active process
// ──────────────────────────────────────────────────────────

pub(crate) struct SpawnStep {
    pub kind: ProcessKind,
    pub command: String,
    pub args: Vec<String>,
    pub options: ProcessOptions,
}

impl SpawnStep {
    /// Options with the chain's cwd, env and runtime filled in.
    fn effective_options(&self, ctx: &RunnerContext) -> ProcessOptions {
        let mut options = self.options.clone();
        for (key, value) in &ctx.env {
            options.env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        options.cwd = Some(match options.cwd.take() {
            Some(dir) => ctx.resolve(dir),
            None => ctx.cwd.clone(),
        });
        if self.kind == ProcessKind::Fork && options.runtime.is_none() {
            options.runtime = Some(ctx.settings.runtime.clone());
        }
        options
    }
}

#[async_trait]
impl Step for SpawnStep {
    fn name(&self) -> &str {
        match self.kind {
            ProcessKind::Spawn => "spawn",
            ProcessKind::Fork => "fork",
        }
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            format!("{} {}", self.name(), self.command)
        } else {
            format!("{} {}", self.name(), display_command(&self.command, &self.args))
        }
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let options = self.effective_options(ctx);
        let mut handle = ProcessHandle::new(self.kind, self.command.clone(), self.args.clone(), options)?
            .with_launcher(Arc::clone(&ctx.launcher));
        if ctx.debug {
            handle.debug();
        }
        handle.start()?;
        if let Some(pid) = handle.pid() {
            ctx.logf(&format!("[pid {}]", pid));
        }
        ctx.install(handle);
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// wait — suspend until the active process reaches a condition
// ──────────────────────────────────────────────────────────

pub(crate) struct WaitStep(pub WaitFor);

#[async_trait]
impl Step for WaitStep {
    fn name(&self) -> &str {
        "wait"
    }

    fn describe(&self) -> String {
        format!("wait {}", self.0)
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let message = ctx.active()?.wait(&self.0).await?;
        if let Some(message) = message {
            ctx.logf(&format!("[message] {}", message));
            ctx.last_message = Some(message);
        }
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────
// write — send one line to stdin
// ──────────────────────────────────────────────────────────

pub(crate) struct WriteStep(pub String);

#[async_trait]
impl Step for WriteStep {
    fn name(&self) -> &str {
        "write"
    }

    fn describe(&self) -> String {
        format!("write {}", quote_arg(self.0.trim_end_matches(['\r', '\n'])))
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        ctx.active()?.write(&self.0)
    }
}

// ──────────────────────────────────────────────────────────
// kill — signal the active process
// ──────────────────────────────────────────────────────────

pub(crate) struct KillStep(pub Option<String>);

#[async_trait]
impl Step for KillStep {
    fn name(&self) -> &str {
        "kill"
    }

    fn describe(&self) -> String {
        match self.0 {
            Some(ref signal) => format!("kill {}", signal),
            None => "kill".to_string(),
        }
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        ctx.active()?.kill(self.0.as_deref())
    }
}

// ──────────────────────────────────────────────────────────
// shell — run a command to completion, outside the active process
// ──────────────────────────────────────────────────────────

pub(crate) struct ShellStep(pub String);

#[cfg(unix)]
fn shell_command(line: &str) -> (&'static str, Vec<String>) {
    ("sh", vec!["-c".to_string(), line.to_string()])
}

#[cfg(windows)]
fn shell_command(line: &str) -> (&'static str, Vec<String>) {
    ("cmd", vec!["/C".to_string(), line.to_string()])
}

#[async_trait]
impl Step for ShellStep {
    fn name(&self) -> &str {
        "shell"
    }

    fn describe(&self) -> String {
        format!("shell {}", self.0)
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError> {
        let (program, args) = shell_command(&self.0);
        let mut options = ProcessOptions::new().cwd(ctx.cwd.clone()).reject_on_failure(true);
        options.env = ctx.env.clone();

        let mut handle = ProcessHandle::new(ProcessKind::Spawn, program, args, options)?
            .with_launcher(Arc::clone(&ctx.launcher));
        if ctx.debug {
            handle.debug();
        }
        handle.start()?;
        let result = handle.end_checked().await?;
        debug!(command = %self.0, code = ?result.code, "shell finished");

        if !result.stdout.is_empty() {
            ctx.logf(&format!("[stdout]\n{}", result.stdout));
        }
        if !result.stderr.is_empty() {
            ctx.logf(&format!("[stderr]\n{}", result.stderr));
        }
        Ok(())
    }
}
