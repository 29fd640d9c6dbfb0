//! Process handle
//!
//! A `ProcessHandle` owns one external process: its options, its captured
//! output and its event surface. Output is folded into a `Transcript`, a
//! small state machine (`Pending → Running → Exited → Closed`) that is the
//! only writer of the `ProcessResult`.
//!
//! ```text
//! spawn ──start()──▶ Running ──Exit──▶ Exited ──Close──▶ Closed
//!                       │                                  ▲
//!                       └───────── launch failure ─────────┘
//! ```

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use regex::Regex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::assert::{compile_regex, Rule};
use crate::error::{ChainError, ErrorKind};
use crate::launch::{LaunchSpec, Launcher, OsLauncher, ProcessControl};
use crate::options::{ProcessOptions, DEFAULT_RUNTIME};
use crate::output::{clean_chunk, stdin_line, strip_final_newline};
use crate::parser::{display_command, split_command};

pub use crate::launch::ProcessEvent;

/// Exit code recorded when a process cannot be launched at all.
pub const LAUNCH_FAILURE_CODE: i32 = 127;

const EVENT_CAPACITY: usize = 1024;

/// How a process is launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// Run a command line directly
    Spawn,
    /// Host a module in a runtime, with a message channel
    Fork,
}

/// Captured outcome of a process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// `None` until the process exits
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Lifecycle of a process handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    #[default]
    Pending,
    Running,
    /// Exit code known; streams may still be flushing
    Exited,
    /// Streams drained; the result is final
    Closed,
}

/// State machine over process events.
#[derive(Debug, Default)]
pub struct Transcript {
    state: Lifecycle,
    result: ProcessResult,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn result(&self) -> &ProcessResult {
        &self.result
    }

    /// `Pending → Running`.
    pub fn begin(&mut self) -> Result<(), ChainError> {
        if self.state != Lifecycle::Pending {
            return Err(ChainError::validation("process has already been started"));
        }
        self.state = Lifecycle::Running;
        Ok(())
    }

    /// `Running → Closed` with the launch failure recorded in the result.
    pub fn launch_failed(&mut self, message: &str) {
        self.result.code = Some(LAUNCH_FAILURE_CODE);
        self.result.stderr.push_str(message);
        self.state = Lifecycle::Closed;
    }

    /// Apply one event. Returns false when the event was ignored.
    pub fn apply(&mut self, event: &ProcessEvent) -> bool {
        if matches!(self.state, Lifecycle::Pending | Lifecycle::Closed) {
            return false;
        }
        match event {
            ProcessEvent::Stdout(chunk) => self.result.stdout.push_str(&clean_chunk(chunk)),
            ProcessEvent::Stderr(chunk) => self.result.stderr.push_str(&clean_chunk(chunk)),
            ProcessEvent::Message(_) => {}
            ProcessEvent::Exit(code) => {
                if self.result.code.is_some() {
                    return false;
                }
                self.result.code = Some(*code);
                self.state = Lifecycle::Exited;
            }
            ProcessEvent::Close => self.state = Lifecycle::Closed,
        }
        true
    }
}

/// A condition to wait for
#[derive(Debug, Clone)]
pub enum WaitFor {
    /// Accumulated stdout matches
    Stdout(Regex),
    /// Accumulated stderr matches
    Stderr(Regex),
    /// Next message, optionally filtered
    Message(Option<Rule>),
    Exit,
    Close,
}

impl WaitFor {
    pub fn stdout(pattern: &str) -> Result<Self, ChainError> {
        compile_regex(pattern).map(WaitFor::Stdout)
    }

    pub fn stderr(pattern: &str) -> Result<Self, ChainError> {
        compile_regex(pattern).map(WaitFor::Stderr)
    }

    /// The event kind name (`stdout`, `stderr`, `message`, `exit`, `close`).
    pub fn kind(&self) -> &'static str {
        match self {
            WaitFor::Stdout(_) => "stdout",
            WaitFor::Stderr(_) => "stderr",
            WaitFor::Message(_) => "message",
            WaitFor::Exit => "exit",
            WaitFor::Close => "close",
        }
    }
}

impl fmt::Display for WaitFor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitFor::Stdout(re) | WaitFor::Stderr(re) => write!(f, "{} /{}/", self.kind(), re.as_str()),
            WaitFor::Message(Some(rule)) => write!(f, "message {}", rule),
            _ => f.write_str(self.kind()),
        }
    }
}

struct Shared {
    transcript: Mutex<Transcript>,
    events: broadcast::Sender<ProcessEvent>,
    debug: AtomicBool,
}

impl Shared {
    fn transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns one external process and its captured output/exit state.
pub struct ProcessHandle {
    kind: ProcessKind,
    command: String,
    args: Vec<String>,
    options: ProcessOptions,
    shared: Arc<Shared>,
    control: Option<Box<dyn ProcessControl>>,
    launcher: Arc<dyn Launcher>,
    pid: Option<u32>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("kind", &self.kind)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("state", &self.state())
            .field("pid", &self.pid)
            .finish()
    }
}

impl ProcessHandle {
    /// Create a handle. The process is not started until `start()`.
    pub fn new(
        kind: ProcessKind,
        command: impl Into<String>,
        args: Vec<String>,
        options: ProcessOptions,
    ) -> Result<Self, ChainError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(ChainError::validation("`command` is required"));
        }
        options.validate(kind)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            kind,
            command,
            args,
            options,
            shared: Arc::new(Shared {
                transcript: Mutex::new(Transcript::new()),
                events,
                debug: AtomicBool::new(false),
            }),
            control: None,
            launcher: Arc::new(OsLauncher),
            pid: None,
        })
    }

    /// Use a different process source (tests inject a fake).
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> Lifecycle {
        self.shared.transcript().state()
    }

    /// Snapshot of the captured result.
    pub fn result(&self) -> ProcessResult {
        self.shared.transcript().result().clone()
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.shared.debug.load(Ordering::Relaxed)
    }

    /// Subscribe to the events applied from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.shared.events.subscribe()
    }

    /// Set an environment variable for the process. Only meaningful before `start()`.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory. Only meaningful before `start()`.
    pub fn cwd(&mut self, cwd: impl Into<PathBuf>) -> &mut Self {
        self.options.cwd = Some(cwd.into());
        self
    }

    /// Echo captured chunks to the console. The stored result is unaffected.
    pub fn debug(&mut self) -> &mut Self {
        self.shared.debug.store(true, Ordering::Relaxed);
        self
    }

    /// Program and arguments as they will be launched.
    pub fn launch_spec(&self) -> Result<LaunchSpec, ChainError> {
        let (program, args) = match self.kind {
            ProcessKind::Spawn if self.args.is_empty() => {
                let mut words = split_command(&self.command)?;
                if words.is_empty() {
                    return Err(ChainError::validation("`command` is required"));
                }
                let program = words.remove(0);
                (program, words)
            }
            ProcessKind::Spawn => (self.command.clone(), self.args.clone()),
            ProcessKind::Fork => {
                let runtime = self.options.runtime.clone().unwrap_or_else(|| DEFAULT_RUNTIME.to_string());
                let mut args = self.options.runtime_args.args().to_vec();
                args.push(self.command.clone());
                args.extend(self.args.iter().cloned());
                (runtime, args)
            }
        };
        let cwd = match self.options.cwd {
            Some(ref cwd) => cwd.clone(),
            None => std::env::current_dir()?,
        };
        Ok(LaunchSpec {
            kind: self.kind,
            program,
            args,
            cwd,
            env: self.options.env.clone(),
            prefer_local: self.options.prefer_local,
        })
    }

    /// Launch the process and start folding its events into the result.
    ///
    /// A process that cannot be launched is not an error: the result gets
    /// code 127 and the failure text on stderr. Must be called inside a
    /// tokio runtime.
    pub fn start(&mut self) -> Result<&mut Self, ChainError> {
        let spec = self.launch_spec()?;
        self.shared.transcript().begin()?;

        match self.launcher.launch(&spec) {
            Ok(launched) => {
                self.pid = launched.pid;
                self.control = Some(launched.control);
                tokio::spawn(fold_events(Arc::clone(&self.shared), launched.events));
            }
            Err(e) => {
                let message = format!(
                    "Command failed to start: {}: {}",
                    display_command(&spec.program, &spec.args),
                    e
                );
                debug!(program = %spec.program, error = %e, "launch failed");
                self.shared.transcript().launch_failed(&message);
                if self.is_debug_enabled() {
                    eprintln!("{}", message);
                }
                let _ = self.shared.events.send(ProcessEvent::Exit(LAUNCH_FAILURE_CODE));
                let _ = self.shared.events.send(ProcessEvent::Close);
            }
        }
        Ok(self)
    }

    fn control(&self) -> Result<Option<&dyn ProcessControl>, ChainError> {
        match (&self.control, self.state()) {
            (_, Lifecycle::Pending) => Err(ChainError::new(
                ErrorKind::NotRunning,
                format!("process `{}` has not been started", self.command),
            )),
            (Some(control), _) => Ok(Some(control.as_ref())),
            // launch failed; nothing to control
            (None, _) => Ok(None),
        }
    }

    /// Write one line to stdin: a single trailing line terminator is
    /// replaced by exactly one platform terminator. Does not wait.
    pub fn write(&self, data: &str) -> Result<(), ChainError> {
        if let Some(control) = self.control()? {
            control.write(stdin_line(data))?;
        }
        Ok(())
    }

    /// Send a signal (default `SIGTERM`). Does not wait for exit.
    pub fn kill(&self, signal: Option<&str>) -> Result<(), ChainError> {
        if let Some(control) = self.control()? {
            control.kill(signal).map_err(|e| match e.kind() {
                std::io::ErrorKind::InvalidInput => ChainError::validation(e.to_string()),
                _ => ChainError::from(e),
            })?;
        }
        Ok(())
    }

    /// Suspend until `cond` holds.
    ///
    /// Resolves with the message for `WaitFor::Message`, `None` otherwise.
    /// Stdout/stderr/message waits fail with `WaitClosed` when the process
    /// closes first.
    pub async fn wait(&self, cond: &WaitFor) -> Result<Option<Value>, ChainError> {
        let mut rx = self.subscribe();
        if let Some(done) = self.check_now(cond)? {
            return Ok(done);
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(done) = self.check_event(cond, &event)? {
                        return Ok(done);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "wait lagged behind events");
                    if let Some(done) = self.check_now(cond)? {
                        return Ok(done);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Err(premature_close(cond)),
            }
        }
    }

    /// Check the accumulated state before suspending.
    fn check_now(&self, cond: &WaitFor) -> Result<Option<Option<Value>>, ChainError> {
        let t = self.shared.transcript();
        let state = t.state();
        if state == Lifecycle::Pending {
            return Err(ChainError::new(
                ErrorKind::NotRunning,
                format!("cannot wait for {}: process has not been started", cond.kind()),
            ));
        }
        let buffer = match cond {
            WaitFor::Stdout(re) => Some((re, &t.result().stdout)),
            WaitFor::Stderr(re) => Some((re, &t.result().stderr)),
            _ => None,
        };
        if let Some((re, text)) = buffer {
            if re.is_match(text) {
                return Ok(Some(None));
            }
        }
        match cond {
            WaitFor::Exit if state >= Lifecycle::Exited => Ok(Some(None)),
            WaitFor::Close if state == Lifecycle::Closed => Ok(Some(None)),
            WaitFor::Stdout(_) | WaitFor::Stderr(_) | WaitFor::Message(_) if state == Lifecycle::Closed => {
                Err(premature_close(cond))
            }
            _ => Ok(None),
        }
    }

    fn check_event(&self, cond: &WaitFor, event: &ProcessEvent) -> Result<Option<Option<Value>>, ChainError> {
        match (cond, event) {
            (WaitFor::Stdout(_), ProcessEvent::Stdout(_))
            | (WaitFor::Stderr(_), ProcessEvent::Stderr(_))
            | (_, ProcessEvent::Close) => self.check_now(cond),
            (WaitFor::Message(rule), ProcessEvent::Message(value)) => {
                let wanted = rule.as_ref().map_or(true, |r| r.matches_value(value));
                Ok(wanted.then(|| Some(value.clone())))
            }
            (WaitFor::Exit, ProcessEvent::Exit(_)) => Ok(Some(None)),
            _ => Ok(None),
        }
    }

    /// Wait until the process has fully closed and return its final result.
    pub async fn end(&self) -> Result<ProcessResult, ChainError> {
        self.wait(&WaitFor::Close).await?;
        Ok(self.result())
    }

    /// `end()`, failing with `CommandFailed` on a non-zero exit when the
    /// handle was created with `reject_on_failure`.
    pub async fn end_checked(&self) -> Result<ProcessResult, ChainError> {
        let result = self.end().await?;
        if self.options.reject_on_failure && result.code != Some(0) {
            let code = result.code.map_or("none".to_string(), |c| c.to_string());
            let mut message = format!("`{}` exited with code {}", self.command, code);
            if !result.stderr.is_empty() {
                message.push_str(&format!(": {}", result.stderr));
            }
            return Err(ChainError::new(ErrorKind::CommandFailed, message));
        }
        Ok(result)
    }
}

fn premature_close(cond: &WaitFor) -> ChainError {
    ChainError::new(
        ErrorKind::WaitClosed,
        format!("process closed before {} was satisfied", cond),
    )
}

/// Apply launcher events to the transcript, then publish them.
async fn fold_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        if !shared.transcript().apply(&event) {
            continue;
        }
        if shared.debug.load(Ordering::Relaxed) {
            echo(&event, &mut std::io::stdout(), &mut std::io::stderr());
        }
        let _ = shared.events.send(event);
    }
    // the source went away without closing; close on its behalf
    if shared.transcript().apply(&ProcessEvent::Close) {
        let _ = shared.events.send(ProcessEvent::Close);
    }
}

/// Print a chunk as received, ANSI codes intact.
fn echo(event: &ProcessEvent, out: &mut impl Write, err: &mut impl Write) {
    let written = match event {
        ProcessEvent::Stdout(chunk) => writeln!(out, "{}", strip_final_newline(chunk)),
        ProcessEvent::Stderr(chunk) => writeln!(err, "{}", strip_final_newline(chunk)),
        _ => Ok(()),
    };
    if let Err(e) = written {
        debug!(error = %e, "debug echo failed");
    }
}
