//! Chain runner
//!
//! A `ChainRunner` is an ordered list of steps over one `RunnerContext`.
//! Builder calls only queue steps; nothing runs until the runner is
//! awaited, and then steps run strictly one after another in the order
//! they were attached. The first failing step aborts the chain.
//!
//! A `spawn`/`fork` that is never interacted with (no `wait`, `write` or
//! `kill` before the next process step) waits for its process to close,
//! so the assertions after it see the complete output.
//!
//! Besides the main queue there is one reserved end slot, run after the
//! main queue has settled and the active process has closed. `code()`
//! uses it to re-check the exit code once it is guaranteed to be known.

use std::future::{Future, IntoFuture};
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info_span, Instrument};

use crate::assert::{compile_regex, Rule};
use crate::context::RunnerContext;
use crate::error::ChainError;
use crate::launch::Launcher;
use crate::options::{ProcessOptions, Settings};
use crate::parser::split_command;
use crate::process::{ProcessKind, WaitFor};
use crate::steps::{
    CodeCheck, CodeStep, CwdStep, DebugStep, EnvStep, ExpectStep, FileStep, KillStep, MkdirStep,
    OutputStep, RmStep, ShellStep, SleepStep, SpawnStep, Stream, TapStep, TimeEndStep, TimeStep,
    TmpdirStep, WaitStep, WriteStep,
};

/// One asynchronous unit of work in a chain
#[async_trait]
pub trait Step: Send + Sync {
    /// Short name used in errors (`spawn`, `stdout`, ...)
    fn name(&self) -> &str;

    /// Log line for this step; defaults to the name
    fn describe(&self) -> String {
        self.name().to_string()
    }

    async fn run(&self, ctx: &mut RunnerContext) -> Result<(), ChainError>;
}

/// Boxed step
pub type BoxedStep = Box<dyn Step>;

/// Where a step is queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Position {
    /// End of the main queue
    #[default]
    Main,
    /// The reserved end slot; a later step replaces an earlier one
    End,
}

struct Entry {
    step: BoxedStep,
    location: &'static Location<'static>,
    /// Wait for the active process to close after this step
    settle: bool,
}

/// An ordered, awaitable sequence of steps over a shared context.
pub struct ChainRunner {
    steps: Vec<Entry>,
    end: Option<Entry>,
    /// Latest process step, until something interacts with it
    open_spawn: Option<usize>,
    ctx: RunnerContext,
}

impl Default for ChainRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChainRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.steps.iter().map(|e| e.step.describe()).collect();
        f.debug_struct("ChainRunner")
            .field("steps", &names)
            .field("end", &self.end.as_ref().map(|e| e.step.describe()))
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl ChainRunner {
    /// Create an empty chain rooted at the current directory, with
    /// settings from the environment.
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::with_context(RunnerContext::new(cwd, Settings::from_env()))
    }

    /// Create an empty chain over an existing context.
    pub fn with_context(ctx: RunnerContext) -> Self {
        Self {
            steps: Vec::new(),
            end: None,
            open_spawn: None,
            ctx,
        }
    }

    /// Use a different process source for every process of this chain.
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.ctx.launcher = launcher;
        self
    }

    /// Number of steps in the main queue
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.end.is_none()
    }

    /// Queue a step in the main queue or install it in the end slot.
    #[track_caller]
    pub fn add_step(mut self, step: impl Step + 'static, position: Position) -> Self {
        let entry = Entry {
            step: Box::new(step),
            location: Location::caller(),
            settle: false,
        };
        match position {
            Position::Main => self.steps.push(entry),
            Position::End => self.end = Some(entry),
        }
        self
    }

    /// Queue a user-defined step.
    #[track_caller]
    pub fn step(self, step: impl Step + 'static) -> Self {
        self.add_step(step, Position::Main)
    }

    /// Queue an assertion over the context. A failure is reported at the
    /// location of this call, with its comparison kept intact.
    ///
    /// The check is synchronous. A check that needs to await (reading a
    /// socket, polling a server) is written as a [`Step`] and queued with
    /// [`step`](Self::step); its failures are annotated the same way.
    #[track_caller]
    pub fn expect<F>(self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&RunnerContext) -> Result<(), ChainError> + Send + Sync + 'static,
    {
        self.step(ExpectStep::new(name, check))
    }

    // ──────────────────────────────────────────────────────────
    // processes
    // ──────────────────────────────────────────────────────────

    /// Run a command line (`"tool --flag 'quoted arg'"`) as the active process.
    ///
    /// # Panics
    ///
    /// Panics if the command line is empty or has unbalanced quotes.
    #[track_caller]
    pub fn spawn(self, command: impl Into<String>) -> Self {
        self.spawn_with(command, Vec::<String>::new(), ProcessOptions::default())
    }

    /// Run `command` with explicit arguments and options. With a non-empty
    /// `args`, `command` is the program and is not split.
    ///
    /// # Panics
    ///
    /// Panics if the command is empty or the options are invalid for spawn.
    #[track_caller]
    pub fn spawn_with<I, S>(self, command: impl Into<String>, args: I, options: ProcessOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let step = process_step(ProcessKind::Spawn, command.into(), args, options);
        self.process(step)
    }

    /// Host `module` in the runtime as the active process, with a message channel.
    #[track_caller]
    pub fn fork(self, module: impl Into<String>) -> Self {
        self.fork_with(module, Vec::<String>::new(), ProcessOptions::default())
    }

    /// # Panics
    ///
    /// Panics if `module` is empty or both runtime flag forms are given.
    #[track_caller]
    pub fn fork_with<I, S>(self, module: impl Into<String>, args: I, options: ProcessOptions) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let step = process_step(ProcessKind::Fork, module.into(), args, options);
        self.process(step)
    }

    #[track_caller]
    fn process(mut self, step: SpawnStep) -> Self {
        self = self.step(step);
        let index = self.steps.len() - 1;
        self.steps[index].settle = true;
        self.open_spawn = Some(index);
        self
    }

    /// The latest process is interacted with; it no longer waits for close.
    #[track_caller]
    fn interact(mut self, step: impl Step + 'static) -> Self {
        if let Some(index) = self.open_spawn.take() {
            self.steps[index].settle = false;
        }
        self.step(step)
    }

    /// Wait on the active process.
    #[track_caller]
    pub fn wait(self, cond: WaitFor) -> Self {
        self.interact(WaitStep(cond))
    }

    /// Wait until accumulated stdout matches `pattern`.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regex.
    #[track_caller]
    pub fn wait_stdout(self, pattern: &str) -> Self {
        self.wait(WaitFor::Stdout(pattern_or_panic(pattern)))
    }

    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regex.
    #[track_caller]
    pub fn wait_stderr(self, pattern: &str) -> Self {
        self.wait(WaitFor::Stderr(pattern_or_panic(pattern)))
    }

    /// Wait for the next message (matching `rule`, when given). The
    /// message is kept in `RunnerContext::last_message`.
    #[track_caller]
    pub fn wait_message(self, rule: Option<Rule>) -> Self {
        self.wait(WaitFor::Message(rule))
    }

    #[track_caller]
    pub fn wait_exit(self) -> Self {
        self.wait(WaitFor::Exit)
    }

    #[track_caller]
    pub fn wait_close(self) -> Self {
        self.wait(WaitFor::Close)
    }

    /// Write one line to the active process's stdin.
    #[track_caller]
    pub fn write(self, data: impl Into<String>) -> Self {
        self.interact(WriteStep(data.into()))
    }

    /// Send `SIGTERM` to the active process.
    #[track_caller]
    pub fn kill(self) -> Self {
        self.interact(KillStep(None))
    }

    /// Send a named signal (`SIGINT`, `hup`, `9`) to the active process.
    #[track_caller]
    pub fn kill_with(self, signal: impl Into<String>) -> Self {
        self.interact(KillStep(Some(signal.into())))
    }

    /// Run a shell command to completion without touching the active
    /// process. A non-zero exit fails the chain.
    ///
    /// # Panics
    ///
    /// Panics if `command` is empty.
    #[track_caller]
    pub fn shell(self, command: impl Into<String>) -> Self {
        let command = command.into();
        require(!command.trim().is_empty(), "command");
        self.step(ShellStep(command))
    }

    // ──────────────────────────────────────────────────────────
    // context
    // ──────────────────────────────────────────────────────────

    /// Change the working directory (relative to the current one).
    #[track_caller]
    pub fn cwd(self, path: impl Into<PathBuf>) -> Self {
        self.step(CwdStep(path.into()))
    }

    /// Set an environment variable for processes started after this step.
    #[track_caller]
    pub fn env(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.step(EnvStep(key.into(), value.into()))
    }

    /// Echo output of the active process and every later one.
    #[track_caller]
    pub fn debug(self) -> Self {
        self.step(DebugStep)
    }

    /// Create a temporary directory, owned by the chain, and switch to it.
    #[track_caller]
    pub fn tmpdir(self) -> Self {
        self.step(TmpdirStep)
    }

    /// # Panics
    ///
    /// Panics if `path` is empty.
    #[track_caller]
    pub fn mkdir(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        require(!path.as_os_str().is_empty(), "path");
        self.step(MkdirStep(path))
    }

    /// Remove a file or a directory tree. A missing path is not an error.
    ///
    /// # Panics
    ///
    /// Panics if `path` is empty.
    #[track_caller]
    pub fn rm(self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        require(!path.as_os_str().is_empty(), "path");
        self.step(RmStep(path))
    }

    /// Run a closure against the context.
    #[track_caller]
    pub fn tap<F>(self, f: F) -> Self
    where
        F: Fn(&mut RunnerContext) + Send + Sync + 'static,
    {
        self.step(TapStep(Box::new(f)))
    }

    #[track_caller]
    pub fn sleep(self, duration: Duration) -> Self {
        self.step(SleepStep(duration))
    }

    /// Start a timer under `label`.
    #[track_caller]
    pub fn time(self, label: impl Into<String>) -> Self {
        self.step(TimeStep(label.into()))
    }

    /// Stop the timer `label` and hand the elapsed time to `f`.
    #[track_caller]
    pub fn time_end<F>(self, label: impl Into<String>, f: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.step(TimeEndStep(label.into(), Box::new(f)))
    }

    // ──────────────────────────────────────────────────────────
    // assertions
    // ──────────────────────────────────────────────────────────

    /// Assert that a file exists.
    ///
    /// # Panics
    ///
    /// Panics if `path` is empty.
    #[track_caller]
    pub fn file(self, path: impl AsRef<Path>) -> Self {
        self.file_step(path.as_ref(), None, false)
    }

    /// Assert that a file exists and its content matches `rule`.
    #[track_caller]
    pub fn file_matches(self, path: impl AsRef<Path>, rule: impl Into<Rule>) -> Self {
        self.file_step(path.as_ref(), Some(rule.into()), false)
    }

    /// Assert that a file does not exist.
    #[track_caller]
    pub fn not_file(self, path: impl AsRef<Path>) -> Self {
        self.file_step(path.as_ref(), None, true)
    }

    /// Assert that a file exists and its content does not match `rule`.
    #[track_caller]
    pub fn not_file_matches(self, path: impl AsRef<Path>, rule: impl Into<Rule>) -> Self {
        self.file_step(path.as_ref(), Some(rule.into()), true)
    }

    #[track_caller]
    fn file_step(self, path: &Path, rule: Option<Rule>, negate: bool) -> Self {
        require(!path.as_os_str().is_empty(), "path");
        self.step(FileStep { path: path.to_path_buf(), rule, negate })
    }

    /// Assert on stdout: a `&str` is a substring, a `Regex` a pattern,
    /// a JSON value a partial match.
    ///
    /// # Panics
    ///
    /// Panics if `expected` is empty.
    #[track_caller]
    pub fn stdout(self, expected: impl Into<Rule>) -> Self {
        self.output_step(Stream::Stdout, expected.into(), false)
    }

    #[track_caller]
    pub fn not_stdout(self, unexpected: impl Into<Rule>) -> Self {
        self.output_step(Stream::Stdout, unexpected.into(), true)
    }

    #[track_caller]
    pub fn stderr(self, expected: impl Into<Rule>) -> Self {
        self.output_step(Stream::Stderr, expected.into(), false)
    }

    #[track_caller]
    pub fn not_stderr(self, unexpected: impl Into<Rule>) -> Self {
        self.output_step(Stream::Stderr, unexpected.into(), true)
    }

    #[track_caller]
    fn output_step(self, stream: Stream, rule: Rule, negate: bool) -> Self {
        require(!rule.is_empty(), if negate { "unexpected" } else { "expected" });
        self.step(OutputStep { stream, rule, negate })
    }

    /// Assert the exit code.
    ///
    /// Checked twice: in place (skipped while the process has not exited
    /// yet) and again in the end slot once the process has closed.
    #[track_caller]
    pub fn code(self, expected: i32) -> Self {
        self.code_check(CodeCheck::Equals(expected))
    }

    /// Assert the exit code with a predicate, checked like `code`.
    #[track_caller]
    pub fn code_with<F>(self, check: F) -> Self
    where
        F: Fn(i32) -> Result<(), ChainError> + Send + Sync + 'static,
    {
        self.code_check(CodeCheck::With(Arc::new(check)))
    }

    #[track_caller]
    fn code_check(self, check: CodeCheck) -> Self {
        self.add_step(CodeStep { check: check.clone(), strict: false }, Position::Main)
            .add_step(CodeStep { check, strict: true }, Position::End)
    }

    // ──────────────────────────────────────────────────────────
    // execution
    // ──────────────────────────────────────────────────────────

    /// Run every step in order and return the final context.
    pub async fn run(self) -> Result<RunnerContext, ChainError> {
        let ChainRunner { steps, end, mut ctx, .. } = self;

        for entry in &steps {
            run_entry(&mut ctx, entry).await?;
        }

        if let Some(ref entry) = end {
            let closed = match ctx.proc {
                Some(ref proc) => {
                    debug!(command = %proc.command(), "waiting for close before end checks");
                    proc.end().await.map(|_| ())
                }
                None => Ok(()),
            };
            if let Err(e) = closed {
                return Err(annotate(&mut ctx, entry, e));
            }
            run_entry(&mut ctx, entry).await?;
        }

        ctx.refresh_result();
        Ok(ctx)
    }
}

impl IntoFuture for ChainRunner {
    type Output = Result<RunnerContext, ChainError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

async fn run_entry(ctx: &mut RunnerContext, entry: &Entry) -> Result<(), ChainError> {
    ctx.refresh_result();
    ctx.logf(&format!("> {}", entry.step.describe()));

    let span = info_span!("step", name = entry.step.name());
    let mut outcome = entry.step.run(ctx).instrument(span).await;
    if outcome.is_ok() && entry.settle {
        if let Some(ref proc) = ctx.proc {
            outcome = proc.end().await.map(|_| ());
        }
    }
    ctx.refresh_result();

    outcome.map_err(|e| annotate(ctx, entry, e))
}

fn annotate(ctx: &mut RunnerContext, entry: &Entry, err: ChainError) -> ChainError {
    ctx.logf(&format!("FAIL: {}", err.message));
    err.with_step(entry.step.name())
        .with_location(entry.location)
        .with_log(ctx.log.clone())
}

#[track_caller]
fn require(present: bool, what: &str) {
    if !present {
        panic!("`{}` is required", what);
    }
}

#[track_caller]
fn pattern_or_panic(pattern: &str) -> regex::Regex {
    match compile_regex(pattern) {
        Ok(re) => re,
        Err(e) => panic!("{}", e),
    }
}

#[track_caller]
fn process_step<I, S>(kind: ProcessKind, command: String, args: I, options: ProcessOptions) -> SpawnStep
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    require(!command.trim().is_empty(), "command");
    if let Err(e) = options.validate(kind) {
        panic!("{}", e);
    }
    if kind == ProcessKind::Spawn && args.is_empty() {
        if let Err(e) = split_command(&command) {
            panic!("invalid command string: {}", e);
        }
    }
    SpawnStep { kind, command, args, options }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::launch::ProcessEvent;
    use crate::process::testing::{settle, FakeLauncher};
    use std::sync::Mutex;

    struct Record(&'static str, Arc<Mutex<Vec<&'static str>>>);

    #[async_trait]
    impl Step for Record {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _ctx: &mut RunnerContext) -> Result<(), ChainError> {
            // later steps must not start before this one settles
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.1.lock().unwrap().push(self.0);
            Ok(())
        }
    }

    fn chain() -> ChainRunner {
        ChainRunner::with_context(RunnerContext::new(PathBuf::from("/work"), Settings::default()))
    }

    #[tokio::test]
    async fn test_steps_run_in_declaration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        chain()
            .step(Record("a", Arc::clone(&seen)))
            .add_step(Record("end", Arc::clone(&seen)), Position::End)
            .step(Record("b", Arc::clone(&seen)))
            .step(Record("c", Arc::clone(&seen)))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c", "end"]);
    }

    #[tokio::test]
    async fn test_end_slot_is_replaced() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        chain()
            .add_step(Record("first", Arc::clone(&seen)), Position::End)
            .add_step(Record("second", Arc::clone(&seen)), Position::End)
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["second"]);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_and_reports_location() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let before = line!();
        let err = chain()
            .step(Record("a", Arc::clone(&seen)))
            .expect("always fails", |_| Err(ChainError::assertion("nope", "strictEqual", "1", "2")))
            .step(Record("never", Arc::clone(&seen)))
            .await
            .unwrap_err();

        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
        assert_eq!(err.step.as_deref(), Some("always fails"));
        let location = err.location.unwrap();
        assert!(location.file().ends_with("chain.rs"));
        assert!(location.line() > before && location.line() <= before + 3);
        let cmp = err.comparison.as_ref().unwrap();
        assert_eq!(cmp.operator, "strictEqual");
        let log = err.log.as_deref().unwrap();
        assert!(log.contains("> a\n> always fails\nFAIL: nope"));
    }

    struct EventuallyFails;

    #[async_trait]
    impl Step for EventuallyFails {
        fn name(&self) -> &str {
            "port is open"
        }

        async fn run(&self, _ctx: &mut RunnerContext) -> Result<(), ChainError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err(ChainError::assertion("port 3000 closed", "strictEqual", "closed", "open"))
        }
    }

    #[tokio::test]
    async fn test_async_check_as_step_is_annotated() {
        let before = line!();
        let err = chain().tap(|_| {}).step(EventuallyFails).await.unwrap_err();

        assert_eq!(err.step.as_deref(), Some("port is open"));
        assert_eq!(err.location.unwrap().line(), before + 1);
        let cmp = err.comparison.as_ref().unwrap();
        assert_eq!((cmp.actual.as_str(), cmp.expected.as_str()), ("closed", "open"));
    }

    #[tokio::test]
    async fn test_context_is_shared_and_returned() {
        let ctx = chain()
            .tap(|ctx| ctx.set("n", 1u32))
            .tap(|ctx| {
                let n = *ctx.get::<u32>("n").unwrap();
                ctx.set("n", n + 1);
            })
            .expect("n is 2", |ctx| {
                match ctx.get::<u32>("n") {
                    Some(2) => Ok(()),
                    other => Err(ChainError::validation(format!("n = {:?}", other))),
                }
            })
            .await
            .unwrap();
        assert_eq!(ctx.get::<u32>("n"), Some(&2));
    }

    #[tokio::test]
    async fn test_code_skips_while_running_then_checks_at_end() {
        let launcher = Arc::new(FakeLauncher::default());
        let chain = chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("server --port 0")
            .wait_stdout("listening")
            .code(0);

        let task = tokio::spawn(chain.into_future());
        settle().await;
        let tx = launcher.sender(0);
        tx.send(ProcessEvent::Stdout("listening\n".into())).unwrap();
        settle().await;
        // main code check has run and skipped; the end check waits for close
        assert!(!task.is_finished());

        tx.send(ProcessEvent::Stdout("bye\n".into())).unwrap();
        tx.send(ProcessEvent::Exit(0)).unwrap();
        tx.send(ProcessEvent::Close).unwrap();

        let ctx = task.await.unwrap().unwrap();
        assert_eq!(ctx.result.code, Some(0));
        assert_eq!(ctx.result.stdout, "listeningbye");
        assert!(ctx.log.contains("> code 0\n[no exit code yet]\n> code 0"));
    }

    #[tokio::test]
    async fn test_code_end_check_fails_on_mismatch() {
        let launcher = Arc::new(FakeLauncher::default());
        let chain = chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("tool")
            .code(0);
        let task = tokio::spawn(chain.into_future());
        settle().await;
        let tx = launcher.sender(0);
        tx.send(ProcessEvent::Exit(2)).unwrap();
        tx.send(ProcessEvent::Close).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Assertion);
        assert_eq!(err.message, "Expected exitCode to be 0 but got 2");
    }

    #[tokio::test]
    async fn test_wait_then_write_reaches_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let chain = chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("prompt")
            .wait_stdout("name\\?")
            .write("tz")
            .wait_stdout("hi tz")
            .stdout("hi tz");
        let task = tokio::spawn(chain.into_future());
        settle().await;

        let tx = launcher.sender(0);
        tx.send(ProcessEvent::Stdout("name".into())).unwrap();
        tx.send(ProcessEvent::Stdout("?".into())).unwrap();
        settle().await;
        let written = launcher.recorded.lock().unwrap().written.clone();
        assert_eq!(written, vec![format!("tz{}", crate::output::EOL)]);

        tx.send(ProcessEvent::Stdout("\nhi tz\n".into())).unwrap();
        let ctx = task.await.unwrap().unwrap();
        assert_eq!(ctx.result.stdout, "name?\nhi tz");
    }

    #[tokio::test]
    async fn test_second_spawn_detaches_running_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let chain = chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("first")
            .write("x")
            .spawn("second")
            .write("y");
        let ctx = chain.await.unwrap();
        assert_eq!(ctx.active().unwrap().command(), "second");
        assert_eq!(ctx.detached.len(), 1);
        assert_eq!(ctx.detached[0].command(), "first");
        assert!(ctx.detached[0].pid().is_some());
    }

    #[tokio::test]
    async fn test_debug_reaches_active_and_later_processes() {
        let launcher = Arc::new(FakeLauncher::default());
        let ctx = chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("first")
            .write("x")
            .debug()
            .spawn("second")
            .write("y")
            .await
            .unwrap();
        assert!(ctx.debug);
        assert!(ctx.detached[0].is_debug_enabled());
        assert!(ctx.active().unwrap().is_debug_enabled());
    }

    #[tokio::test]
    async fn test_debug_setting_applies_to_every_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let settings = Settings { debug: true, ..Settings::default() };
        let ctx = ChainRunner::with_context(RunnerContext::new(PathBuf::from("/work"), settings))
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("tool")
            .kill()
            .await
            .unwrap();
        assert!(ctx.active().unwrap().is_debug_enabled());
    }

    #[tokio::test]
    async fn test_spawn_uses_context_cwd_and_env() {
        let launcher = Arc::new(FakeLauncher::default());
        chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .cwd("sub")
            .env("MODE", "test")
            .spawn_with("tool", ["a b"], ProcessOptions::new().env("EXTRA", "1"))
            .kill()
            .await
            .unwrap();
        let recorded = launcher.recorded.lock().unwrap();
        let specs = &recorded.specs;
        assert_eq!(specs[0].cwd, PathBuf::from("/work/sub"));
        assert_eq!(specs[0].program, "tool");
        assert_eq!(specs[0].args, vec!["a b"]);
        assert_eq!(specs[0].env.get("MODE").map(String::as_str), Some("test"));
        assert_eq!(specs[0].env.get("EXTRA").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_wait_without_process_fails() {
        let err = chain().wait_exit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotRunning);
        assert_eq!(err.step.as_deref(), Some("wait"));
    }

    #[tokio::test]
    async fn test_untouched_spawn_waits_for_close() {
        let launcher = Arc::new(FakeLauncher::default());
        let chain = chain()
            .with_launcher(Arc::clone(&launcher) as Arc<dyn Launcher>)
            .spawn("echo hi")
            .stdout("hi")
            .not_stdout("bye");
        let task = tokio::spawn(chain.into_future());
        settle().await;

        let tx = launcher.sender(0);
        tx.send(ProcessEvent::Stdout("h".into())).unwrap();
        settle().await;
        // a partial line must not be asserted on yet
        assert!(!task.is_finished());
        tx.send(ProcessEvent::Stdout("i\n".into())).unwrap();
        tx.send(ProcessEvent::Exit(0)).unwrap();
        tx.send(ProcessEvent::Close).unwrap();

        let ctx = task.await.unwrap().unwrap();
        assert_eq!(ctx.result.stdout, "hi");
    }

    #[test]
    #[should_panic(expected = "`path` is required")]
    fn test_file_requires_path() {
        let _ = chain().file("");
    }

    #[test]
    #[should_panic(expected = "`expected` is required")]
    fn test_stdout_requires_rule() {
        let _ = chain().stdout("");
    }

    #[test]
    #[should_panic(expected = "only applies to fork")]
    fn test_spawn_rejects_runtime_flags() {
        let _ = chain().spawn_with("tool", Vec::<String>::new(), ProcessOptions::new().exec_argv(["--x"]));
    }

    #[test]
    #[should_panic(expected = "invalid regex")]
    fn test_wait_stdout_rejects_bad_pattern() {
        let _ = chain().wait_stdout("(");
    }
}
