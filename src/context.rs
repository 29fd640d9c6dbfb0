//! Shared state of one chain
//!
//! Holds the mutable per-run state every step sees: working directory,
//! environment, the active process, the last result, a scratch mapping
//! and the execution log.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;
use tracing::warn;

use crate::error::{ChainError, ErrorKind};
use crate::launch::{Launcher, OsLauncher};
use crate::options::Settings;
use crate::process::{Lifecycle, ProcessHandle, ProcessResult};

/// Mutable state shared by the steps of a single chain
pub struct RunnerContext {
    /// Current working directory (changed by `cwd`/`tmpdir`)
    pub cwd: PathBuf,
    /// Environment handed to every process the chain starts
    pub env: BTreeMap<String, String>,
    /// The active process, if any
    pub proc: Option<ProcessHandle>,
    /// Snapshot of the active process's result, refreshed before each step
    pub result: ProcessResult,
    /// Last message returned by a `wait_message` step
    pub last_message: Option<Value>,
    /// Caller-defined instrumentation (timers, counters)
    pub scratch: HashMap<String, Box<dyn Any + Send + Sync>>,
    /// Execution log
    pub log: String,
    /// Echo output of every process the chain starts
    pub debug: bool,
    /// Processes replaced while still running
    pub detached: Vec<ProcessHandle>,
    /// Temporary directory owned by the chain, removed on drop
    pub workdir: Option<TempDir>,
    pub settings: Settings,
    pub(crate) launcher: Arc<dyn Launcher>,
}

impl std::fmt::Debug for RunnerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerContext")
            .field("cwd", &self.cwd)
            .field("env", &self.env)
            .field("proc", &self.proc)
            .field("result", &self.result)
            .field("debug", &self.debug)
            .field("detached", &self.detached.len())
            .finish_non_exhaustive()
    }
}

impl RunnerContext {
    /// Create a context rooted at `cwd`
    pub fn new(cwd: PathBuf, settings: Settings) -> Self {
        Self {
            cwd,
            env: BTreeMap::new(),
            proc: None,
            result: ProcessResult::default(),
            last_message: None,
            scratch: HashMap::new(),
            log: String::new(),
            debug: settings.debug,
            detached: Vec::new(),
            workdir: None,
            settings,
            launcher: Arc::new(OsLauncher),
        }
    }

    /// Resolve a path relative to the current working directory,
    /// normalizing `.` and `..`.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        let p = path.as_ref();
        if p.is_absolute() {
            clean_path(p)
        } else {
            clean_path(&self.cwd.join(p))
        }
    }

    /// Write a log entry
    pub fn logf(&mut self, msg: &str) {
        self.log.push_str(msg);
        if !msg.ends_with('\n') {
            self.log.push('\n');
        }
    }

    /// The active process, or `NotRunning` when the chain has none.
    pub fn active(&self) -> Result<&ProcessHandle, ChainError> {
        self.proc.as_ref().ok_or_else(|| {
            ChainError::new(ErrorKind::NotRunning, "no process has been started in this chain")
        })
    }

    /// Make `handle` the active process.
    ///
    /// A replaced process keeps running; it is kept in `detached` so it
    /// lives as long as the chain.
    pub fn install(&mut self, handle: ProcessHandle) {
        if let Some(previous) = self.proc.take() {
            if previous.state() < Lifecycle::Closed {
                warn!(
                    previous = %previous.command(),
                    next = %handle.command(),
                    "replacing a process that is still running"
                );
                self.logf(&format!("[detached {}]", previous.command()));
                self.detached.push(previous);
            }
        }
        self.result = handle.result();
        self.proc = Some(handle);
    }

    /// Re-read the active process's result.
    pub fn refresh_result(&mut self) {
        if let Some(ref proc) = self.proc {
            self.result = proc.result();
        }
    }

    /// Store a scratch value under `key`
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.scratch.insert(key.into(), Box::new(value));
    }

    /// Read a scratch value back, if present with the right type
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.scratch.get(key).and_then(|v| v.downcast_ref::<T>())
    }
}

/// Lexically normalize a path: drop `.`, fold `..` into its parent.
fn clean_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // '..' at the root stays at the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            _ => out.push(component),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessKind;
    use crate::options::ProcessOptions;

    fn ctx() -> RunnerContext {
        RunnerContext::new(PathBuf::from("/work/app"), Settings::default())
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let ctx = ctx();
        assert_eq!(ctx.resolve("a/b"), PathBuf::from("/work/app/a/b"));
        assert_eq!(ctx.resolve("./a/../c"), PathBuf::from("/work/app/c"));
        assert_eq!(ctx.resolve("../../../x"), PathBuf::from("/x"));
        assert_eq!(ctx.resolve("/tmp/./y"), PathBuf::from("/tmp/y"));
    }

    #[test]
    fn test_clean_relative() {
        assert_eq!(clean_path(Path::new("a/..")), PathBuf::from("."));
        assert_eq!(clean_path(Path::new("../a")), PathBuf::from("../a"));
    }

    #[test]
    fn test_logf_appends_newline() {
        let mut ctx = ctx();
        ctx.logf("> spawn sh");
        ctx.logf("ok\n");
        assert_eq!(ctx.log, "> spawn sh\nok\n");
    }

    #[test]
    fn test_scratch_is_typed() {
        let mut ctx = ctx();
        ctx.set("count", 3usize);
        assert_eq!(ctx.get::<usize>("count"), Some(&3));
        assert_eq!(ctx.get::<String>("count"), None);
        assert_eq!(ctx.get::<usize>("missing"), None);
    }

    #[test]
    fn test_active_without_process() {
        let ctx = ctx();
        assert_eq!(ctx.active().unwrap_err().kind, ErrorKind::NotRunning);
    }

    #[test]
    fn test_install_detaches_previous() {
        let mut ctx = ctx();
        let first = ProcessHandle::new(ProcessKind::Spawn, "a", vec![], ProcessOptions::default()).unwrap();
        let second = ProcessHandle::new(ProcessKind::Spawn, "b", vec![], ProcessOptions::default()).unwrap();
        ctx.install(first);
        ctx.install(second);
        // a never-started process counts as still running
        assert_eq!(ctx.detached.len(), 1);
        assert_eq!(ctx.active().unwrap().command(), "b");
    }
}
