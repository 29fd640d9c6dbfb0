//! Process launching
//!
//! The `Launcher` trait is the seam between a `ProcessHandle` and the thing
//! that actually runs a process. `OsLauncher` runs real OS processes on
//! tokio; tests substitute a fake that feeds events through a channel.
//!
//! A launched process reports everything through one ordered event stream:
//! output chunks per stream in arrival order, messages (fork only), then
//! `Exit` once the process has exited and `Close` once every stream has
//! been drained. Chunks may still arrive between `Exit` and `Close`.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::output::Utf8Chunker;
use crate::process::ProcessKind;

/// One event from a launched process.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// Raw stdout chunk
    Stdout(String),
    /// Raw stderr chunk
    Stderr(String),
    /// Message received over the fork channel
    Message(serde_json::Value),
    /// The process exited with this code
    Exit(i32),
    /// All streams are drained and the process is gone
    Close,
}

/// Everything a launcher needs to start one process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub kind: ProcessKind,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
    pub prefer_local: bool,
}

/// Control surface of a running process.
pub trait ProcessControl: Send + Sync {
    /// Queue data for the process's stdin. Does not wait for delivery.
    fn write(&self, data: String) -> std::io::Result<()>;

    /// Send a signal (default `SIGTERM`). Does not wait for exit.
    fn kill(&self, signal: Option<&str>) -> std::io::Result<()>;
}

/// A started process: its event stream and its controls.
pub struct Launched {
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    pub control: Box<dyn ProcessControl>,
    pub pid: Option<u32>,
}

/// Something that can start processes
pub trait Launcher: Send + Sync {
    /// Start a process. An `Err` means it could not be launched at all.
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Launched>;
}

/// Launches real OS processes with tokio. Must be called inside a runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Launched> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if spec.prefer_local {
            cmd.env("PATH", local_path(&spec.cwd, spec.env.get("PATH").map(String::as_str)));
        }

        #[cfg(unix)]
        let channel = match spec.kind {
            ProcessKind::Fork => Some(channel::attach(&mut cmd)?),
            ProcessKind::Spawn => None,
        };

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(program = %spec.program, pid = ?pid, kind = ?spec.kind, "launched");

        let (tx, rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump(out, tx.clone(), ProcessEvent::Stdout)));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump(err, tx.clone(), ProcessEvent::Stderr)));
        }
        #[cfg(unix)]
        if let Some(pending) = channel {
            let stream = pending.into_parent()?;
            readers.push(tokio::spawn(channel::pump_messages(stream, tx.clone())));
        }

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(feed_stdin(stdin, stdin_rx));
        }

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(child, kill_rx, readers, tx));

        Ok(Launched {
            events: rx,
            control: Box::new(OsControl { stdin: stdin_tx, kills: kill_tx }),
            pid,
        })
    }
}

#[cfg(unix)]
type Signal = nix::sys::signal::Signal;
#[cfg(not(unix))]
type Signal = ();

struct OsControl {
    stdin: mpsc::UnboundedSender<String>,
    kills: mpsc::UnboundedSender<Signal>,
}

impl ProcessControl for OsControl {
    fn write(&self, data: String) -> std::io::Result<()> {
        if self.stdin.send(data).is_err() {
            debug!("stdin already closed; write dropped");
        }
        Ok(())
    }

    fn kill(&self, signal: Option<&str>) -> std::io::Result<()> {
        let signal = parse_signal(signal)?;
        if self.kills.send(signal).is_err() {
            debug!("process already exited; kill ignored");
        }
        Ok(())
    }
}

/// Parse a signal name (`SIGINT`, `int`, `2`). `None` means `SIGTERM`.
#[cfg(unix)]
pub fn parse_signal(name: Option<&str>) -> std::io::Result<Signal> {
    use std::str::FromStr;

    let invalid = |name: &str| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("unknown signal: {}", name))
    };
    let Some(name) = name else {
        return Ok(Signal::SIGTERM);
    };
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).map_err(|_| invalid(name));
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") { upper } else { format!("SIG{}", upper) };
    Signal::from_str(&full).map_err(|_| invalid(name))
}

/// Signals are not distinguished off Unix; every kill terminates.
#[cfg(not(unix))]
pub fn parse_signal(_name: Option<&str>) -> std::io::Result<Signal> {
    Ok(())
}

/// Exit code of a finished process. Signal deaths map to `128 + signal`.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

/// Read a pipe to EOF, forwarding decoded chunks.
async fn pump<R>(mut reader: R, tx: mpsc::UnboundedSender<ProcessEvent>, wrap: fn(String) -> ProcessEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8192];
    let mut chunker = Utf8Chunker::new();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // keep draining even if nobody listens, so the child never blocks on a full pipe
                if let Some(text) = chunker.push(&buf[..n]) {
                    let _ = tx.send(wrap(text));
                }
            }
            Err(e) => {
                debug!(error = %e, "pipe read failed");
                break;
            }
        }
    }
    if let Some(text) = chunker.finish() {
        let _ = tx.send(wrap(text));
    }
}

async fn feed_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(data.as_bytes()).await {
            debug!(error = %e, "stdin write failed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            debug!(error = %e, "stdin flush failed");
            break;
        }
    }
}

/// Wait for exit (delivering kill requests meanwhile), then for the readers.
///
/// The kill channel closing means the controlling handle was dropped; the
/// child is killed then, so no process outlives its handle.
async fn supervise(
    mut child: Child,
    mut kills: mpsc::UnboundedReceiver<Signal>,
    readers: Vec<JoinHandle<()>>,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut orphaned = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kills.recv(), if !orphaned => match request {
                Some(signal) => deliver(&mut child, signal),
                None => {
                    orphaned = true;
                    debug!(pid = ?child.id(), "handle dropped; killing process");
                    if let Err(e) = child.start_kill() {
                        warn!(error = %e, "failed to kill orphaned process");
                    }
                }
            },
        }
    };

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(error = %e, "failed to wait for process");
            -1
        }
    };
    debug!(code, "exited");
    let _ = tx.send(ProcessEvent::Exit(code));

    for reader in readers {
        let _ = reader.await;
    }
    let _ = tx.send(ProcessEvent::Close);
}

#[cfg(unix)]
fn deliver(child: &mut Child, signal: Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    debug!(pid, ?signal, "sending signal");
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        warn!(pid, error = %e, "failed to signal process");
    }
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, _signal: Signal) {
    if let Err(e) = child.start_kill() {
        warn!(error = %e, "failed to kill process");
    }
}

/// Directories searched first when `prefer_local` is set: the cargo
/// profile directory under `cwd`, and the profile directory of the
/// running binary (`target/<profile>/deps/<test>` → `target/<profile>`).
pub fn local_bin_dirs(cwd: &Path) -> Vec<PathBuf> {
    let mut dirs = vec![cwd.join("target").join("debug")];
    if let Some(dir) = std::env::current_exe().ok().as_deref().and_then(Path::parent) {
        let profile = if dir.ends_with("deps") { dir.parent().unwrap_or(dir) } else { dir };
        if !dirs.iter().any(|d| d == profile) {
            dirs.push(profile.to_path_buf());
        }
    }
    dirs
}

/// `PATH` with the local binary directories in front of `base`
/// (or the inherited `PATH` when `base` is `None`).
pub fn local_path(cwd: &Path, base: Option<&str>) -> OsString {
    let base = base.map(OsString::from).or_else(|| std::env::var_os("PATH")).unwrap_or_default();
    let dirs = local_bin_dirs(cwd)
        .into_iter()
        .chain(std::env::split_paths(&base));
    std::env::join_paths(dirs).unwrap_or(base)
}

/// The fork message channel: a socket pair whose child end becomes fd 3.
///
/// The wire format is newline-delimited JSON, the same framing a node
/// child uses for `process.send` when `NODE_CHANNEL_SERIALIZATION_MODE=json`.
#[cfg(unix)]
mod channel {
    use std::os::unix::io::{AsRawFd, RawFd};
    use std::os::unix::net::UnixStream as StdUnixStream;

    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::process::Command;
    use tokio::sync::mpsc;
    use tracing::debug;

    use super::ProcessEvent;

    pub const CHANNEL_FD: RawFd = 3;

    pub struct Pending {
        parent: StdUnixStream,
        child: StdUnixStream,
    }

    impl Pending {
        /// Release the child end (the child has its own copy now).
        pub fn into_parent(self) -> std::io::Result<UnixStream> {
            drop(self.child);
            self.parent.set_nonblocking(true)?;
            UnixStream::from_std(self.parent)
        }
    }

    pub fn attach(cmd: &mut Command) -> std::io::Result<Pending> {
        let (parent, child) = StdUnixStream::pair()?;
        let child_fd = child.as_raw_fd();
        // SAFETY: the hook runs between fork and exec and only makes
        // async-signal-safe libc calls on descriptors owned by this process.
        unsafe {
            cmd.pre_exec(move || {
                if child_fd == CHANNEL_FD {
                    let flags = libc::fcntl(CHANNEL_FD, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(CHANNEL_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.env("NODE_CHANNEL_FD", CHANNEL_FD.to_string());
        cmd.env("NODE_CHANNEL_SERIALIZATION_MODE", "json");
        Ok(Pending { parent, child })
    }

    pub async fn pump_messages(stream: UnixStream, tx: mpsc::UnboundedSender<ProcessEvent>) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value = serde_json::from_str(&line)
                        .unwrap_or(serde_json::Value::String(line));
                    let _ = tx.send(ProcessEvent::Message(value));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "message channel read failed");
                    break;
                }
            }
        }
    }
}
