//! Child process supervisor
//!
//! Launches an external runtime and discovers its control endpoint through the
//! stdout handshake. Launching never blocks the caller: the process handle and
//! the endpoint are delivered through two independent one-shot channels, and
//! waiting on them is bounded by the configured timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::handshake::HandshakeParser;
use crate::core::config::{HubConfig, ParticipantConfig};
use crate::core::errors::{HubError, Result};
use crate::task::TaskState;

/// Lines buffered for the console before new ones are dropped
const CONSOLE_CAPACITY: usize = 1024;

/// Options for launching a child runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchOptions {
    pub executable: PathBuf,
    /// Extra interpreter flags, passed through `JAVA_OPTS`
    pub java_options: Vec<String>,
    /// Program arguments appended after the launcher flags
    pub arguments: Vec<String>,
    /// When false `--no-autorun` is passed (embedded launcher variant)
    pub autorun: bool,
    /// Falls back to the host's `JAVA_HOME`
    pub java_home: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl LaunchOptions {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            java_options: Vec::new(),
            arguments: Vec::new(),
            autorun: true,
            java_home: None,
            working_dir: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn for_participant(participant: &ParticipantConfig, config: &HubConfig) -> Self {
        Self {
            executable: participant.executable.clone(),
            java_options: participant.java_options.clone(),
            arguments: participant.arguments.clone(),
            autorun: participant.autorun,
            java_home: config.java_home.clone(),
            working_dir: None,
            timeout: config.handshake_timeout(),
        }
    }

    pub fn with_java_option(mut self, option: impl Into<String>) -> Self {
        self.java_options.push(option.into());
        self
    }

    pub fn with_argument(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn with_autorun(mut self, autorun: bool) -> Self {
        self.autorun = autorun;
        self
    }

    pub fn with_java_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.java_home = Some(path.into());
        self
    }

    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Full argument list passed to the executable
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "--port".to_string(),
            "auto".to_string(),
            "--interactive".to_string(),
        ];
        if !self.autorun {
            args.push("--no-autorun".to_string());
        }
        args.extend(self.arguments.iter().cloned());
        args
    }

    /// Value of the `JAVA_OPTS` variable
    pub fn java_opts_value(&self) -> String {
        serialize_options(&self.java_options)
    }

    fn resolved_java_home(&self) -> Option<PathBuf> {
        self.java_home
            .clone()
            .or_else(|| std::env::var_os("JAVA_HOME").map(PathBuf::from))
    }
}

/// Serialize an array of strings into one shell-word string.
///
/// Items containing whitespace, quotes or backslashes are double-quoted with
/// `"` and `\` escaped; empty items become `""`.
pub fn serialize_options(options: &[String]) -> String {
    options
        .iter()
        .map(|opt| {
            let needs_quotes = opt.is_empty()
                || opt
                    .chars()
                    .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '\'');
            if needs_quotes {
                let escaped = opt.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            } else {
                opt.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which child stream a console line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// One line of child output forwarded to the visible console
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub stream: ConsoleStream,
    pub text: String,
}

/// Exit of a reaped child, or the error that ended waiting on it
type ExitOutcome = std::result::Result<ExitStatus, String>;

/// Shared handle to a spawned child process
///
/// A reaper task owns the [`Child`]; handles ask it to kill and observe the
/// exit status it publishes, so no handle ever blocks another.
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

impl ProcessHandle {
    fn new(child: Child) -> Self {
        let pid = child.id();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(reap(child, kill_rx, exit_tx));
        Self {
            pid,
            kill_tx,
            exit_rx,
        }
    }

    /// OS process id, if the process had not exited when it was spawned
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Forcibly terminate the process and wait until it is reaped
    pub async fn kill(&self) -> Result<()> {
        // a closed channel means the reaper already saw the exit
        let _ = self.kill_tx.send(());
        self.wait().await.map(|_| ())
    }

    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome.map_err(|e| HubError::process("wait", e));
            }
            if rx.changed().await.is_err() {
                let outcome = rx.borrow().clone();
                return outcome
                    .unwrap_or_else(|| Err("reaper ended without an exit status".to_string()))
                    .map_err(|e| HubError::process("wait", e));
            }
        }
    }

    pub async fn try_wait(&self) -> Result<Option<ExitStatus>> {
        let outcome = self.exit_rx.borrow().clone();
        outcome
            .transpose()
            .map_err(|e| HubError::process("try_wait", e))
    }
}

async fn reap(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Some(()) = kill_rx.recv() => {
            if let Err(e) = child.start_kill() {
                warn!(pid = ?child.id(), error = %e, "Failed to signal child process");
            }
            child.wait().await
        }
    };
    if let Ok(status) = &status {
        debug!(pid = ?child.id(), %status, "Child process exited");
    }
    exit_tx.send_replace(Some(status.map_err(|e| e.to_string())));
}

/// A launched child and its discovered control endpoint
#[derive(Debug, Clone)]
pub struct ChildProcessInfo {
    pub process: ProcessHandle,
    pub address: SocketAddr,
}

/// Receiver of the domain-level "stop" control for a launched runtime
#[async_trait]
pub trait StopHandler: Send + Sync {
    async fn stop(&self) -> Result<TaskState>;
}

/// Supervises one launched child process
pub struct ChildProcessSupervisor {
    executable: PathBuf,
    timeout: Duration,
    process_rx: Option<oneshot::Receiver<Result<ProcessHandle>>>,
    process: Option<ProcessHandle>,
    endpoint_rx: Option<oneshot::Receiver<Result<SocketAddr>>>,
    address: Option<SocketAddr>,
    console: Option<mpsc::Receiver<ConsoleLine>>,
    stop_handler: Option<Arc<dyn StopHandler>>,
}

impl ChildProcessSupervisor {
    /// Launch the child on the current tokio runtime. Returns immediately.
    pub fn launch(options: LaunchOptions) -> Self {
        let (process_tx, process_rx) = oneshot::channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (console_tx, console_rx) = mpsc::channel(CONSOLE_CAPACITY);

        let executable = options.executable.clone();
        let timeout = options.timeout;
        tokio::spawn(run_child(options, process_tx, endpoint_tx, console_tx));

        Self {
            executable,
            timeout,
            process_rx: Some(process_rx),
            process: None,
            endpoint_rx: Some(endpoint_rx),
            address: None,
            console: Some(console_rx),
            stop_handler: None,
        }
    }

    pub fn with_stop_handler(mut self, handler: Arc<dyn StopHandler>) -> Self {
        self.stop_handler = Some(handler);
        self
    }

    /// Take the console stream. Lines are dropped once its buffer fills.
    pub fn take_console(&mut self) -> Option<mpsc::Receiver<ConsoleLine>> {
        self.console.take()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the OS process handle
    pub async fn process(&mut self) -> Result<ProcessHandle> {
        let timeout = self.timeout;
        tokio::time::timeout(
            timeout,
            resolve(&mut self.process, &mut self.process_rx, "spawn"),
        )
        .await
        .map_err(|_| HubError::timeout("process spawn", timeout))?
    }

    /// Wait for the handshake to announce the control endpoint
    pub async fn address(&mut self) -> Result<SocketAddr> {
        let timeout = self.timeout;
        tokio::time::timeout(
            timeout,
            resolve(&mut self.address, &mut self.endpoint_rx, "handshake"),
        )
        .await
        .map_err(|_| HubError::timeout("handshake", timeout))?
    }

    /// Wait for both the process handle and the endpoint, concurrently.
    ///
    /// On timeout the process is left running; fetch it with [`Self::process`]
    /// to terminate it.
    pub async fn info(&mut self) -> Result<ChildProcessInfo> {
        let timeout = self.timeout;
        let both = futures::future::try_join(
            resolve(&mut self.process, &mut self.process_rx, "spawn"),
            resolve(&mut self.address, &mut self.endpoint_rx, "handshake"),
        );
        let (process, address) = tokio::time::timeout(timeout, both)
            .await
            .map_err(|_| HubError::timeout("handshake", timeout))??;
        info!(
            executable = %self.executable.display(),
            pid = ?process.id(),
            %address,
            "Child process ready"
        );
        Ok(ChildProcessInfo { process, address })
    }

    /// Route a stop request to the domain-level handler (a clean, not a kill)
    pub async fn request_stop(&self) -> Result<TaskState> {
        match &self.stop_handler {
            Some(handler) => handler.stop().await,
            None => Err(HubError::configuration("no stop handler registered")),
        }
    }
}

/// Await a one-shot result once and cache the success
async fn resolve<T: Clone>(
    cached: &mut Option<T>,
    rx: &mut Option<oneshot::Receiver<Result<T>>>,
    operation: &str,
) -> Result<T> {
    if let Some(value) = cached {
        return Ok(value.clone());
    }
    let receiver = rx
        .as_mut()
        .ok_or_else(|| HubError::process(operation, "already failed"))?;
    let result = match receiver.await {
        Ok(result) => result,
        Err(_) => Err(HubError::process(
            operation,
            "child output closed before it resolved",
        )),
    };
    *rx = None;
    if let Ok(value) = &result {
        *cached = Some(value.clone());
    }
    result
}

async fn run_child(
    options: LaunchOptions,
    process_tx: oneshot::Sender<Result<ProcessHandle>>,
    endpoint_tx: oneshot::Sender<Result<SocketAddr>>,
    console_tx: mpsc::Sender<ConsoleLine>,
) {
    let mut command = Command::new(&options.executable);
    command
        .args(options.command_args())
        .env("JAVA_OPTS", options.java_opts_value())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    if let Some(java_home) = options.resolved_java_home() {
        command.env("JAVA_HOME", java_home);
    }
    if let Some(dir) = &options.working_dir {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(
                executable = %options.executable.display(),
                error = %e,
                "Failed to spawn child process"
            );
            let _ = process_tx.send(Err(HubError::process(
                "spawn",
                format!("{}: {}", options.executable.display(), e),
            )));
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let handle = ProcessHandle::new(child);
    debug!(
        pid = ?handle.id(),
        executable = %options.executable.display(),
        "Child process spawned"
    );
    let _ = process_tx.send(Ok(handle));

    if let Some(stderr) = stderr {
        tokio::spawn(forward_lines(stderr, ConsoleStream::Stderr, console_tx.clone()));
    }

    let Some(stdout) = stdout else {
        return;
    };
    let mut parser = HandshakeParser::new();
    let mut endpoint_tx = Some(endpoint_tx);
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(outcome) = parser.feed(&line) {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(outcome);
                    }
                }
                forward(&console_tx, ConsoleStream::Stdout, line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read child stdout");
                break;
            }
        }
    }
    // dropping an unresolved endpoint sender fails the waiting side
}

async fn forward_lines<R>(reader: R, stream: ConsoleStream, console_tx: mpsc::Sender<ConsoleLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        forward(&console_tx, stream, line);
    }
}

fn forward(console_tx: &mpsc::Sender<ConsoleLine>, stream: ConsoleStream, text: String) {
    debug!(target: "livehub::process", ?stream, "{}", text);
    let _ = console_tx.try_send(ConsoleLine { stream, text });
}
