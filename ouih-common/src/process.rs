//! Child process ownership.
//!
//! A [`ProcessHandle`] owns exactly one OS child. Stdout and stderr are read
//! by two pump tasks into a single line channel; a supervisor task owns the
//! `Child`, publishes its exit status and carries out kill requests.
//! Termination escalates from SIGTERM to SIGKILL after a grace period.
//!
//! Each child leads its own process group and signals go to the whole group,
//! so helpers forked by a launcher script die with it.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{HarnessError, HarnessResult};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One line of child output, without its terminator.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(source: OutputSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            received_at: Utc::now(),
        }
    }
}

/// Combined stdout/stderr lines of one process, ending at EOF on both pipes.
pub type LineStream = mpsc::UnboundedReceiver<OutputLine>;

/// Bounded buffer of the most recent output lines, shared between the
/// watcher task and whoever reports failures.
#[derive(Debug, Clone)]
pub struct OutputTail {
    inner: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: &str) {
        let mut lines = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push_back(line.to_string());
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// How to launch a process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// Name used in logs and errors.
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            success: false,
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Exclusive owner of one launched child process.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    started_at: Instant,
    lines: Option<LineStream>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::UnboundedSender<()>,
}

impl ProcessHandle {
    /// Spawn the process described by `spec`. Must run inside a tokio runtime.
    pub fn start(spec: &ProcessSpec) -> HarnessResult<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            role: spec.name.clone(),
            program: spec.program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(role = %spec.name, pid, program = %spec.program.display(), "process spawned");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(
                stdout,
                OutputSource::Stdout,
                spec.name.clone(),
                line_tx.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(
                stderr,
                OutputSource::Stderr,
                spec.name.clone(),
                line_tx,
            ));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(child, pid, spec.name.clone(), exit_tx, kill_rx));

        Ok(Self {
            name: spec.name.clone(),
            pid,
            started_at: Instant::now(),
            lines: Some(line_rx),
            exit_rx,
            kill_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Take the output line stream. Only the first call returns it.
    pub fn stream(&mut self) -> Option<LineStream> {
        self.lines.take()
    }

    /// Exit status if the process already ended.
    pub fn try_exit(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.try_exit().is_none()
    }

    /// Receiver that flips to `Some` when the process exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let waited = rx.wait_for(Option::is_some).await.ok().and_then(|status| *status);
        waited
            .or_else(|| *rx.borrow())
            .unwrap_or_else(ExitInfo::unknown)
    }

    /// Ask the supervisor to SIGKILL the process without waiting.
    pub fn force_kill(&self) {
        if self.is_running() {
            let _ = self.kill_tx.send(());
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL. The process has exited when
    /// this returns.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(status) = self.try_exit() {
            return status;
        }

        if !grace.is_zero() {
            debug!(role = %self.name, pid = self.pid, ?grace, "sending SIGTERM");
            if !signal_group(self.pid, "TERM").await {
                warn!(role = %self.name, pid = self.pid, "SIGTERM delivery failed");
            }
            if let Ok(status) = tokio::time::timeout(grace, self.wait()).await {
                // Group members that ignored SIGTERM outlive the leader.
                signal_group(self.pid, "KILL").await;
                info!(role = %self.name, pid = self.pid, %status, "process terminated");
                return status;
            }
            warn!(role = %self.name, pid = self.pid, ?grace, "grace period elapsed, escalating to SIGKILL");
        }

        self.force_kill();
        let status = self.wait().await;
        info!(role = %self.name, pid = self.pid, %status, "process killed");
        status
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.is_running() {
            debug!(role = %self.name, pid = self.pid, "handle dropped while running, killing");
            let _ = self.kill_tx.send(());
        }
    }
}

async fn pump_lines<R>(
    reader: R,
    source: OutputSource,
    name: String,
    tx: mpsc::UnboundedSender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                trace!(target: "ouih::output", role = %name, ?source, "{text}");
                if tx.send(OutputLine::new(source, text)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(role = %name, ?source, "output read failed: {e}");
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: u32,
    name: String,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut handle_gone = false;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv(), if !handle_gone => {
                if request.is_none() {
                    handle_gone = true;
                }
                signal_group(pid, "KILL").await;
                if let Err(e) = child.start_kill() {
                    debug!(role = %name, "kill failed: {e}");
                }
            }
        }
    };

    let info = match status {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            warn!(role = %name, "waiting for process failed: {e}");
            ExitInfo::unknown()
        }
    };
    debug!(role = %name, status = %info, "process exited");
    exit_tx.send_replace(Some(info));
}

/// Send `signal` to the process group led by `pid`.
async fn signal_group(pid: u32, signal: &str) -> bool {
    if pid == 0 {
        return false;
    }
    match Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{pid}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("failed to send {signal} to group {pid}: {e}");
            false
        }
    }
}
