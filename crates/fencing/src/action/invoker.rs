//! One fence agent process: spawn, feed, watch, signal, classify.
//!
//! Agents run in their own process group so that escalation signals reach
//! every helper they fork. The [`AgentProcess`] handle owns the child, its
//! output readers and the group; dropping a handle whose child has not been
//! reaped kills the whole group.

use parking_lot::Mutex;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{FenceError, Result};

/// How long to keep draining output pipes once the agent has exited.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 4096;

/// Background reader accumulating everything written to one agent pipe.
struct OutputCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl OutputCapture {
    fn start<R>(mut reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!(error = %e, "Agent output read failed");
                        break;
                    }
                }
            }
        });
        Self { buffer, task }
    }

    /// Collect what was captured, waiting briefly for the writer side to close.
    async fn finish(mut self) -> String {
        if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut self.task)
            .await
            .is_err()
        {
            debug!("Agent output pipe still open after exit, keeping what was read");
            self.task.abort();
        }
        let bytes = std::mem::take(&mut *self.buffer.lock());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentExit {
    pub status: ExitStatus,
    /// Last signal we sent because the attempt ran out of time.
    pub timeout_signal: Option<i32>,
}

/// Everything known about a finished attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub pid: u32,
    pub exit: AgentExit,
    pub stdout: String,
    pub stderr: String,
}

impl AttemptReport {
    /// Result of the attempt per the agent's exit status and error output.
    pub fn result(&self) -> Result<()> {
        classify(&self.exit, &self.stderr)
    }
}

/// A running fence agent.
pub struct AgentProcess {
    agent: String,
    pid: u32,
    child: Child,
    stdout: Option<OutputCapture>,
    stderr: Option<OutputCapture>,
    reaped: bool,
}

impl AgentProcess {
    /// Start `agent` in a new process group and write `args` to its stdin.
    ///
    /// The agent gets no command-line arguments. Its stdin is closed once the
    /// argument blob has been written.
    pub async fn spawn(agent: &str, args: &str) -> Result<Self> {
        let mut command = Command::new(agent);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command
            .spawn()
            .map_err(|e| FenceError::Spawn(format!("{agent}: {e}")))?;

        let Some(pid) = child.id() else {
            return Err(FenceError::Spawn(format!(
                "{agent}: exited before its pid was known"
            )));
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            if let Err(e) = signal_group(pid as i32, libc::SIGKILL) {
                warn!(agent, pid, error = %e, "Could not kill agent without pipes");
            }
            return Err(FenceError::Spawn(format!("{agent}: pipes unavailable")));
        };

        let process = Self {
            agent: agent.to_string(),
            pid,
            child,
            stdout: Some(OutputCapture::start(stdout)),
            stderr: Some(OutputCapture::start(stderr)),
            reaped: false,
        };

        debug!(agent, pid, "Sending arguments to fence agent");
        send_args(stdin, args).await?;
        Ok(process)
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Send `signal` to the agent's whole process group.
    pub fn signal(&self, signal: i32) -> Result<()> {
        signal_group(self.pid as i32, signal)
    }

    async fn reap(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await.map_err(|e| {
            FenceError::Spawn(format!("waiting for {}[{}]: {e}", self.agent, self.pid))
        })?;
        self.reaped = true;
        Ok(status)
    }

    /// Wait for the agent to exit, killing its group once `timeout` expires.
    ///
    /// With no timeout the wait is unbounded.
    pub async fn wait_or_kill(&mut self, timeout: Option<Duration>) -> Result<AgentExit> {
        let Some(timeout) = timeout else {
            let status = self.reap().await?;
            return Ok(AgentExit {
                status,
                timeout_signal: None,
            });
        };

        if let Ok(status) = tokio::time::timeout(timeout, self.reap()).await {
            return Ok(AgentExit {
                status: status?,
                timeout_signal: None,
            });
        }

        info!(agent = %self.agent, pid = self.pid, "Child timed out, sending SIGKILL");
        if let Err(e) = self.signal(libc::SIGKILL) {
            error!(agent = %self.agent, pid = self.pid, error = %e, "Could not kill agent");
        }
        let status = self.reap().await?;
        Ok(AgentExit {
            status,
            timeout_signal: Some(libc::SIGKILL),
        })
    }

    /// Wait for the agent to exit, escalating once `timeout` expires.
    ///
    /// SIGTERM goes to the group at `timeout`, SIGKILL at `timeout + grace`.
    /// Both timers are dropped as soon as the agent exits.
    pub async fn wait_with_escalation(
        &mut self,
        timeout: Option<Duration>,
        grace: Duration,
    ) -> Result<AgentExit> {
        let Some(timeout) = timeout else {
            error!(agent = %self.agent, pid = self.pid, "No timeout set for fence agent");
            return self.wait_or_kill(None).await;
        };

        let pid = self.pid;
        let term = tokio::time::sleep(timeout);
        let kill = tokio::time::sleep(timeout + grace);
        tokio::pin!(term);
        tokio::pin!(kill);

        let mut timeout_signal = None;
        let waited = loop {
            tokio::select! {
                status = self.child.wait() => break status,
                () = &mut term, if timeout_signal.is_none() => {
                    info!(pid, "Child timed out, sending SIGTERM");
                    if let Err(e) = signal_group(pid as i32, libc::SIGTERM) {
                        error!(pid, error = %e, "Could not terminate agent");
                    }
                    timeout_signal = Some(libc::SIGTERM);
                }
                () = &mut kill, if timeout_signal != Some(libc::SIGKILL) => {
                    info!(pid, "Child timed out, sending SIGKILL");
                    if let Err(e) = signal_group(pid as i32, libc::SIGKILL) {
                        error!(pid, error = %e, "Could not kill agent");
                    }
                    timeout_signal = Some(libc::SIGKILL);
                }
            }
        };

        let status = waited.map_err(|e| {
            FenceError::Spawn(format!("waiting for {}[{pid}]: {e}", self.agent))
        })?;
        self.reaped = true;
        Ok(AgentExit {
            status,
            timeout_signal,
        })
    }

    /// Gather captured output after the agent has exited.
    pub async fn finish(&mut self, exit: AgentExit) -> AttemptReport {
        let stdout = match self.stdout.take() {
            Some(capture) => capture.finish().await,
            None => String::new(),
        };
        let stderr = match self.stderr.take() {
            Some(capture) => capture.finish().await,
            None => String::new(),
        };
        log_output(&self.agent, self.pid, &stdout, &stderr);
        AttemptReport {
            pid: self.pid,
            exit,
            stdout,
            stderr,
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        warn!(agent = %self.agent, pid = self.pid, "Killing abandoned fence agent");
        if let Err(e) = self.signal(libc::SIGKILL) {
            error!(agent = %self.agent, pid = self.pid, error = %e, "Could not kill agent");
        }
    }
}

async fn send_args(mut stdin: ChildStdin, args: &str) -> Result<()> {
    match stdin.write_all(args.as_bytes()).await {
        Ok(()) => Ok(()),
        // The agent exited without reading; its exit status tells the story.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("Fence agent closed stdin before reading its arguments");
            Ok(())
        }
        Err(e) => Err(FenceError::Communication(format!(
            "could not send arguments to the agent: {e}"
        ))),
    }
}

/// Send `signal` to every process in group `pgid`.
///
/// A group that no longer exists is not an error.
pub fn signal_group(pgid: i32, signal: i32) -> Result<()> {
    if pgid <= 0 {
        return Err(FenceError::InvalidArgument(format!(
            "refusing to signal process group {pgid}"
        )));
    }
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(FenceError::Generic(format!(
        "kill(-{pgid}, {signal}) failed: {err}"
    )))
}

/// Map an agent's exit to a result.
///
/// A signal we sent ourselves means the attempt timed out. Any other signal
/// means something else killed it. A non-zero exit is refined by looking at
/// what the agent printed on stderr.
pub fn classify(exit: &AgentExit, stderr: &str) -> Result<()> {
    if exit.timeout_signal.is_some() {
        return Err(FenceError::TimedOut);
    }
    if let Some(signal) = exit.status.signal() {
        return Err(FenceError::Aborted(signal));
    }
    match exit.status.code() {
        Some(0) => Ok(()),
        Some(exit_code) => {
            let stderr = stderr.to_lowercase();
            if stderr.trim().is_empty() {
                Err(FenceError::NoData)
            } else if stderr.contains("timed out") {
                Err(FenceError::AgentTimedOut)
            } else if stderr.contains("unrecognised action") {
                Err(FenceError::NotSupported)
            } else {
                Err(FenceError::AgentFailed { exit_code })
            }
        }
        None => Err(FenceError::Aborted(0)),
    }
}

fn log_output(agent: &str, pid: u32, stdout: &str, stderr: &str) {
    for line in stdout.lines().filter(|l| !l.is_empty()) {
        trace!("{agent}[{pid}] stdout: {line}");
    }
    for line in stderr.lines().filter(|l| !l.is_empty()) {
        warn!("{agent}[{pid}] stderr: {line}");
    }
}
