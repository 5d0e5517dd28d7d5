//! Subprocess execution with process-group lifecycle management.
//!
//! Every command goes through [`run`]. The output mode is chosen by the
//! [`OutputSink`]: buffered callers only want the captured text, streaming
//! callers also get each line on a bounded queue, and terminal callers see the
//! output on the daemon's own streams. stdout and stderr are always captured
//! so failures keep their diagnostics.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::deploy::cancel::{CancelReason, CancelToken};
use crate::deploy::compose::ComposeError;

/// Upper bound on the wait between the graceful and the forced signal
pub const GRACEFUL_STOP_CEILING: Duration = Duration::from_secs(20);

/// How long readers may keep draining pipes after a cancelled command
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of command output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Where command output goes besides the capture buffers
#[derive(Debug, Clone)]
pub enum OutputSink {
    /// Capture only
    Buffer,

    /// Publish each line to a bounded queue. When the queue is full or closed
    /// the reader stops publishing instead of blocking.
    Channel(mpsc::Sender<OutputLine>),

    /// Forward to this process's stdout/stderr and inherit stdin
    Terminal,
}

impl OutputSink {
    /// Forward one line; returns false once the sink stopped accepting lines
    async fn forward(&self, stream: OutputStream, line: &str) -> bool {
        match self {
            OutputSink::Buffer => true,
            OutputSink::Channel(tx) => {
                let message = OutputLine {
                    stream,
                    line: line.to_string(),
                };
                match tx.try_send(message) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Dropping further {:?} output: {}", stream, e);
                        false
                    }
                }
            }
            OutputSink::Terminal => {
                let mut data = Vec::with_capacity(line.len() + 1);
                data.extend_from_slice(line.as_bytes());
                data.push(b'\n');
                let written = match stream {
                    OutputStream::Stdout => tokio::io::stdout().write_all(&data).await,
                    OutputStream::Stderr => tokio::io::stderr().write_all(&data).await,
                };
                written.is_ok()
            }
        }
    }
}

/// A fully described command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,

    /// Added on top of the inherited environment
    pub envs: Vec<(String, String)>,
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Run `spec` to completion, honoring `cancel`.
///
/// The child leads its own process group so that everything the compose engine
/// spawns is signalled with it. Returns once the process and both readers have
/// finished.
pub async fn run(
    spec: &CommandSpec,
    sink: OutputSink,
    cancel: &CancelToken,
) -> Result<CommandOutput, ComposeError> {
    if let Some(reason) = cancel.reason() {
        return Err(ComposeError::Cancelled {
            reason,
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if matches!(sink, OutputSink::Terminal) {
        command.stdin(Stdio::inherit());
    } else {
        command.stdin(Stdio::null());
    }
    #[cfg(unix)]
    command.process_group(0);

    debug!("Running: {}", spec);
    let mut child = command.spawn().map_err(|e| ComposeError::Spawn {
        program: spec.program.clone(),
        message: e.to_string(),
    })?;
    let pid = child.id();

    let stdout_reader = tokio::spawn(read_lines(
        child.stdout.take(),
        OutputStream::Stdout,
        sink.clone(),
    ));
    let stderr_reader = tokio::spawn(read_lines(
        child.stderr.take(),
        OutputStream::Stderr,
        sink,
    ));

    let waited: Result<std::io::Result<ExitStatus>, CancelReason> = tokio::select! {
        status = child.wait() => Ok(status),
        reason = cancel.cancelled() => Err(reason),
    };

    match waited {
        Ok(status) => {
            let stdout = collect(stdout_reader, None).await;
            let stderr = collect(stderr_reader, None).await;
            let status = status.map_err(|e| ComposeError::Io(e.to_string()))?;
            debug!("{} exited with {}", spec.program, status);

            if status.success() {
                Ok(CommandOutput {
                    code: status.code(),
                    stdout,
                    stderr,
                })
            } else {
                Err(ComposeError::Failed {
                    code: status.code(),
                    stdout,
                    stderr,
                })
            }
        }
        Err(reason) => {
            warn!("{} {}, terminating process group", spec, reason);
            terminate(&mut child, pid, cancel).await;
            let stdout = collect(stdout_reader, Some(READER_DRAIN_TIMEOUT)).await;
            let stderr = collect(stderr_reader, Some(READER_DRAIN_TIMEOUT)).await;
            Err(ComposeError::Cancelled {
                reason,
                stdout,
                stderr,
            })
        }
    }
}

/// Read `pipe` line by line into a buffer, forwarding to `sink` while it accepts
async fn read_lines<R>(pipe: Option<R>, stream: OutputStream, sink: OutputSink) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return String::new();
    };

    let mut reader = BufReader::new(pipe);
    let mut captured = String::new();
    let mut forwarding = true;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\n', '\r']);
                if forwarding {
                    forwarding = sink.forward(stream, line).await;
                }
                captured.push_str(line);
                captured.push('\n');
            }
            Err(e) => {
                debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }

    captured
}

async fn collect(handle: JoinHandle<String>, limit: Option<Duration>) -> String {
    let joined = match limit {
        Some(limit) => {
            let abort = handle.abort_handle();
            match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort.abort();
                    warn!("Output reader did not finish after {:?}", limit);
                    return String::new();
                }
            }
        }
        None => handle.await,
    };
    joined.unwrap_or_else(|e| {
        warn!("Output reader task failed: {}", e);
        String::new()
    })
}

/// Two-phase termination: SIGTERM the group, wait up to the lesser of
/// [`GRACEFUL_STOP_CEILING`] and the remaining deadline, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>, cancel: &CancelToken) {
    let Some(pid) = pid else {
        return;
    };

    let grace = cancel
        .remaining()
        .map_or(GRACEFUL_STOP_CEILING, |left| left.min(GRACEFUL_STOP_CEILING));

    if let Err(e) = signal_group(child, pid, GroupSignal::Terminate) {
        warn!("Failed to send SIGTERM to process group {}: {}", pid, e);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("Process group {} exited after SIGTERM: {}", pid, status);
            // The leader may be gone while helpers linger in the group.
            let _ = signal_group(child, pid, GroupSignal::Kill);
        }
        Ok(Err(e)) => warn!("Failed waiting on process {}: {}", pid, e),
        Err(_) => {
            warn!(
                "Process group {} still running after {:?}, sending SIGKILL",
                pid, grace
            );
            if let Err(e) = signal_group(child, pid, GroupSignal::Kill) {
                warn!("Failed to send SIGKILL to process group {}: {}", pid, e);
            }
            if let Err(e) = child.wait().await {
                warn!("Failed waiting on process {}: {}", pid, e);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the whole process group. A group that no longer exists counts as
/// success.
#[cfg(unix)]
fn signal_group(_child: &mut Child, pid: u32, signal: GroupSignal) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _pid: u32, _signal: GroupSignal) -> std::io::Result<()> {
    match child.start_kill() {
        Err(e) if e.kind() != std::io::ErrorKind::InvalidInput => Err(e),
        _ => Ok(()),
    }
}
