use std::process::Stdio;

use relay_bridge::protocol::OutputStream;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::launch::LaunchRequest;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("program not found: {0}")]
    NotFound(String),
    #[error("permission denied launching {0}")]
    PermissionDenied(String),
    #[error("spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// SpawnedProcess
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to stop (SIGTERM where available).
    Terminate,
    /// Force the process down.
    Kill,
}

/// One line of output with the trailing newline stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
}

/// Channels connected to a running process.
///
/// `lines` closes once both output pipes are exhausted; `exit` flips to
/// `Some` exactly once when the process has been reaped.
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub lines: flume::Receiver<OutputLine>,
    pub signals: flume::Sender<ProcessSignal>,
    pub exit: watch::Receiver<Option<ProcessExit>>,
}

impl SpawnedProcess {
    pub fn new(
        pid: Option<u32>,
        lines: flume::Receiver<OutputLine>,
        signals: flume::Sender<ProcessSignal>,
        exit: watch::Receiver<Option<ProcessExit>>,
    ) -> Self {
        Self {
            pid,
            lines,
            signals,
            exit,
        }
    }
}

/// Wait until the process behind `exit` has been reaped. Returns `None` if
/// the reaper went away without reporting.
pub async fn wait_for_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> Option<ProcessExit> {
    match exit.wait_for(Option::is_some).await {
        Ok(value) => *value,
        Err(_) => None,
    }
}

// ---------------------------------------------------------------------------
// ProcessSpawner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over process creation so the supervisor can be driven by
/// scripted processes in tests.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &LaunchRequest) -> Result<SpawnedProcess, SpawnError>;
}

// ---------------------------------------------------------------------------
// Real tokio-based spawner
// ---------------------------------------------------------------------------

/// Spawns real child processes with piped stdout/stderr. Must be called from
/// within a tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioSpawner;

impl TokioSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for TokioSpawner {
    fn spawn(&self, request: &LaunchRequest) -> Result<SpawnedProcess, SpawnError> {
        let mut child = Command::new(&request.program)
            .args(&request.args)
            .envs(&request.env)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SpawnError::NotFound(request.program.clone()),
                std::io::ErrorKind::PermissionDenied => {
                    SpawnError::PermissionDenied(request.program.clone())
                }
                _ => SpawnError::Io(e),
            })?;

        let pid = child.id();
        let (line_tx, line_rx) = flume::unbounded();
        let (signal_tx, signal_rx) = flume::unbounded::<ProcessSignal>();
        let (exit_tx, exit_rx) = watch::channel(None);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, OutputStream::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, OutputStream::Stderr, line_tx));
        }

        tokio::spawn(async move {
            let status = loop {
                let signal = tokio::select! {
                    status = child.wait() => break status,
                    signal = signal_rx.recv_async() => signal,
                };
                match signal {
                    Ok(ProcessSignal::Terminate) => terminate(&mut child),
                    Ok(ProcessSignal::Kill) => {
                        if let Err(e) = child.start_kill() {
                            debug!(error = %e, "kill after exit");
                        }
                    }
                    // Nobody can signal any more; just reap.
                    Err(_) => break child.wait().await,
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(error = %e, "failed to reap child process");
                    None
                }
            };
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        debug!(pid = ?pid, program = %request.program, "process spawned");
        Ok(SpawnedProcess::new(pid, line_rx, signal_tx, exit_rx))
    }
}

#[cfg(unix)]
fn terminate(child: &mut tokio::process::Child) {
    match child.id() {
        Some(pid) => {
            // SAFETY: plain signal delivery to a pid we spawned and have not
            // reaped yet.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(pid, "SIGTERM delivery failed");
            }
        }
        None => debug!("terminate requested after exit"),
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut tokio::process::Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "terminate after exit");
    }
}

async fn pump_lines<R>(reader: R, stream: OutputStream, tx: flume::Sender<OutputLine>)
where
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
                if tx.send_async(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, ?stream, "output pipe read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_exit_sees_late_value() {
        let (tx, rx) = watch::channel(None);
        let waiter = tokio::spawn(wait_for_exit(rx));
        tx.send(Some(ProcessExit { code: Some(3) })).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(ProcessExit { code: Some(3) }));
    }

    #[tokio::test]
    async fn wait_for_exit_without_reaper_is_none() {
        let (tx, rx) = watch::channel(None);
        drop(tx);
        assert_eq!(wait_for_exit(rx).await, None);
    }

    #[tokio::test]
    async fn missing_program_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let request = LaunchRequest::new(
            uuid::Uuid::new_v4(),
            relay_core::types::ProcessKind::TaskExecution,
            "definitely-not-a-real-binary-4711",
            dir.path(),
        );
        let err = TokioSpawner::new().spawn(&request).err().unwrap();
        assert!(matches!(err, SpawnError::NotFound(_)));
    }
}
