#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relay_bridge::protocol::{EngineEvent, OutputStream};
use relay_engine::launch::LaunchRequest;
use relay_engine::spawner::{
    OutputLine, ProcessExit, ProcessSignal, ProcessSpawner, SpawnError, SpawnedProcess,
};
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// MockSpawner
// ---------------------------------------------------------------------------

/// What a scripted process does once spawned.
#[derive(Debug, Clone)]
pub enum Script {
    /// Print `lines`, then exit with `code`.
    Exit { lines: Vec<String>, code: Option<i32> },
    /// Print `lines`, then run until signalled. Ignores SIGTERM unless
    /// `obeys_terminate`.
    Hang { lines: Vec<String>, obeys_terminate: bool },
    /// The program cannot be found.
    Missing,
}

impl Script {
    pub fn exit(lines: &[&str], code: i32) -> Self {
        Script::Exit {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            code: Some(code),
        }
    }

    pub fn hang(lines: &[&str]) -> Self {
        Script::Hang {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            obeys_terminate: true,
        }
    }

    pub fn stubborn() -> Self {
        Script::Hang {
            lines: Vec::new(),
            obeys_terminate: false,
        }
    }
}

pub struct MockSpawner {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<LaunchRequest>>,
    signals: Arc<Mutex<Vec<ProcessSignal>>>,
}

impl MockSpawner {
    pub fn new(fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            signals: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Scripts used for the next spawns, in order, before the fallback.
    pub fn queue(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn signals(&self) -> Vec<ProcessSignal> {
        self.signals.lock().unwrap().clone()
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(&self, request: &LaunchRequest) -> Result<SpawnedProcess, SpawnError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.requests.lock().unwrap().push(request.clone());

        let (line_tx, line_rx) = flume::unbounded();
        let (signal_tx, signal_rx) = flume::unbounded();
        let (exit_tx, exit_rx) = watch::channel(None);

        match script {
            Script::Missing => return Err(SpawnError::NotFound(request.program.clone())),
            Script::Exit { lines, code } => {
                for text in lines {
                    line_tx
                        .send(OutputLine {
                            stream: OutputStream::Stdout,
                            text,
                        })
                        .unwrap();
                }
                drop(line_tx);
                exit_tx.send(Some(ProcessExit { code })).unwrap();
            }
            Script::Hang {
                lines,
                obeys_terminate,
            } => {
                for text in lines {
                    line_tx
                        .send(OutputLine {
                            stream: OutputStream::Stdout,
                            text,
                        })
                        .unwrap();
                }
                let recorded = Arc::clone(&self.signals);
                tokio::spawn(async move {
                    while let Ok(signal) = signal_rx.recv_async().await {
                        recorded.lock().unwrap().push(signal);
                        if signal == ProcessSignal::Kill || obeys_terminate {
                            break;
                        }
                    }
                    drop(line_tx);
                    let _ = exit_tx.send(Some(ProcessExit { code: None }));
                });
            }
        }

        Ok(SpawnedProcess::new(Some(4242), line_rx, signal_tx, exit_rx))
    }
}

// ---------------------------------------------------------------------------
// Event helpers
// ---------------------------------------------------------------------------

/// Wait for the first event matching `pred`, returning everything seen up to
/// and including it.
pub async fn events_until<F>(rx: &flume::Receiver<EngineEvent>, mut pred: F) -> Vec<EngineEvent>
where
    F: FnMut(&EngineEvent) -> bool,
{
    let mut seen = Vec::new();
    let deadline = Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout(deadline, rx.recv_async())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Drain whatever arrives within `window`.
pub async fn drain_for(rx: &flume::Receiver<EngineEvent>, window: Duration) -> Vec<EngineEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, rx.recv_async()).await {
        seen.push(event);
    }
    seen
}

pub fn is_exit(event: &EngineEvent) -> bool {
    matches!(event, EngineEvent::Exit { .. })
}
