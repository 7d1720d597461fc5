use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use relay_bridge::event_bus::EventBus;
use relay_bridge::protocol::{EngineEvent, StreamMarker};
use relay_core::types::{ExecutionProgress, ProcessKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::launch::LaunchRequest;
use crate::phase_detector::{detect_phase, Detection};
use crate::progress::ProgressTracker;
use crate::registry::{AgentProcessHandle, ProcessInfo, ProcessRegistry};
use crate::spawner::{wait_for_exit, OutputLine, ProcessExit, ProcessSignal, ProcessSpawner, SpawnError};

/// Default delay between the graceful and the forced termination signal.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {kind} process for task {task_id}: {source}")]
    Spawn {
        task_id: Uuid,
        kind: ProcessKind,
        #[source]
        source: SpawnError,
    },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

/// Owns the task -> process table. At most one process runs per task; a new
/// start for the same task terminates the old one first.
///
/// Every operation must be called from within a tokio runtime since output
/// pumping and kill escalation run as spawned tasks.
pub struct ProcessSupervisor {
    registry: ProcessRegistry,
    spawner: Arc<dyn ProcessSpawner>,
    event_bus: EventBus,
    kill_grace: Duration,
    escalations: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Supervisor over `registry` that starts processes through `spawner`
    /// and reports on `event_bus`.
    pub fn new(registry: ProcessRegistry, spawner: Arc<dyn ProcessSpawner>, event_bus: EventBus) -> Self {
        Self {
            registry,
            spawner,
            event_bus,
            kill_grace: DEFAULT_KILL_GRACE,
            escalations: Mutex::new(Vec::new()),
        }
    }

    /// Override how long a terminated process gets before the forced kill.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Bus every process event is published on.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Spawn the process described by `request`, replacing any process the
    /// task already has.
    pub fn start(&self, request: LaunchRequest) -> Result<ProcessInfo> {
        let task_id = request.task_id;
        if let Some(previous) = self.registry.remove(task_id) {
            info!(task_id = %task_id, kind = %previous.kind, "replacing running process");
            self.terminate(previous);
        }

        let spawned = match self.spawner.spawn(&request) {
            Ok(spawned) => spawned,
            Err(source) => {
                warn!(task_id = %task_id, kind = %request.kind, error = %source, "spawn failed");
                self.event_bus.publish(EngineEvent::Error {
                    task_id,
                    message: source.to_string(),
                });
                return Err(SupervisorError::Spawn {
                    task_id,
                    kind: request.kind,
                    source,
                });
            }
        };

        let handle = AgentProcessHandle {
            handle_id: Uuid::new_v4(),
            task_id,
            kind: request.kind,
            pid: spawned.pid,
            started_at: Utc::now(),
            project_path: request.project_path.clone(),
            signals: spawned.signals.clone(),
            exit: spawned.exit.clone(),
        };
        let info = handle.info();
        let pump = OutputPump {
            task_id,
            handle_id: handle.handle_id,
            kind: request.kind,
            chained: request.chain.map(|c| c.next),
            registry: self.registry.clone(),
            event_bus: self.event_bus.clone(),
        };

        // A concurrent start may have slipped in between remove and insert.
        if let Some(displaced) = self.registry.insert(handle) {
            self.terminate(displaced);
        }
        info!(task_id = %task_id, kind = %request.kind, pid = ?spawned.pid, "process started");

        self.event_bus.publish(EngineEvent::ExecutionProgress {
            task_id,
            progress: ExecutionProgress::starting(),
        });
        tokio::spawn(pump.run(spawned.lines, spawned.exit));
        Ok(info)
    }

    /// Ask the task's process to stop. The handle is dropped immediately so a
    /// following `start` is never blocked; escalation to a forced kill runs in
    /// the background. Returns whether the task had a process.
    pub fn kill(&self, task_id: Uuid) -> bool {
        match self.registry.remove(task_id) {
            Some(handle) => {
                info!(task_id = %task_id, kind = %handle.kind, "killing process");
                self.terminate(handle);
                true
            }
            None => false,
        }
    }

    /// Terminate every tracked process. Returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let handles = self.registry.drain();
        let count = handles.len();
        for handle in handles {
            self.terminate(handle);
        }
        if count > 0 {
            info!(count, "killed all processes");
        }
        count
    }

    /// Kill everything and wait until each process has exited or been
    /// force-killed.
    pub async fn shutdown(&self) {
        self.kill_all();
        let pending: Vec<_> = std::mem::take(&mut *self.lock_escalations());
        for task in pending {
            if let Err(e) = task.await {
                warn!(error = %e, "kill escalation task failed");
            }
        }
    }

    /// Whether the task currently has a process.
    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.registry.contains(task_id)
    }

    /// The task's current launch, if any.
    pub fn process(&self, task_id: Uuid) -> Option<ProcessInfo> {
        self.registry.get(task_id)
    }

    /// Every process still tracked.
    pub fn list_running(&self) -> Vec<ProcessInfo> {
        self.registry.list()
    }

    /// Graceful signal now; forced kill if the process is still around once
    /// the grace period is over. An exit inside the window cancels the
    /// forced kill.
    fn terminate(&self, handle: AgentProcessHandle) {
        let AgentProcessHandle {
            task_id,
            signals,
            exit,
            ..
        } = handle;
        if signals.send(ProcessSignal::Terminate).is_err() {
            debug!(task_id = %task_id, "process already gone");
            return;
        }
        let grace = self.kill_grace;
        let escalation = tokio::spawn(escalate(task_id, grace, signals, exit));

        let mut escalations = self.lock_escalations();
        escalations.retain(|t| !t.is_finished());
        escalations.push(escalation);
    }

    fn lock_escalations(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.escalations.lock().unwrap_or_else(|e| {
            warn!("supervisor lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

async fn escalate(
    task_id: Uuid,
    grace: Duration,
    signals: flume::Sender<ProcessSignal>,
    exit: watch::Receiver<Option<ProcessExit>>,
) {
    match tokio::time::timeout(grace, wait_for_exit(exit)).await {
        Ok(_) => debug!(task_id = %task_id, "process exited within grace period"),
        Err(_) => {
            warn!(task_id = %task_id, grace_secs = grace.as_secs_f64(), "grace period elapsed, forcing kill");
            let _ = signals.send(ProcessSignal::Kill);
        }
    }
}

// ---------------------------------------------------------------------------
// Output pump
// ---------------------------------------------------------------------------

/// Per-process reader loop. Everything for one process is published from
/// here, so its events stay in line order.
struct OutputPump {
    task_id: Uuid,
    handle_id: Uuid,
    kind: ProcessKind,
    chained: Option<ProcessKind>,
    registry: ProcessRegistry,
    event_bus: EventBus,
}

impl OutputPump {
    async fn run(
        self,
        lines: flume::Receiver<OutputLine>,
        exit: watch::Receiver<Option<ProcessExit>>,
    ) {
        let mut tracker = ProgressTracker::new();
        while let Ok(line) = lines.recv_async().await {
            self.on_line(&mut tracker, line);
        }

        let code = wait_for_exit(exit).await.and_then(|e| e.code);
        // Killed or replaced processes were already removed; they end silently.
        if self.registry.remove_if_current(self.task_id, self.handle_id).is_none() {
            debug!(task_id = %self.task_id, "process ended after removal");
            return;
        }
        info!(task_id = %self.task_id, kind = %self.kind, code = ?code, "process exited");

        let succeeded = code == Some(0);
        let chained = self.chained.filter(|_| succeeded);
        if chained.is_none() {
            self.event_bus.publish(EngineEvent::ExecutionProgress {
                task_id: self.task_id,
                progress: tracker.finish(code),
            });
        }
        self.event_bus.publish(EngineEvent::Exit {
            task_id: self.task_id,
            handle_id: self.handle_id,
            kind: self.kind,
            code,
            chained,
        });
    }

    fn on_line(&self, tracker: &mut ProgressTracker, line: OutputLine) {
        let marker = StreamMarker::parse(&line.text);
        let detection = detect_phase(&line.text, self.kind, tracker.phase());
        self.event_bus.publish(EngineEvent::Log {
            task_id: self.task_id,
            stream: line.stream,
            line: line.text,
        });
        if let Some(marker) = marker {
            self.event_bus.publish(EngineEvent::StreamMarker {
                task_id: self.task_id,
                marker,
            });
        }
        if let Detection::Transition(update) = detection {
            debug!(task_id = %self.task_id, phase = %update.phase, "phase transition");
            self.event_bus.publish(EngineEvent::ExecutionProgress {
                task_id: self.task_id,
                progress: tracker.apply(&update),
            });
        }
    }
}
