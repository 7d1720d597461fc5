//! TaskEngine -- the single entry point wiring the process supervisor, the
//! status reconciler and stuck-task recovery to one event bus.
//!
//! Output of running processes is turned into events by the supervisor; the
//! engine's event loop feeds those events back into the reconciler (progress,
//! exits) and launches the follow-up of chained processes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_bridge::event_bus::EventBus;
use relay_bridge::protocol::EngineEvent;
use relay_core::config::Config;
use relay_core::plan::PlanError;
use relay_core::plan_watcher::{NoopPlanWatcher, PlanWatcher};
use relay_core::types::{ProcessKind, ReviewReason, Task, TaskStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::launch::{LaunchBuilder, LaunchRequest};
use crate::reconciler::{ReconcileError, TaskReconciler};
use crate::recovery::{RecoveryManager, RecoveryOptions, RecoveryOutcome};
use crate::registry::{ProcessInfo, ProcessRegistry};
use crate::spawner::ProcessSpawner;
use crate::status_machine::{StatusEvent, StatusTransition};
use crate::supervisor::{ProcessSupervisor, SupervisorError};
use crate::worktree::{NoopWorktreeHooks, WorktreeHooks};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("task {0} has a running process")]
    Running(Uuid),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Outcome of an operation in a shape a UI can show as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl<E: std::fmt::Display> From<std::result::Result<String, E>> for OperationResult {
    fn from(result: std::result::Result<String, E>) -> Self {
        match result {
            Ok(message) => Self::ok(message),
            Err(e) => Self::failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// TaskEngine
// ---------------------------------------------------------------------------

pub struct TaskEngine {
    supervisor: ProcessSupervisor,
    reconciler: TaskReconciler,
    launcher: LaunchBuilder,
    watcher: Arc<dyn PlanWatcher>,
    hooks: Arc<dyn WorktreeHooks>,
    event_bus: EventBus,
}

impl TaskEngine {
    pub fn new(config: Config, spawner: Arc<dyn ProcessSpawner>, event_bus: EventBus) -> Self {
        let supervisor = ProcessSupervisor::new(ProcessRegistry::new(), spawner, event_bus.clone())
            .with_kill_grace(config.execution.kill_grace());
        Self {
            supervisor,
            reconciler: TaskReconciler::new(config.clone(), event_bus.clone()),
            launcher: LaunchBuilder::new(config),
            watcher: Arc::new(NoopPlanWatcher::default()),
            hooks: Arc::new(NoopWorktreeHooks),
            event_bus,
        }
    }

    pub fn with_plan_watcher(mut self, watcher: Arc<dyn PlanWatcher>) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_worktree_hooks(mut self, hooks: Arc<dyn WorktreeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Override the graceful-kill window (tests use a short one).
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.supervisor = self.supervisor.with_kill_grace(grace);
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn subscribe(&self) -> flume::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    pub fn config(&self) -> &Config {
        self.launcher.config()
    }

    // -- tasks --------------------------------------------------------------

    pub fn register_task(&self, task: Task) {
        info!(task_id = %task.id, spec_id = %task.spec_id, status = %task.status, "task registered");
        self.reconciler.register(task);
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.reconciler.task(task_id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.reconciler.tasks()
    }

    /// Refused while the task still has a process.
    pub fn delete_task(&self, task_id: Uuid) -> OperationResult {
        if self.supervisor.is_running(task_id) {
            return OperationResult::failed(EngineError::Running(task_id).to_string());
        }
        match self.reconciler.remove(task_id) {
            Some(task) => {
                self.watcher.unwatch(task_id);
                info!(task_id = %task_id, "task deleted");
                OperationResult::ok(format!("Deleted task {}", task.spec_id))
            }
            None => OperationResult::failed(EngineError::TaskNotFound(task_id).to_string()),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Move the task to `in_progress` and launch its process. A task whose
    /// spec was never produced starts with spec creation when a description
    /// is available; a plan that only records a status does not count.
    pub fn start_task(&self, task_id: Uuid, description: Option<&str>) -> Result<ProcessInfo> {
        let task = self.require(task_id)?;
        let store = self.reconciler.plan_store(&task);
        let description = description.or(task.description.as_deref());

        let request = match description {
            Some(desc) if !store.has_spec(&task.spec_id) => self.launcher.spec_creation(&task, desc),
            _ => self.launcher.follow_up(&task, ProcessKind::TaskExecution),
        };

        let previous = task.status;
        self.reconciler.apply(task_id, StatusEvent::StartRequested)?;
        self.launch(&task, request).map_err(|e| {
            self.revert_status(task_id, previous);
            e
        })
    }

    /// Kill the task's process (if any) and put it back in the backlog.
    pub fn stop_task(&self, task_id: Uuid) -> OperationResult {
        let killed = self.supervisor.kill(task_id);
        self.watcher.unwatch(task_id);
        let result = self
            .reconciler
            .apply(task_id, StatusEvent::Stopped)
            .map(|_| {
                if killed {
                    "Task stopped".to_string()
                } else {
                    "Task moved to backlog; no process was running".to_string()
                }
            });
        OperationResult::from(result)
    }

    /// Explicit status change from the board. Moving a task to
    /// `in_progress` while nothing runs starts it.
    pub fn update_status(&self, task_id: Uuid, status: TaskStatus) -> Result<TaskStatus> {
        if status == TaskStatus::InProgress && !self.supervisor.is_running(task_id) {
            self.start_task(task_id, None)?;
            return Ok(TaskStatus::InProgress);
        }
        let transition = self.reconciler.apply(task_id, StatusEvent::Explicit(status))?;
        Ok(transition.to)
    }

    /// Human review decision. Approval records it and finishes the task;
    /// rejection records the feedback and starts a QA fix run.
    pub async fn review(&self, task_id: Uuid, approved: bool, feedback: Option<&str>) -> Result<StatusTransition> {
        let task = self.require(task_id)?;
        let event = if approved {
            StatusEvent::Approved
        } else {
            StatusEvent::Rejected
        };
        self.reconciler.check(task_id, event)?;
        let store = self.reconciler.plan_store(&task);

        if approved {
            let path = store.write_approval(&task.spec_id, Utc::now())?;
            debug!(task_id = %task_id, path = %path.display(), "approval recorded");
            let transition = self.reconciler.apply(task_id, event)?;
            if let Err(e) = self.hooks.on_approved(&task).await {
                warn!(task_id = %task_id, error = %e, "worktree approval hook failed");
            }
            return Ok(transition);
        }

        let feedback = feedback.unwrap_or("No feedback provided");
        let path = store.write_fix_request(&task.spec_id, feedback, Utc::now())?;
        debug!(task_id = %task_id, path = %path.display(), "fix request recorded");
        let transition = self.reconciler.apply(task_id, event)?;
        if let Err(e) = self.hooks.on_rejected(&task).await {
            warn!(task_id = %task_id, error = %e, "worktree rejection hook failed");
        }
        if let Err(e) = self.launch(&task, self.launcher.qa_process(&task)) {
            self.mark_errored(task_id);
            return Err(e);
        }
        Ok(transition)
    }

    pub fn recover_stuck_task(&self, task_id: Uuid, options: RecoveryOptions) -> RecoveryOutcome {
        let manager = RecoveryManager::new(
            &self.supervisor,
            &self.reconciler,
            self.watcher.as_ref(),
            &self.launcher,
        );
        manager.recover(task_id, options).unwrap_or_else(|e| {
            warn!(task_id = %task_id, error = %e, "recovery refused");
            RecoveryOutcome::failed(task_id, &e)
        })
    }

    /// Status says a process should be running but none is.
    pub fn is_stuck(&self, task_id: Uuid) -> bool {
        self.reconciler
            .status(task_id)
            .is_some_and(|s| s.implies_running() && !self.supervisor.is_running(task_id))
    }

    pub fn stuck_tasks(&self) -> Vec<Task> {
        self.tasks()
            .into_iter()
            .filter(|t| self.is_stuck(t.id))
            .collect()
    }

    pub fn is_running(&self, task_id: Uuid) -> bool {
        self.supervisor.is_running(task_id)
    }

    pub fn running(&self) -> Vec<ProcessInfo> {
        self.supervisor.list_running()
    }

    /// Kill every process and wait for them to go away. Statuses are left as
    /// they are; the tasks show up as stuck next time.
    pub async fn shutdown(&self) {
        info!(running = self.supervisor.list_running().len(), "engine shutting down");
        self.supervisor.shutdown().await;
    }

    // -- event loop ---------------------------------------------------------

    /// React to one bus event.
    pub fn handle_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::ExecutionProgress { task_id, progress } => {
                if let Err(e) = self.reconciler.on_progress(*task_id, progress.clone()) {
                    debug!(task_id = %task_id, error = %e, "progress not applied");
                }
            }
            EngineEvent::Exit {
                task_id,
                handle_id,
                kind,
                code,
                chained,
            } => {
                // The pump drops its own entry before announcing the exit, so
                // any process still registered is a later launch.
                if let Some(current) = self.supervisor.process(*task_id) {
                    debug!(
                        task_id = %task_id,
                        stale = %handle_id,
                        current = %current.handle_id,
                        "ignoring exit of a replaced process"
                    );
                    return;
                }
                self.on_exit(*task_id, *kind, *code, *chained)
            }
            EngineEvent::PlanChanged { task_id, .. } => {
                if let Err(e) = self.reconciler.refresh_chunks(*task_id) {
                    debug!(task_id = %task_id, error = %e, "plan refresh failed");
                }
            }
            _ => {}
        }
    }

    /// Consume `events` until the bus goes away. Handlers read and write plan
    /// files, so each one runs on the blocking pool; they still run one at a
    /// time and in bus order.
    pub async fn run_event_loop(self: Arc<Self>, events: flume::Receiver<EngineEvent>) {
        while let Ok(event) = events.recv_async().await {
            let engine = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || engine.handle_event(&event)).await {
                warn!(error = %e, "event handler panicked");
            }
        }
        debug!("engine event loop finished");
    }

    /// Subscribe now and drive [`run_event_loop`](Self::run_event_loop) on a
    /// background task. Events published after this returns are handled.
    pub fn spawn_event_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.subscribe();
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_event_loop(events).await })
    }

    fn on_exit(&self, task_id: Uuid, kind: ProcessKind, code: Option<i32>, chained: Option<ProcessKind>) {
        self.watcher.unwatch(task_id);

        if let Some(next) = chained {
            let Some(task) = self.task(task_id) else { return };
            info!(task_id = %task_id, from = %kind, next = %next, "launching chained process");
            if let Err(e) = self.launch(&task, self.launcher.follow_up(&task, next)) {
                warn!(task_id = %task_id, error = %e, "chained launch failed");
                self.mark_errored(task_id);
            }
            return;
        }

        if kind.exits_to_review() {
            if let Err(e) = self.reconciler.on_exit(task_id, kind, code) {
                warn!(task_id = %task_id, error = %e, "exit not reconciled");
            }
        } else if code != Some(0) {
            // Spec creation failed, so there is nothing to chain into.
            self.mark_errored(task_id);
        }
    }

    fn launch(&self, task: &Task, request: LaunchRequest) -> Result<ProcessInfo> {
        let info = self.supervisor.start(request)?;
        let plan_path = self.reconciler.plan_store(task).plan_path(&task.spec_id);
        if let Err(e) = self.watcher.watch(task.id, &plan_path) {
            warn!(task_id = %task.id, error = %e, "could not watch plan");
        }
        Ok(info)
    }

    fn revert_status(&self, task_id: Uuid, previous: TaskStatus) {
        if let Err(e) = self.reconciler.apply(task_id, StatusEvent::Explicit(previous)) {
            warn!(task_id = %task_id, error = %e, "could not revert status after failed start");
        }
    }

    fn mark_errored(&self, task_id: Uuid) {
        if let Err(e) = self
            .reconciler
            .apply(task_id, StatusEvent::ProcessExited(ReviewReason::Errors))
        {
            warn!(task_id = %task_id, error = %e, "could not route task to review");
        }
    }

    fn require(&self, task_id: Uuid) -> Result<Task> {
        self.task(task_id).ok_or(EngineError::TaskNotFound(task_id))
    }
}
