use relay_core::plan_watcher::PlanWatcher;
use relay_core::types::TaskStatus;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::launch::{should_run_parallel, LaunchBuilder};
use crate::reconciler::{ReconcileError, TaskReconciler};
use crate::supervisor::ProcessSupervisor;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error("task {0} is still running; stop it first before recovering")]
    StillRunning(Uuid),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

// ---------------------------------------------------------------------------
// Options / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOptions {
    /// Status to recover to; inferred from chunk completion when absent.
    pub target_status: Option<TaskStatus>,
    pub auto_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub task_id: Uuid,
    pub success: bool,
    pub message: String,
    pub new_status: Option<TaskStatus>,
    pub reset_chunks: Vec<String>,
    pub auto_restarted: bool,
}

impl RecoveryOutcome {
    pub fn failed(task_id: Uuid, error: &RecoveryError) -> Self {
        Self {
            task_id,
            success: false,
            message: error.to_string(),
            new_status: None,
            reset_chunks: Vec::new(),
            auto_restarted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveryManager
// ---------------------------------------------------------------------------

/// Brings a stuck task (status says running, no process exists) back in
/// line with its persisted plan.
pub struct RecoveryManager<'a> {
    supervisor: &'a ProcessSupervisor,
    reconciler: &'a TaskReconciler,
    watcher: &'a dyn PlanWatcher,
    launcher: &'a LaunchBuilder,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(
        supervisor: &'a ProcessSupervisor,
        reconciler: &'a TaskReconciler,
        watcher: &'a dyn PlanWatcher,
        launcher: &'a LaunchBuilder,
    ) -> Self {
        Self {
            supervisor,
            reconciler,
            watcher,
            launcher,
        }
    }

    pub fn recover(&self, task_id: Uuid, options: RecoveryOptions) -> Result<RecoveryOutcome> {
        if self.supervisor.is_running(task_id) {
            return Err(RecoveryError::StillRunning(task_id));
        }
        if self.reconciler.task(task_id).is_none() {
            return Err(RecoveryError::TaskNotFound(task_id));
        }

        let record = self
            .reconciler
            .persist_recovery(task_id, options.target_status, options.auto_restart)?;

        if self.watcher.unwatch(task_id) {
            info!(task_id = %task_id, "dropped stale plan watch");
        }

        let mut auto_restarted = false;
        let mut message = format!("Task recovered to {}", record.status);
        if options.auto_restart {
            match self.restart(task_id) {
                Ok(()) => {
                    auto_restarted = true;
                    message.push_str(" and restarted");
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "restart after recovery failed");
                    message.push_str(&format!("; restart failed: {e}"));
                }
            }
        }

        self.reconciler.notify_status(task_id)?;
        Ok(RecoveryOutcome {
            task_id,
            success: true,
            message,
            new_status: Some(record.status),
            reset_chunks: record.reset_chunks,
            auto_restarted,
        })
    }

    fn restart(&self, task_id: Uuid) -> std::result::Result<(), String> {
        let task = self
            .reconciler
            .task(task_id)
            .ok_or_else(|| format!("task {task_id} disappeared"))?;
        let parallel = should_run_parallel(
            task.pending_chunk_count(),
            self.launcher.config().execution.parallel_enabled,
        );
        let request = self.launcher.task_execution(&task, parallel);
        self.supervisor.start(request).map_err(|e| e.to_string())?;

        let plan_path = self.reconciler.plan_store(&task).plan_path(&task.spec_id);
        if let Err(e) = self.watcher.watch(task_id, &plan_path) {
            warn!(task_id = %task_id, error = %e, "could not watch plan after restart");
        }
        Ok(())
    }
}
