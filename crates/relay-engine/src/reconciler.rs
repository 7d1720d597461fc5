//! Task status reconciliation. Every transition is written to the task's
//! plan file first and only then committed in memory and announced, so a
//! consumer reacting to a `StatusChange` can safely re-read the plan.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use relay_bridge::event_bus::EventBus;
use relay_bridge::protocol::EngineEvent;
use relay_core::config::Config;
use relay_core::plan::{PlanError, PlanStore};
use relay_core::types::{ExecutionPhase, ExecutionProgress, ProcessKind, ReviewReason, Task, TaskStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::status_machine::{StatusError, StatusEvent, StatusMachine, StatusTransition};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// What a recovery wrote to the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRecord {
    pub status: TaskStatus,
    pub reset_chunks: Vec<String>,
}

// ---------------------------------------------------------------------------
// TaskReconciler
// ---------------------------------------------------------------------------

struct TrackedTask {
    task: Task,
    machine: StatusMachine,
}

pub struct TaskReconciler {
    tasks: Mutex<HashMap<Uuid, TrackedTask>>,
    config: Config,
    event_bus: EventBus,
}

impl TaskReconciler {
    pub fn new(config: Config, event_bus: EventBus) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            config,
            event_bus,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn plan_store(&self, task: &Task) -> PlanStore {
        PlanStore::for_project(&task.project_path, &self.config)
    }

    /// Track `task`, replacing any earlier registration with the same id.
    /// Chunks are read from the plan when the task carries none.
    pub fn register(&self, mut task: Task) {
        if task.chunks.is_empty() {
            match self.plan_store(&task).load_or_synthesize(&task.spec_id) {
                Ok(plan) => task.chunks = plan.all_chunks(),
                Err(e) => warn!(task_id = %task.id, error = %e, "could not read plan on register"),
            }
        }
        let machine = StatusMachine::new(task.status).with_review_reason(task.review_reason);
        self.lock().insert(task.id, TrackedTask { task, machine });
    }

    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.lock().get(&task_id).map(|t| t.task.clone())
    }

    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().values().map(|t| t.task.clone()).collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn remove(&self, task_id: Uuid) -> Option<Task> {
        self.lock().remove(&task_id).map(|t| t.task)
    }

    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.lock().get(&task_id).map(|t| t.machine.status())
    }

    /// Whether `event` would be accepted right now.
    pub fn check(&self, task_id: Uuid, event: StatusEvent) -> Result<()> {
        let tasks = self.lock();
        let tracked = tasks.get(&task_id).ok_or(ReconcileError::TaskNotFound(task_id))?;
        tracked.machine.plan(event)?;
        Ok(())
    }

    /// Apply `event`: persist, commit, announce. A failed plan write leaves
    /// the task unchanged.
    pub fn apply(&self, task_id: Uuid, event: StatusEvent) -> Result<StatusTransition> {
        let transition = {
            let mut tasks = self.lock();
            let tracked = tasks
                .get_mut(&task_id)
                .ok_or(ReconcileError::TaskNotFound(task_id))?;
            let transition = tracked.machine.plan(event)?;

            let store = self.plan_store(&tracked.task);
            let mut plan = store.load_or_synthesize(&tracked.task.spec_id)?;
            plan.set_status(transition.to, transition.review_reason);
            store.persist(&tracked.task.spec_id, &plan)?;

            tracked.machine.commit(transition);
            tracked.task.set_status(transition.to, transition.review_reason);
            tracked.task.chunks = plan.all_chunks();
            transition
        };

        info!(
            task_id = %task_id,
            from = %transition.from,
            to = %transition.to,
            reason = ?transition.review_reason,
            "task status changed"
        );
        self.publish_status(task_id, transition.to, transition.review_reason);
        Ok(transition)
    }

    /// Record live progress. Entering `qa_review` moves an in-progress task
    /// to `ai_review`.
    pub fn on_progress(&self, task_id: Uuid, progress: ExecutionProgress) -> Result<Option<StatusTransition>> {
        let enters_review = {
            let mut tasks = self.lock();
            let tracked = tasks
                .get_mut(&task_id)
                .ok_or(ReconcileError::TaskNotFound(task_id))?;
            let enters_review = progress.phase == ExecutionPhase::QaReview
                && tracked.machine.status() == TaskStatus::InProgress;
            tracked.task.execution_progress = Some(progress);
            enters_review
        };
        if enters_review {
            return self.apply(task_id, StatusEvent::AiReviewStarted).map(Some);
        }
        Ok(None)
    }

    /// Route a process exit. Execution and QA processes always land in human
    /// review; the reason distinguishes a clean exit from a failure and a
    /// clean exit whose QA sign-off was a rejection.
    pub fn on_exit(&self, task_id: Uuid, kind: ProcessKind, code: Option<i32>) -> Result<Option<StatusTransition>> {
        if !kind.exits_to_review() {
            return Ok(None);
        }
        let reason = if code == Some(0) {
            let task = self.task(task_id).ok_or(ReconcileError::TaskNotFound(task_id))?;
            let qa_rejected = self
                .plan_store(&task)
                .load_or_synthesize(&task.spec_id)
                .map(|plan| plan.qa_rejected())
                .unwrap_or(false);
            if qa_rejected {
                ReviewReason::QaRejected
            } else {
                ReviewReason::Completed
            }
        } else {
            ReviewReason::Errors
        };
        self.apply(task_id, StatusEvent::ProcessExited(reason)).map(Some)
    }

    /// Re-read the task's chunks after the plan changed on disk.
    pub fn refresh_chunks(&self, task_id: Uuid) -> Result<()> {
        let task = self.task(task_id).ok_or(ReconcileError::TaskNotFound(task_id))?;
        let plan = self.plan_store(&task).load_or_synthesize(&task.spec_id)?;
        if let Some(tracked) = self.lock().get_mut(&task_id) {
            tracked.task.chunks = plan.all_chunks();
        }
        Ok(())
    }

    /// Rewrite the plan of a task whose process vanished: infer or take the
    /// target status, reset interrupted chunks, annotate the recovery. With
    /// `auto_restart` the final status is `in_progress` whatever was
    /// inferred. Nothing is announced; call [`notify_status`](Self::notify_status)
    /// once the recovery is complete.
    pub fn persist_recovery(
        &self,
        task_id: Uuid,
        target: Option<TaskStatus>,
        auto_restart: bool,
    ) -> Result<RecoveryRecord> {
        let mut tasks = self.lock();
        let tracked = tasks
            .get_mut(&task_id)
            .ok_or(ReconcileError::TaskNotFound(task_id))?;
        let store = self.plan_store(&tracked.task);
        let mut plan = store.load_or_synthesize(&tracked.task.spec_id)?;

        let inferred = target.unwrap_or_else(|| plan.infer_status());
        let reset_chunks = plan.reset_interrupted_chunks();
        let status = if auto_restart {
            TaskStatus::InProgress
        } else {
            inferred
        };
        let transition = tracked.machine.plan(StatusEvent::Recovered(status))?;

        plan.set_status(status, None);
        plan.mark_recovered(Utc::now());
        store.persist(&tracked.task.spec_id, &plan)?;

        tracked.machine.commit(transition);
        tracked.task.set_status(status, None);
        tracked.task.chunks = plan.all_chunks();
        tracked.task.execution_progress = None;

        info!(
            task_id = %task_id,
            status = %status,
            reset = reset_chunks.len(),
            "stuck task recovered"
        );
        Ok(RecoveryRecord { status, reset_chunks })
    }

    /// Announce the task's current status.
    pub fn notify_status(&self, task_id: Uuid) -> Result<()> {
        let (status, reason) = {
            let tasks = self.lock();
            let tracked = tasks.get(&task_id).ok_or(ReconcileError::TaskNotFound(task_id))?;
            (tracked.machine.status(), tracked.machine.review_reason())
        };
        self.publish_status(task_id, status, reason);
        Ok(())
    }

    fn publish_status(&self, task_id: Uuid, status: TaskStatus, review_reason: Option<ReviewReason>) {
        self.event_bus.publish(EngineEvent::StatusChange {
            task_id,
            status,
            review_reason,
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, TrackedTask>> {
        self.tasks.lock().unwrap_or_else(|e| {
            warn!("reconciler lock was poisoned, recovering");
            e.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::plan::PlanLoad;

    fn setup() -> (tempfile::TempDir, TaskReconciler, EventBus, Task) {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let reconciler = TaskReconciler::new(Config::default(), bus.clone());
        let task = Task::new("001-auth", "Add auth", dir.path());
        reconciler.register(task.clone());
        (dir, reconciler, bus, task)
    }

    #[test]
    fn transition_is_written_before_announcement() {
        let (_dir, reconciler, bus, task) = setup();
        let rx = bus.subscribe();
        reconciler.apply(task.id, StatusEvent::StartRequested).unwrap();

        let event = rx.try_recv().unwrap();
        assert!(matches!(
            event,
            EngineEvent::StatusChange {
                status: TaskStatus::InProgress,
                ..
            }
        ));
        // By the time the event is seen the plan already says so.
        let store = reconciler.plan_store(&task);
        let PlanLoad::Loaded(plan) = store.load(&task.spec_id).unwrap() else {
            panic!("plan not written");
        };
        assert_eq!(plan.status, Some(TaskStatus::InProgress));
        assert_eq!(plan.plan_status.as_deref(), Some("in_progress"));
    }

    #[test]
    fn invalid_event_changes_nothing() {
        let (_dir, reconciler, bus, task) = setup();
        let rx = bus.subscribe();
        let err = reconciler.apply(task.id, StatusEvent::Approved).unwrap_err();
        assert!(matches!(err, ReconcileError::Status(_)));
        assert_eq!(reconciler.status(task.id), Some(TaskStatus::Backlog));
        assert!(rx.try_recv().is_err());
        assert!(!reconciler.plan_store(&task).exists(&task.spec_id));
    }

    #[test]
    fn failed_exit_routes_to_review_with_errors() {
        let (_dir, reconciler, _bus, task) = setup();
        reconciler.apply(task.id, StatusEvent::StartRequested).unwrap();
        let t = reconciler
            .on_exit(task.id, ProcessKind::TaskExecution, Some(1))
            .unwrap()
            .unwrap();
        assert_eq!(t.to, TaskStatus::HumanReview);
        assert_eq!(t.review_reason, Some(ReviewReason::Errors));
        assert_eq!(reconciler.task(task.id).unwrap().review_reason, Some(ReviewReason::Errors));
    }

    #[test]
    fn spec_creation_exit_does_not_move_status() {
        let (_dir, reconciler, _bus, task) = setup();
        reconciler.apply(task.id, StatusEvent::StartRequested).unwrap();
        assert!(reconciler
            .on_exit(task.id, ProcessKind::SpecCreation, Some(0))
            .unwrap()
            .is_none());
        assert_eq!(reconciler.status(task.id), Some(TaskStatus::InProgress));
    }

    #[test]
    fn qa_review_phase_moves_to_ai_review() {
        let (_dir, reconciler, _bus, task) = setup();
        reconciler.apply(task.id, StatusEvent::StartRequested).unwrap();
        let progress = ExecutionProgress {
            phase: ExecutionPhase::QaReview,
            phase_progress: 10,
            overall_progress: 82,
            ..ExecutionProgress::default()
        };
        let t = reconciler.on_progress(task.id, progress.clone()).unwrap().unwrap();
        assert_eq!(t.to, TaskStatus::AiReview);
        // Repeated qa lines do not transition again.
        assert!(reconciler.on_progress(task.id, progress).unwrap().is_none());
    }

    #[test]
    fn unknown_task_is_reported() {
        let (_dir, reconciler, _bus, _task) = setup();
        assert!(matches!(
            reconciler.apply(Uuid::new_v4(), StatusEvent::Stopped),
            Err(ReconcileError::TaskNotFound(_))
        ));
    }
}
