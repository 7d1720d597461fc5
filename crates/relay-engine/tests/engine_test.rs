mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{drain_for, events_until, is_exit, MockSpawner, Script};
use relay_bridge::event_bus::EventBus;
use relay_bridge::protocol::EngineEvent;
use relay_core::config::Config;
use relay_core::plan::{Plan, PlanLoad, PlanPhase, PlanStore, APPROVAL_FILE_NAME, FIX_REQUEST_FILE_NAME};
use relay_core::types::{Chunk, ChunkStatus, ExecutionPhase, ProcessKind, ReviewReason, Task, TaskStatus};
use relay_engine::engine::{EngineError, TaskEngine};
use relay_engine::worktree::WorktreeHooks;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingHooks {
    calls: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl WorktreeHooks for RecordingHooks {
    async fn on_approved(&self, task: &Task) -> Result<(), String> {
        self.calls.lock().unwrap().push(format!("approved:{}", task.spec_id));
        Ok(())
    }

    async fn on_rejected(&self, task: &Task) -> Result<(), String> {
        self.calls.lock().unwrap().push(format!("rejected:{}", task.spec_id));
        Err("worktree busy".into())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    engine: Arc<TaskEngine>,
    spawner: Arc<MockSpawner>,
    hooks: Arc<RecordingHooks>,
    events: flume::Receiver<EngineEvent>,
    store: PlanStore,
    task: Task,
}

fn harness(fallback: Script, status: TaskStatus) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::default();
    let store = PlanStore::for_project(dir.path(), &config);
    let spawner = MockSpawner::new(fallback);
    let hooks = Arc::new(RecordingHooks::default());
    let engine = Arc::new(
        TaskEngine::new(config, spawner.clone(), EventBus::new())
            .with_kill_grace(Duration::from_millis(50))
            .with_worktree_hooks(hooks.clone()),
    );
    engine.spawn_event_loop();
    let events = engine.subscribe();

    let mut task = Task::new("010-login", "Login form", dir.path());
    task.set_status(status, None);
    engine.register_task(task.clone());
    Harness {
        _dir: dir,
        engine,
        spawner,
        hooks,
        events,
        store,
        task,
    }
}

fn status_is(status: TaskStatus) -> impl FnMut(&EngineEvent) -> bool {
    move |e| matches!(e, EngineEvent::StatusChange { status: s, .. } if *s == status)
}

fn statuses(events: &[EngineEvent]) -> Vec<TaskStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StatusChange { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Exit routing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_execution_goes_to_human_review_with_errors() {
    let h = harness(Script::exit(&["Starting coder agent", "Error: tests failed"], 1), TaskStatus::Backlog);
    h.engine.start_task(h.task.id, None).unwrap();

    let events = events_until(&h.events, status_is(TaskStatus::HumanReview)).await;
    assert_eq!(statuses(&events), vec![TaskStatus::InProgress, TaskStatus::HumanReview]);

    let task = h.engine.task(h.task.id).unwrap();
    assert_eq!(task.status, TaskStatus::HumanReview);
    assert_eq!(task.review_reason, Some(ReviewReason::Errors));
    let progress = task.execution_progress.unwrap();
    assert_eq!(progress.phase, ExecutionPhase::Failed);
    assert_eq!(progress.overall_progress, 26);

    let plan = h.store.load_or_synthesize(&h.task.spec_id).unwrap();
    assert_eq!(plan.status, Some(TaskStatus::HumanReview));
    assert_eq!(plan.review_reason, Some(ReviewReason::Errors));
}

#[tokio::test]
async fn clean_exit_goes_to_human_review_completed() {
    let h = harness(
        Script::exit(&["Starting coder agent", "=== BUILD COMPLETE ==="], 0),
        TaskStatus::Backlog,
    );
    h.engine.start_task(h.task.id, None).unwrap();
    events_until(&h.events, status_is(TaskStatus::HumanReview)).await;

    let task = h.engine.task(h.task.id).unwrap();
    assert_eq!(task.review_reason, Some(ReviewReason::Completed));
    assert_eq!(task.execution_progress.unwrap().overall_progress, 100);
    assert!(!h.engine.is_stuck(h.task.id));
}

#[tokio::test]
async fn qa_rejection_in_plan_is_the_review_reason() {
    let h = harness(Script::exit(&["QA Reviewer started"], 0), TaskStatus::Backlog);
    let mut plan = Plan::synthesize("Login form");
    plan.extra.insert(
        "qa_signoff".into(),
        serde_json::json!({ "status": "rejected", "qa_session": 2 }),
    );
    h.store.save(&h.task.spec_id, &plan).unwrap();

    h.engine.start_task(h.task.id, None).unwrap();
    let events = events_until(&h.events, status_is(TaskStatus::HumanReview)).await;
    assert_eq!(
        statuses(&events),
        vec![TaskStatus::InProgress, TaskStatus::AiReview, TaskStatus::HumanReview]
    );
    assert_eq!(
        h.engine.task(h.task.id).unwrap().review_reason,
        Some(ReviewReason::QaRejected)
    );
}

#[tokio::test]
async fn spec_creation_chains_into_execution() {
    let h = harness(
        Script::exit(&["Starting coder agent", "=== BUILD COMPLETE ==="], 0),
        TaskStatus::Backlog,
    );
    h.spawner.queue(Script::exit(&["Writing spec.md"], 0));

    h.engine.start_task(h.task.id, Some("Add a login form")).unwrap();
    let events = events_until(&h.events, status_is(TaskStatus::HumanReview)).await;

    let kinds: Vec<_> = h.spawner.requests().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ProcessKind::SpecCreation, ProcessKind::TaskExecution]);
    assert_eq!(h.spawner.requests()[0].arg_value("--task"), Some("Add a login form"));
    // Only the execution run moves the task to review.
    assert_eq!(statuses(&events), vec![TaskStatus::InProgress, TaskStatus::HumanReview]);
    assert_eq!(
        h.engine.task(h.task.id).unwrap().review_reason,
        Some(ReviewReason::Completed)
    );
}

#[tokio::test]
async fn failed_spec_creation_goes_to_review() {
    let h = harness(Script::exit(&[], 0), TaskStatus::Backlog);
    h.spawner.queue(Script::exit(&["fatal: spec runner crashed"], 1));

    h.engine.start_task(h.task.id, Some("Add a login form")).unwrap();
    events_until(&h.events, status_is(TaskStatus::HumanReview)).await;
    assert_eq!(h.spawner.requests().len(), 1);
    assert_eq!(
        h.engine.task(h.task.id).unwrap().review_reason,
        Some(ReviewReason::Errors)
    );
}

#[tokio::test]
async fn existing_plan_skips_spec_creation() {
    let h = harness(Script::hang(&[]), TaskStatus::Backlog);
    let plan = Plan {
        phases: vec![PlanPhase {
            name: "Implementation".into(),
            chunks: vec![Chunk::new("1", "form")],
            ..PlanPhase::default()
        }],
        ..Plan::synthesize("Login form")
    };
    h.store.save(&h.task.spec_id, &plan).unwrap();
    h.engine.start_task(h.task.id, Some("ignored")).unwrap();
    assert_eq!(h.spawner.requests()[0].kind, ProcessKind::TaskExecution);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn spec_creation_is_retried_after_it_failed() {
    let h = harness(Script::hang(&[]), TaskStatus::Backlog);
    h.spawner.queue(Script::exit(&["fatal: spec runner crashed"], 1));

    h.engine.start_task(h.task.id, Some("Add login")).unwrap();
    events_until(&h.events, status_is(TaskStatus::HumanReview)).await;
    // The failure left a plan behind that only records the review status.
    assert!(h.store.exists(&h.task.spec_id));

    h.engine.start_task(h.task.id, Some("Add login")).unwrap();
    let kinds: Vec<_> = h.spawner.requests().iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![ProcessKind::SpecCreation, ProcessKind::SpecCreation]);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn exit_of_replaced_process_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let spawner = MockSpawner::new(Script::hang(&[]));
    spawner.queue(Script::exit(&["Error: tests failed"], 1));
    // No event loop: the exit is handed over by hand, after the restart.
    let engine = TaskEngine::new(Config::default(), spawner.clone(), EventBus::new())
        .with_kill_grace(Duration::from_millis(50));
    let events = engine.subscribe();
    let task = Task::new("012-retry", "Retry", dir.path());
    engine.register_task(task.clone());

    engine.start_task(task.id, None).unwrap();
    let stale = events_until(&events, is_exit).await.pop().unwrap();
    let restarted = engine.start_task(task.id, None).unwrap();
    assert!(matches!(&stale, EngineEvent::Exit { handle_id, .. } if *handle_id != restarted.handle_id));

    engine.handle_event(&stale);
    assert_eq!(engine.task(task.id).unwrap().status, TaskStatus::InProgress);
    assert!(engine.is_running(task.id));
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Start / stop / status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_failure_reverts_status() {
    let h = harness(Script::Missing, TaskStatus::Backlog);
    let err = h.engine.start_task(h.task.id, None).unwrap_err();
    assert!(matches!(err, EngineError::Supervisor(_)));

    assert_eq!(h.engine.task(h.task.id).unwrap().status, TaskStatus::Backlog);
    let events = drain_for(&h.events, Duration::from_millis(50)).await;
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Error { .. })));
    assert_eq!(statuses(&events), vec![TaskStatus::InProgress, TaskStatus::Backlog]);
}

#[tokio::test]
async fn stop_kills_and_returns_to_backlog() {
    let h = harness(Script::hang(&["Starting coder agent"]), TaskStatus::Backlog);
    h.engine.start_task(h.task.id, None).unwrap();
    assert!(h.engine.is_running(h.task.id));

    let result = h.engine.stop_task(h.task.id);
    assert!(result.success, "{}", result.message);
    assert!(!h.engine.is_running(h.task.id));

    // The killed process does not push the task into review afterwards.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.engine.task(h.task.id).unwrap().status, TaskStatus::Backlog);
}

#[tokio::test]
async fn stop_keeps_chunks_of_a_plan_with_unknown_statuses() {
    let h = harness(Script::hang(&[]), TaskStatus::Backlog);
    std::fs::create_dir_all(h.store.spec_dir(&h.task.spec_id)).unwrap();
    std::fs::write(
        h.store.plan_path(&h.task.spec_id),
        r#"{"feature": "Login form", "phases": [{"name": "Build", "chunks": [
            {"id": "1", "status": "completed"},
            {"id": "2", "status": "completed"},
            {"id": "3", "status": "blocked"}
        ]}]}"#,
    )
    .unwrap();

    h.engine.start_task(h.task.id, None).unwrap();
    assert!(h.engine.stop_task(h.task.id).success);

    let PlanLoad::Loaded(plan) = h.store.load(&h.task.spec_id).unwrap() else {
        panic!("plan no longer parses");
    };
    assert_eq!(plan.status, Some(TaskStatus::Backlog));
    let statuses: Vec<_> = plan.chunks().map(|c| (c.id.as_str(), c.status.clone())).collect();
    assert_eq!(
        statuses,
        vec![
            ("1", ChunkStatus::Completed),
            ("2", ChunkStatus::Completed),
            ("3", ChunkStatus::Other("blocked".into())),
        ]
    );
}

#[tokio::test]
async fn moving_to_in_progress_starts_the_task() {
    let h = harness(Script::hang(&[]), TaskStatus::Backlog);
    let status = h.engine.update_status(h.task.id, TaskStatus::InProgress).unwrap();
    assert_eq!(status, TaskStatus::InProgress);
    assert!(h.engine.is_running(h.task.id));
    assert_eq!(h.spawner.requests().len(), 1);

    // Already running: an explicit update does not start a second process.
    h.engine.update_status(h.task.id, TaskStatus::InProgress).unwrap();
    assert_eq!(h.spawner.requests().len(), 1);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn delete_refused_while_running() {
    let h = harness(Script::hang(&[]), TaskStatus::Backlog);
    h.engine.start_task(h.task.id, None).unwrap();
    let refused = h.engine.delete_task(h.task.id);
    assert!(!refused.success);
    assert!(h.engine.task(h.task.id).is_some());

    h.engine.stop_task(h.task.id);
    assert!(h.engine.delete_task(h.task.id).success);
    assert!(h.engine.task(h.task.id).is_none());
}

#[tokio::test]
async fn running_status_without_process_is_stuck() {
    let h = harness(Script::hang(&[]), TaskStatus::InProgress);
    let idle = Task::new("011-other", "Other", h.task.project_path.clone());
    h.engine.register_task(idle.clone());

    assert!(h.engine.is_stuck(h.task.id));
    assert!(!h.engine.is_stuck(idle.id));
    let stuck: Vec<_> = h.engine.stuck_tasks().into_iter().map(|t| t.id).collect();
    assert_eq!(stuck, vec![h.task.id]);

    h.engine.start_task(h.task.id, None).unwrap();
    assert!(!h.engine.is_stuck(h.task.id));
    h.engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Review
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approval_records_and_finishes() {
    let h = harness(Script::hang(&[]), TaskStatus::HumanReview);
    let t = h.engine.review(h.task.id, true, None).await.unwrap();
    assert_eq!(t.to, TaskStatus::Done);

    assert!(h.store.spec_dir(&h.task.spec_id).join(APPROVAL_FILE_NAME).is_file());
    assert!(h.spawner.requests().is_empty());
    assert_eq!(*h.hooks.calls.lock().unwrap(), vec!["approved:010-login".to_string()]);
}

#[tokio::test]
async fn rejection_records_feedback_and_starts_qa() {
    let h = harness(Script::hang(&[]), TaskStatus::HumanReview);
    let t = h
        .engine
        .review(h.task.id, false, Some("Password field accepts empty input"))
        .await
        .unwrap();
    assert_eq!(t.to, TaskStatus::InProgress);

    let fix = std::fs::read_to_string(h.store.spec_dir(&h.task.spec_id).join(FIX_REQUEST_FILE_NAME)).unwrap();
    assert!(fix.contains("Password field accepts empty input"));
    let requests = h.spawner.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, ProcessKind::QaProcess);
    assert!(requests[0].has_flag("--qa"));
    // A failing hook is logged, not fatal.
    assert_eq!(*h.hooks.calls.lock().unwrap(), vec!["rejected:010-login".to_string()]);
    assert!(h.engine.is_running(h.task.id));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn review_outside_human_review_is_rejected() {
    let h = harness(Script::hang(&[]), TaskStatus::Backlog);
    let err = h.engine.review(h.task.id, true, None).await.unwrap_err();
    assert!(matches!(err, EngineError::Reconcile(_)));
    assert!(!h.store.spec_dir(&h.task.spec_id).join(APPROVAL_FILE_NAME).exists());
}
