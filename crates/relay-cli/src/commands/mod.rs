pub mod recover;
pub mod run;
pub mod status;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use relay_bridge::event_bus::EventBus;
use relay_bridge::protocol::EngineEvent;
use relay_core::config::Config;
use relay_core::plan::{PlanLoad, PlanStore};
use relay_core::plan_watcher::NotifyPlanWatcher;
use relay_core::types::{Task, TaskStatus};
use relay_engine::engine::TaskEngine;
use relay_engine::spawner::TokioSpawner;
use tracing::warn;
use uuid::Uuid;

/// Load the config from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    Ok(config)
}

/// Engine backed by real processes and a filesystem plan watcher, with its
/// event loop already running.
pub fn build_engine(config: Config) -> anyhow::Result<Arc<TaskEngine>> {
    let bus = EventBus::new();
    let watcher_bus = bus.clone();
    let watcher = NotifyPlanWatcher::new(move |change| {
        watcher_bus.publish(EngineEvent::PlanChanged {
            task_id: change.task_id,
            path: change.path,
        });
    })
    .context("failed to start plan watcher")?;

    let engine = TaskEngine::new(config, Arc::new(TokioSpawner::new()), bus)
        .with_plan_watcher(Arc::new(watcher));
    let engine = Arc::new(engine);
    engine.spawn_event_loop();
    Ok(engine)
}

/// Build the task for `spec_id` from whatever its plan records.
pub fn load_task(config: &Config, project: &Path, spec_id: &str) -> anyhow::Result<Task> {
    let project = std::fs::canonicalize(project)
        .with_context(|| format!("project path does not exist: {}", project.display()))?;
    let store = PlanStore::for_project(&project, config);
    let plan = match store
        .load(spec_id)
        .with_context(|| format!("failed to read plan for {spec_id}"))?
    {
        PlanLoad::Loaded(plan) => Some(plan),
        PlanLoad::Missing => None,
        PlanLoad::Corrupt(e) => {
            warn!(spec_id, error = %e, "plan is corrupt; treating task as new");
            None
        }
    };

    let title = plan
        .as_ref()
        .and_then(|p| p.feature.clone())
        .unwrap_or_else(|| spec_id.to_string());
    let mut task = Task::new(spec_id, title, project);
    if let Some(plan) = plan {
        task.set_status(plan.status.unwrap_or(TaskStatus::Backlog), plan.review_reason);
        task.chunks = plan.all_chunks();
    }
    Ok(task)
}

/// Print events for `task_id` until it settles in a status without a running
/// process. Ctrl-C stops the task instead.
pub async fn follow(engine: &TaskEngine, events: flume::Receiver<EngineEvent>, task_id: Uuid) -> anyhow::Result<TaskStatus> {
    loop {
        let event = tokio::select! {
            event = events.recv_async() => event.context("event bus closed")?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted; stopping task");
                let result = engine.stop_task(task_id);
                engine.shutdown().await;
                anyhow::ensure!(result.success, "{}", result.message);
                return Ok(TaskStatus::Backlog);
            }
        };
        if event.task_id() != task_id {
            continue;
        }
        match event {
            EngineEvent::Log { line, .. } => println!("  {line}"),
            EngineEvent::Error { message, .. } => eprintln!("error: {message}"),
            EngineEvent::ExecutionProgress { progress, .. } => {
                let message = progress.message.as_deref().unwrap_or("");
                println!("[{:>3}%] {:<12} {message}", progress.overall_progress, progress.phase);
            }
            EngineEvent::StreamMarker { marker, .. } => println!("  marker: {marker:?}"),
            EngineEvent::Exit { kind, code, .. } => match code {
                Some(code) => println!("{kind} exited with code {code}"),
                None => println!("{kind} terminated by signal"),
            },
            EngineEvent::StatusChange {
                status,
                review_reason,
                ..
            } => {
                match review_reason {
                    Some(reason) => println!("status: {status} ({reason:?})"),
                    None => println!("status: {status}"),
                }
                if !status.implies_running() && !engine.is_running(task_id) {
                    return Ok(status);
                }
            }
            EngineEvent::PlanChanged { .. } => {}
        }
    }
}
