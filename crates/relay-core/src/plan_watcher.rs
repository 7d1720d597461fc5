//! Per-task watch registrations on plan files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::plan::PLAN_FILE_NAME;

/// A plan file was written by someone (usually the agent process).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChange {
    pub task_id: Uuid,
    pub path: PathBuf,
}

/// Collaborator that watches a task's plan file while the task runs.
pub trait PlanWatcher: Send + Sync {
    fn watch(&self, task_id: Uuid, plan_path: &Path) -> Result<(), notify::Error>;

    /// Drop the registration for `task_id`. Returns whether one existed.
    fn unwatch(&self, task_id: Uuid) -> bool;

    fn is_watching(&self, task_id: Uuid) -> bool;
}

/// Watcher that never reports anything; used when nothing consumes plan
/// changes.
#[derive(Debug, Default)]
pub struct NoopPlanWatcher {
    watched: Mutex<HashMap<Uuid, PathBuf>>,
}

impl PlanWatcher for NoopPlanWatcher {
    fn watch(&self, task_id: Uuid, plan_path: &Path) -> Result<(), notify::Error> {
        lock(&self.watched).insert(task_id, plan_path.to_path_buf());
        Ok(())
    }

    fn unwatch(&self, task_id: Uuid) -> bool {
        lock(&self.watched).remove(&task_id).is_some()
    }

    fn is_watching(&self, task_id: Uuid) -> bool {
        lock(&self.watched).contains_key(&task_id)
    }
}

type ChangeCallback = Arc<dyn Fn(PlanChange) + Send + Sync>;

/// `notify`-backed watcher. The spec directory holding the plan is watched
/// non-recursively and only events touching the plan file are forwarded.
pub struct NotifyPlanWatcher {
    watcher: Mutex<RecommendedWatcher>,
    /// spec dir -> (task id, plan path)
    dirs: Arc<Mutex<HashMap<PathBuf, (Uuid, PathBuf)>>>,
    tasks: Mutex<HashMap<Uuid, PathBuf>>,
}

impl NotifyPlanWatcher {
    pub fn new(on_change: impl Fn(PlanChange) + Send + Sync + 'static) -> Result<Self, notify::Error> {
        let dirs: Arc<Mutex<HashMap<PathBuf, (Uuid, PathBuf)>>> = Arc::new(Mutex::new(HashMap::new()));
        let callback: ChangeCallback = Arc::new(on_change);
        let lookup = Arc::clone(&dirs);

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "plan watcher error");
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            for path in &event.paths {
                if path.file_name().and_then(|n| n.to_str()) != Some(PLAN_FILE_NAME) {
                    continue;
                }
                let Some(parent) = path.parent() else { continue };
                let hit = lock(&lookup).get(parent).cloned();
                if let Some((task_id, plan_path)) = hit {
                    callback(PlanChange {
                        task_id,
                        path: plan_path,
                    });
                }
            }
        })?;

        Ok(Self {
            watcher: Mutex::new(watcher),
            dirs,
            tasks: Mutex::new(HashMap::new()),
        })
    }
}

impl PlanWatcher for NotifyPlanWatcher {
    fn watch(&self, task_id: Uuid, plan_path: &Path) -> Result<(), notify::Error> {
        // Re-registering replaces the previous watch for the task.
        self.unwatch(task_id);

        let dir = plan_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        // Event paths come back in canonical form on some platforms.
        let dir = std::fs::canonicalize(&dir).unwrap_or(dir);
        lock(&self.watcher).watch(&dir, RecursiveMode::NonRecursive)?;
        lock(&self.dirs).insert(dir.clone(), (task_id, plan_path.to_path_buf()));
        lock(&self.tasks).insert(task_id, dir);
        debug!(task_id = %task_id, path = %plan_path.display(), "watching plan");
        Ok(())
    }

    fn unwatch(&self, task_id: Uuid) -> bool {
        let Some(dir) = lock(&self.tasks).remove(&task_id) else {
            return false;
        };
        lock(&self.dirs).remove(&dir);
        if let Err(e) = lock(&self.watcher).unwatch(&dir) {
            debug!(task_id = %task_id, error = %e, "unwatch failed");
        }
        true
    }

    fn is_watching(&self, task_id: Uuid) -> bool {
        lock(&self.tasks).contains_key(&task_id)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| {
        warn!("plan watcher lock was poisoned, recovering");
        e.into_inner()
    })
}
