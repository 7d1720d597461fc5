use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_core::types::ProcessKind;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::spawner::{ProcessExit, ProcessSignal};

/// Bookkeeping for one live agent process.
///
/// `handle_id` identifies this particular launch, so a pump finishing after
/// its task was restarted cannot remove the replacement.
#[derive(Debug, Clone)]
pub struct AgentProcessHandle {
    pub handle_id: Uuid,
    pub task_id: Uuid,
    pub kind: ProcessKind,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub project_path: Option<PathBuf>,
    pub signals: flume::Sender<ProcessSignal>,
    pub exit: watch::Receiver<Option<ProcessExit>>,
}

impl AgentProcessHandle {
    /// Snapshot without the signal and exit channels.
    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            handle_id: self.handle_id,
            task_id: self.task_id,
            kind: self.kind,
            pid: self.pid,
            started_at: self.started_at,
            project_path: self.project_path.clone(),
        }
    }
}

/// Public view of a running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub handle_id: Uuid,
    pub task_id: Uuid,
    pub kind: ProcessKind,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub project_path: Option<PathBuf>,
}

/// Concurrent map of task id to its single live process.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    handles: Arc<DashMap<Uuid, AgentProcessHandle>>,
}

impl ProcessRegistry {
    /// Empty registry. Clones share the same table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle`, returning whatever it displaced.
    pub fn insert(&self, handle: AgentProcessHandle) -> Option<AgentProcessHandle> {
        self.handles.insert(handle.task_id, handle)
    }

    /// Take the task's handle out, whichever launch it belongs to.
    pub fn remove(&self, task_id: Uuid) -> Option<AgentProcessHandle> {
        self.handles.remove(&task_id).map(|(_, h)| h)
    }

    /// Remove the entry only if it still belongs to launch `handle_id`.
    pub fn remove_if_current(&self, task_id: Uuid, handle_id: Uuid) -> Option<AgentProcessHandle> {
        self.handles
            .remove_if(&task_id, |_, h| h.handle_id == handle_id)
            .map(|(_, h)| h)
    }

    /// Whether the task has a live process.
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.handles.contains_key(&task_id)
    }

    /// Public view of the task's process, if any.
    pub fn get(&self, task_id: Uuid) -> Option<ProcessInfo> {
        self.handles.get(&task_id).map(|h| h.info())
    }

    /// Ids of every task with a live process.
    pub fn task_ids(&self) -> Vec<Uuid> {
        self.handles.iter().map(|e| *e.key()).collect()
    }

    /// Public view of every live process.
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.handles.iter().map(|e| e.value().info()).collect()
    }

    /// Number of live processes.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Remove and return every handle.
    pub fn drain(&self) -> Vec<AgentProcessHandle> {
        let ids = self.task_ids();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}
