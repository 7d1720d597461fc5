use std::collections::HashMap;
use std::path::{Path, PathBuf};

use relay_core::config::Config;
use relay_core::env_file::load_project_env;
use relay_core::types::{ProcessKind, Task};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// A launch that should be followed by another kind of process once it
/// exits successfully (spec creation feeds task execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedLaunch {
    pub next: ProcessKind,
}

/// Everything needed to spawn one external agent process.
///
/// `env` only holds overrides; the spawned process inherits the ambient
/// environment and these values win over it.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchRequest {
    pub task_id: Uuid,
    pub kind: ProcessKind,
    pub working_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub project_path: Option<PathBuf>,
    pub chain: Option<ChainedLaunch>,
}

impl LaunchRequest {
    pub fn new(
        task_id: Uuid,
        kind: ProcessKind,
        program: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_id,
            kind,
            working_dir: working_dir.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            project_path: None,
            chain: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn chained(mut self, next: ProcessKind) -> Self {
        self.chain = Some(ChainedLaunch { next });
        self
    }

    /// Value following `flag` in the argument list, if present.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }
}

/// Chunks only fan out to parallel workers when there is more than one left
/// to do and the user enabled it.
pub fn should_run_parallel(pending_chunks: usize, parallel_enabled: bool) -> bool {
    parallel_enabled && pending_chunks > 1
}

// ---------------------------------------------------------------------------
// LaunchBuilder
// ---------------------------------------------------------------------------

/// Builds [`LaunchRequest`]s following the runner's argument conventions.
#[derive(Debug, Clone)]
pub struct LaunchBuilder {
    config: Config,
}

impl LaunchBuilder {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Author a spec from the task description, then chain into execution.
    pub fn spec_creation(&self, task: &Task, description: &str) -> LaunchRequest {
        let spec_dir = self.config.specs_root(&task.project_path).join(&task.spec_id);
        let mut args = vec![
            self.config.agent.spec_runner_script.clone(),
            "--task".to_string(),
            description.to_string(),
            "--project-dir".to_string(),
            path_arg(&task.project_path),
            "--spec-dir".to_string(),
            path_arg(&spec_dir),
        ];
        self.push_dev_flag(&mut args);
        self.request(task, ProcessKind::SpecCreation, args)
            .chained(ProcessKind::TaskExecution)
    }

    pub fn task_execution(&self, task: &Task, parallel: bool) -> LaunchRequest {
        let mut args = self.spec_args(task);
        if self.config.execution.auto_continue {
            args.push("--auto-continue".to_string());
        }
        if self.config.execution.force_approval {
            args.push("--force".to_string());
        }
        if parallel {
            args.push("--parallel".to_string());
            args.push(self.config.execution.max_workers.to_string());
        }
        self.push_dev_flag(&mut args);
        self.request(task, ProcessKind::TaskExecution, args)
    }

    pub fn qa_process(&self, task: &Task) -> LaunchRequest {
        let mut args = self.spec_args(task);
        args.push("--qa".to_string());
        self.push_dev_flag(&mut args);
        self.request(task, ProcessKind::QaProcess, args)
    }

    /// Launch for the follow-up of a chained process. Spec creation is never
    /// a follow-up, so it maps onto execution.
    pub fn follow_up(&self, task: &Task, kind: ProcessKind) -> LaunchRequest {
        match kind {
            ProcessKind::QaProcess => self.qa_process(task),
            ProcessKind::TaskExecution | ProcessKind::SpecCreation => {
                let parallel =
                    should_run_parallel(task.pending_chunk_count(), self.config.execution.parallel_enabled);
                self.task_execution(task, parallel)
            }
        }
    }

    fn spec_args(&self, task: &Task) -> Vec<String> {
        vec![
            self.config.agent.runner_script.clone(),
            "--spec".to_string(),
            task.spec_id.clone(),
            "--project-dir".to_string(),
            path_arg(&task.project_path),
        ]
    }

    fn push_dev_flag(&self, args: &mut Vec<String>) {
        if self.config.agent.dev_mode {
            args.push("--dev".to_string());
        }
    }

    fn request(&self, task: &Task, kind: ProcessKind, args: Vec<String>) -> LaunchRequest {
        let working_dir = self
            .config
            .agent
            .runner_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| task.project_path.clone());

        let mut request = LaunchRequest::new(task.id, kind, &self.config.agent.interpreter, working_dir)
            .with_args(args)
            .with_env("PYTHONUNBUFFERED", "1");
        request.env.extend(self.project_env(&task.project_path));
        request.project_path = Some(task.project_path.clone());
        request
    }

    fn project_env(&self, project_path: &Path) -> HashMap<String, String> {
        let path = self.config.project_env_path(project_path);
        load_project_env(&path).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring unreadable project env file");
            HashMap::new()
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
