use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Externally visible status of a task on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    AiReview,
    HumanReview,
    Done,
}

impl TaskStatus {
    /// Statuses that imply an external process should currently be running.
    pub fn implies_running(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::AiReview)
    }

    /// Value written to the plan's legacy `planStatus` field, which older
    /// tooling still reads.
    pub fn legacy_plan_status(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview | TaskStatus::HumanReview => "review",
            TaskStatus::Done => "completed",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AiReview => "ai_review",
            TaskStatus::HumanReview => "human_review",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "backlog" => Ok(TaskStatus::Backlog),
            "in_progress" => Ok(TaskStatus::InProgress),
            "ai_review" => Ok(TaskStatus::AiReview),
            "human_review" => Ok(TaskStatus::HumanReview),
            "done" => Ok(TaskStatus::Done),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// ReviewReason
// ---------------------------------------------------------------------------

/// Why a task landed in human review. Only meaningful alongside
/// [`TaskStatus::HumanReview`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    Completed,
    Errors,
    QaRejected,
}

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

/// Status of one chunk as written by the agent. Values this crate does not
/// know (`blocked`, `skipped`, ...) are kept verbatim in `Other` so the chunk
/// survives a rewrite of the plan unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChunkStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Other(String),
}

impl ChunkStatus {
    /// A chunk in this state had work in flight that cannot be trusted once
    /// its process has disappeared.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ChunkStatus::InProgress | ChunkStatus::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Other(raw) => raw,
        }
    }
}

impl From<String> for ChunkStatus {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "pending" => ChunkStatus::Pending,
            "in_progress" => ChunkStatus::InProgress,
            "completed" => ChunkStatus::Completed,
            "failed" => ChunkStatus::Failed,
            _ => ChunkStatus::Other(raw),
        }
    }
}

impl From<ChunkStatus> for String {
    fn from(status: ChunkStatus) -> Self {
        match status {
            ChunkStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a chunk's result is meant to be verified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One unit of a task's implementation plan.
///
/// Chunks are owned by the persisted plan; fields this crate does not know
/// about are carried through `extra` so a read-modify-write never drops them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ChunkStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_to_modify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Agents sometimes number chunks (`"id": 3`) instead of naming them.
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(id) => Ok(id),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("chunk id must be a string or number, got {other}"))),
    }
}

impl Chunk {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: ChunkStatus::Pending,
            files_to_modify: Vec::new(),
            verification: None,
            actual_output: None,
            started_at: None,
            completed_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Put the chunk back to `pending` and forget anything recorded about
    /// the interrupted attempt.
    pub fn reset_to_pending(&mut self) {
        self.status = ChunkStatus::Pending;
        self.actual_output = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

// ---------------------------------------------------------------------------
// ExecutionPhase / ExecutionProgress
// ---------------------------------------------------------------------------

/// Stage of work inferred from an agent process's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    #[default]
    Idle,
    Planning,
    Coding,
    QaReview,
    QaFixing,
    Complete,
    Failed,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Complete | ExecutionPhase::Failed)
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionPhase::Idle => "idle",
            ExecutionPhase::Planning => "planning",
            ExecutionPhase::Coding => "coding",
            ExecutionPhase::QaReview => "qa_review",
            ExecutionPhase::QaFixing => "qa_fixing",
            ExecutionPhase::Complete => "complete",
            ExecutionPhase::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Live progress snapshot for a running task. Derived from log output and
/// never treated as the source of truth for resuming work.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionProgress {
    pub phase: ExecutionPhase,
    pub phase_progress: u8,
    pub overall_progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionProgress {
    /// Snapshot emitted as soon as a process is spawned, before any output.
    pub fn starting() -> Self {
        Self {
            phase: ExecutionPhase::Planning,
            phase_progress: 0,
            overall_progress: 0,
            current_chunk: None,
            message: Some("Starting task...".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    SpecCreation,
    TaskExecution,
    QaProcess,
}

impl ProcessKind {
    /// Whether this kind of process hands the task to human review when it
    /// exits. Spec creation instead chains into task execution.
    pub fn exits_to_review(&self) -> bool {
        matches!(self, ProcessKind::TaskExecution | ProcessKind::QaProcess)
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProcessKind::SpecCreation => "spec-creation",
            ProcessKind::TaskExecution => "task-execution",
            ProcessKind::QaProcess => "qa-process",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub spec_id: String,
    pub title: String,
    pub description: Option<String>,
    pub project_path: PathBuf,
    pub status: TaskStatus,
    pub review_reason: Option<ReviewReason>,
    pub chunks: Vec<Chunk>,
    pub execution_progress: Option<ExecutionProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        spec_id: impl Into<String>,
        title: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            spec_id: spec_id.into(),
            title: title.into(),
            description: None,
            project_path: project_path.into(),
            status: TaskStatus::Backlog,
            review_reason: None,
            chunks: Vec::new(),
            execution_progress: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status, dropping the review reason unless the task is in
    /// human review.
    pub fn set_status(&mut self, status: TaskStatus, reason: Option<ReviewReason>) {
        self.status = status;
        self.review_reason = match status {
            TaskStatus::HumanReview => reason,
            _ => None,
        };
        self.updated_at = Utc::now();
    }

    pub fn pending_chunk_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Pending)
            .count()
    }
}
