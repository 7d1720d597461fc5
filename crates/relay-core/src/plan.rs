//! The persisted implementation plan: one JSON file per task, authoritative
//! for which chunks are done and therefore for where work can resume.
//!
//! Reads are tolerant. Status values this crate does not recognise are kept
//! or dropped per field instead of failing the parse, and a missing file or a
//! file that still fails to parse is reported as a value rather than an error
//! so callers can fall back to a synthesized plan. Writes through
//! [`PlanStore::persist`] never replace a file that did not parse: only the
//! status fields are patched into it. Concurrent editors of the same file are
//! not guarded against and the last writer wins.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::types::{Chunk, ChunkStatus, ReviewReason, TaskStatus};

pub const PLAN_FILE_NAME: &str = "implementation_plan.json";
pub const APPROVAL_FILE_NAME: &str = "qa_report.md";
pub const FIX_REQUEST_FILE_NAME: &str = "QA_FIX_REQUEST.md";
pub const SPEC_FILE_NAME: &str = "spec.md";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plan serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlanError>;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanPhase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<u32>,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "subtasks")]
    pub chunks: Vec<Chunk>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, deserialize_with = "lenient_status", skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(rename = "planStatus", default, skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<String>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<ReviewReason>,
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_note: Option<String>,
    #[serde(default)]
    pub phases: Vec<PlanPhase>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Chunk tallies across every phase of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkCounts {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Chunks in a state this crate does not know, e.g. `blocked`.
    pub other: usize,
}

/// Task status as found in a plan. Besides the board spellings, older tools
/// wrote the legacy `planStatus` vocabulary into `status`; anything else is
/// read as absent.
fn lenient_status<'de, D>(deserializer: D) -> std::result::Result<Option<TaskStatus>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    let Some(text) = raw.as_ref().and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    Ok(text.parse().ok().or(match text {
        "pending" => Some(TaskStatus::Backlog),
        "review" => Some(TaskStatus::HumanReview),
        "completed" => Some(TaskStatus::Done),
        _ => None,
    }))
}

/// Optional field that reads as `None` when its value is not understood.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}

impl Plan {
    /// Minimal plan used when none exists on disk or the file is unreadable.
    pub fn synthesize(feature: impl Into<String>) -> Self {
        Self {
            feature: Some(feature.into()),
            status: Some(TaskStatus::Backlog),
            plan_status: Some(TaskStatus::Backlog.legacy_plan_status().to_string()),
            updated_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.phases.iter().flat_map(|p| p.chunks.iter())
    }

    pub fn chunks_mut(&mut self) -> impl Iterator<Item = &mut Chunk> {
        self.phases.iter_mut().flat_map(|p| p.chunks.iter_mut())
    }

    pub fn chunk_counts(&self) -> ChunkCounts {
        let mut counts = ChunkCounts::default();
        for chunk in self.chunks() {
            counts.total += 1;
            match &chunk.status {
                ChunkStatus::Pending => counts.pending += 1,
                ChunkStatus::InProgress => counts.in_progress += 1,
                ChunkStatus::Completed => counts.completed += 1,
                ChunkStatus::Failed => counts.failed += 1,
                ChunkStatus::Other(_) => counts.other += 1,
            }
        }
        counts
    }

    /// Status implied by chunk completion alone: everything completed means
    /// the work is ready for a human, partial completion means it was mid-run,
    /// and nothing completed (including no chunks at all) means backlog.
    pub fn infer_status(&self) -> TaskStatus {
        let counts = self.chunk_counts();
        if counts.total > 0 && counts.completed == counts.total {
            TaskStatus::HumanReview
        } else if counts.completed > 0 {
            TaskStatus::InProgress
        } else {
            TaskStatus::Backlog
        }
    }

    /// Reset every `in_progress` or `failed` chunk to `pending`, returning
    /// the ids that were reset. Running this twice resets nothing the second
    /// time.
    pub fn reset_interrupted_chunks(&mut self) -> Vec<String> {
        let mut reset = Vec::new();
        for chunk in self.chunks_mut() {
            if chunk.status.is_interrupted() {
                chunk.reset_to_pending();
                reset.push(chunk.id.clone());
            }
        }
        reset
    }

    /// Record a status change, keeping the legacy field in step.
    pub fn set_status(&mut self, status: TaskStatus, reason: Option<ReviewReason>) {
        self.status = Some(status);
        self.plan_status = Some(status.legacy_plan_status().to_string());
        self.review_reason = match status {
            TaskStatus::HumanReview => reason,
            _ => None,
        };
        self.updated_at = Some(Utc::now());
    }

    pub fn mark_recovered(&mut self, at: DateTime<Utc>) {
        self.recovery_note = Some(format!("Task recovered from stuck state at {}", at.to_rfc3339()));
        self.updated_at = Some(at);
    }

    /// Whether the automated reviewer's last sign-off rejected the work.
    pub fn qa_rejected(&self) -> bool {
        self.extra
            .get("qa_signoff")
            .and_then(|signoff| signoff.get("status"))
            .and_then(|status| status.as_str())
            == Some("rejected")
    }

    /// Flattened copy of every chunk, in plan order.
    pub fn all_chunks(&self) -> Vec<Chunk> {
        self.chunks().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

/// Outcome of reading a plan file.
#[derive(Debug, Clone)]
pub enum PlanLoad {
    Loaded(Plan),
    Missing,
    /// The file exists but is not a valid plan.
    Corrupt(String),
}

/// Reads and writes plan files under a project's specs directory.
#[derive(Debug, Clone)]
pub struct PlanStore {
    specs_root: PathBuf,
}

impl PlanStore {
    pub fn new(specs_root: impl Into<PathBuf>) -> Self {
        Self {
            specs_root: specs_root.into(),
        }
    }

    /// Store rooted at `<project>/<auto_dir>/<specs_dir>`.
    pub fn for_project(project_path: &Path, config: &Config) -> Self {
        Self::new(config.specs_root(project_path))
    }

    pub fn specs_root(&self) -> &Path {
        &self.specs_root
    }

    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.specs_root.join(spec_id)
    }

    pub fn plan_path(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join(PLAN_FILE_NAME)
    }

    pub fn exists(&self, spec_id: &str) -> bool {
        self.plan_path(spec_id).is_file()
    }

    /// Whether spec creation already produced something to execute: a
    /// `spec.md`, or a plan with at least one phase. A plan written only to
    /// record a status change does not count.
    pub fn has_spec(&self, spec_id: &str) -> bool {
        if self.spec_dir(spec_id).join(SPEC_FILE_NAME).is_file() {
            return true;
        }
        matches!(self.load(spec_id), Ok(PlanLoad::Loaded(plan)) if !plan.phases.is_empty())
    }

    pub fn load(&self, spec_id: &str) -> Result<PlanLoad> {
        let path = self.plan_path(spec_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PlanLoad::Missing),
            Err(source) => return Err(PlanError::Io { path, source }),
        };
        match serde_json::from_str::<Plan>(&text) {
            Ok(plan) => Ok(PlanLoad::Loaded(plan)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "plan file failed to parse");
                Ok(PlanLoad::Corrupt(e.to_string()))
            }
        }
    }

    /// Load the plan, falling back to a synthesized one when the file is
    /// missing or corrupt. A corrupt plan therefore reads as having no chunks.
    /// Write the result back with [`persist`](Self::persist), not `save`.
    pub fn load_or_synthesize(&self, spec_id: &str) -> Result<Plan> {
        Ok(match self.load(spec_id)? {
            PlanLoad::Loaded(plan) => plan,
            PlanLoad::Missing | PlanLoad::Corrupt(_) => Plan::synthesize(spec_id),
        })
    }

    /// Write back a plan obtained from [`load_or_synthesize`](Self::load_or_synthesize).
    ///
    /// If the file on disk does not parse as a plan, its content is kept and
    /// only `status`, `planStatus`, `review_reason`, `updated_at` and
    /// `recovery_note` are patched into the JSON object. A file that is not a
    /// JSON object at all is moved aside to `implementation_plan.corrupt-<ts>.json`
    /// before `plan` is written in its place.
    pub fn persist(&self, spec_id: &str, plan: &Plan) -> Result<()> {
        match self.load(spec_id)? {
            PlanLoad::Corrupt(_) => self.patch_status(spec_id, plan),
            PlanLoad::Loaded(_) | PlanLoad::Missing => self.save(spec_id, plan),
        }
    }

    fn patch_status(&self, spec_id: &str, plan: &Plan) -> Result<()> {
        let path = self.plan_path(spec_id);
        let text = std::fs::read_to_string(&path).map_err(|source| PlanError::Io {
            path: path.clone(),
            source,
        })?;
        let mut object = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(serde_json::Value::Object(object)) => object,
            _ => {
                let backup = self
                    .spec_dir(spec_id)
                    .join(format!("implementation_plan.corrupt-{}.json", Utc::now().timestamp()));
                std::fs::rename(&path, &backup).map_err(|source| PlanError::Io {
                    path: backup.clone(),
                    source,
                })?;
                warn!(path = %path.display(), backup = %backup.display(), "unreadable plan moved aside");
                return self.save(spec_id, plan);
            }
        };

        let fields = [
            ("status", serde_json::to_value(plan.status)?),
            ("planStatus", serde_json::to_value(&plan.plan_status)?),
            ("review_reason", serde_json::to_value(plan.review_reason)?),
            ("updated_at", serde_json::to_value(plan.updated_at)?),
            ("recovery_note", serde_json::to_value(&plan.recovery_note)?),
        ];
        for (key, value) in fields {
            if value.is_null() {
                object.remove(key);
            } else {
                object.insert(key.to_string(), value);
            }
        }
        let text = serde_json::to_string_pretty(&object)?;
        std::fs::write(&path, text).map_err(|source| PlanError::Io {
            path: path.clone(),
            source,
        })?;
        warn!(path = %path.display(), "plan did not parse; patched status fields only");
        Ok(())
    }

    pub fn save(&self, spec_id: &str, plan: &Plan) -> Result<()> {
        let dir = self.spec_dir(spec_id);
        std::fs::create_dir_all(&dir).map_err(|source| PlanError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = self.plan_path(spec_id);
        let text = serde_json::to_string_pretty(plan)?;
        std::fs::write(&path, text).map_err(|source| PlanError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "plan written");
        Ok(())
    }

    /// Persist a manual approval record next to the plan.
    pub fn write_approval(&self, spec_id: &str, at: DateTime<Utc>) -> Result<PathBuf> {
        let body = format!(
            "# QA Review\n\nStatus: APPROVED\n\nApproved manually by the reviewer at {}.\n",
            at.to_rfc3339()
        );
        self.write_spec_file(spec_id, APPROVAL_FILE_NAME, &body)
    }

    /// Persist reviewer feedback for the QA fixer to pick up.
    pub fn write_fix_request(&self, spec_id: &str, feedback: &str, at: DateTime<Utc>) -> Result<PathBuf> {
        let body = format!(
            "# QA Fix Request\n\nStatus: REJECTED\n\nRequested at {}.\n\n## Feedback\n\n{}\n",
            at.to_rfc3339(),
            feedback.trim()
        );
        self.write_spec_file(spec_id, FIX_REQUEST_FILE_NAME, &body)
    }

    fn write_spec_file(&self, spec_id: &str, name: &str, body: &str) -> Result<PathBuf> {
        let dir = self.spec_dir(spec_id);
        std::fs::create_dir_all(&dir).map_err(|source| PlanError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = dir.join(name);
        std::fs::write(&path, body).map_err(|source| PlanError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}
