use std::path::PathBuf;

use relay_core::types::{ExecutionProgress, ProcessKind, ReviewReason, TaskStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which pipe a line of agent output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    Log {
        task_id: Uuid,
        stream: OutputStream,
        line: String,
    },
    Error {
        task_id: Uuid,
        message: String,
    },
    Exit {
        task_id: Uuid,
        /// Launch that exited. A restart gets a new id, so the exit of a
        /// replaced process can be told apart from the current one.
        #[serde(default)]
        handle_id: Uuid,
        kind: ProcessKind,
        /// `None` when the process was killed by a signal.
        code: Option<i32>,
        /// Follow-up process the engine should launch next, set only when a
        /// chained launch exited successfully.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chained: Option<ProcessKind>,
    },
    ExecutionProgress {
        task_id: Uuid,
        progress: ExecutionProgress,
    },
    StatusChange {
        task_id: Uuid,
        status: TaskStatus,
        review_reason: Option<ReviewReason>,
    },
    StreamMarker {
        task_id: Uuid,
        marker: StreamMarker,
    },
    PlanChanged {
        task_id: Uuid,
        path: PathBuf,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            EngineEvent::Log { task_id, .. }
            | EngineEvent::Error { task_id, .. }
            | EngineEvent::Exit { task_id, .. }
            | EngineEvent::ExecutionProgress { task_id, .. }
            | EngineEvent::StatusChange { task_id, .. }
            | EngineEvent::StreamMarker { task_id, .. }
            | EngineEvent::PlanChanged { task_id, .. } => *task_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Stream markers
// ---------------------------------------------------------------------------

/// Machine-readable sub-task completion line emitted by generation-style
/// processes, e.g. `IDEATION_TYPE_COMPLETE:security:4`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StreamMarker {
    Complete { name: String, count: u32 },
    Failed { name: String },
}

impl StreamMarker {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if let Some(rest) = after_tag(line, "TYPE_COMPLETE:") {
            let (name, count) = rest.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let count = count.trim().parse().ok()?;
            return Some(StreamMarker::Complete {
                name: name.to_string(),
                count,
            });
        }
        if let Some(rest) = after_tag(line, "TYPE_FAILED:") {
            let name = rest.trim();
            if name.is_empty() || name.contains(':') {
                return None;
            }
            return Some(StreamMarker::Failed {
                name: name.to_string(),
            });
        }
        None
    }
}

/// Text after `tag` when the line is `[A-Z_]*tag...`.
fn after_tag<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let idx = line.find(tag)?;
    let prefix = &line[..idx];
    if prefix
        .chars()
        .all(|c| c.is_ascii_uppercase() || c == '_')
    {
        Some(&line[idx + tag.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_marker() {
        assert_eq!(
            StreamMarker::parse("IDEATION_TYPE_COMPLETE:security:4"),
            Some(StreamMarker::Complete {
                name: "security".into(),
                count: 4
            })
        );
        assert_eq!(
            StreamMarker::parse("TYPE_COMPLETE:performance:0\n"),
            Some(StreamMarker::Complete {
                name: "performance".into(),
                count: 0
            })
        );
    }

    #[test]
    fn parses_failed_marker() {
        assert_eq!(
            StreamMarker::parse("IDEATION_TYPE_FAILED:ui_ux"),
            Some(StreamMarker::Failed {
                name: "ui_ux".into()
            })
        );
    }

    #[test]
    fn ignores_prose_and_malformed_markers() {
        assert_eq!(StreamMarker::parse("the TYPE_COMPLETE:x:1 marker"), None);
        assert_eq!(StreamMarker::parse("TYPE_COMPLETE:security:many"), None);
        assert_eq!(StreamMarker::parse("TYPE_COMPLETE::3"), None);
        assert_eq!(StreamMarker::parse("Planning the work"), None);
    }

    #[test]
    fn exit_omits_missing_chain() {
        let event = EngineEvent::Exit {
            task_id: Uuid::nil(),
            handle_id: Uuid::nil(),
            kind: ProcessKind::TaskExecution,
            code: Some(1),
            chained: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["kind"], "task_execution");
        assert!(json["payload"].get("chained").is_none());
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = EngineEvent::StatusChange {
            task_id: Uuid::nil(),
            status: TaskStatus::HumanReview,
            review_reason: Some(ReviewReason::Errors),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status_change");
        assert_eq!(json["payload"]["status"], "human_review");
        assert_eq!(json["payload"]["review_reason"], "errors");
    }
}
