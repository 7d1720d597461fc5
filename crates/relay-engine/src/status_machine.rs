use relay_core::types::{ReviewReason, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// StatusEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    StartRequested,
    /// The automated reviewer took over (phase `qa_review`).
    AiReviewStarted,
    /// A task-execution or qa process exited; both outcomes go to a human.
    ProcessExited(ReviewReason),
    Rejected,
    Approved,
    Stopped,
    Recovered(TaskStatus),
    Explicit(TaskStatus),
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::StartRequested => write!(f, "StartRequested"),
            StatusEvent::AiReviewStarted => write!(f, "AiReviewStarted"),
            StatusEvent::ProcessExited(reason) => write!(f, "ProcessExited({reason:?})"),
            StatusEvent::Rejected => write!(f, "Rejected"),
            StatusEvent::Approved => write!(f, "Approved"),
            StatusEvent::Stopped => write!(f, "Stopped"),
            StatusEvent::Recovered(status) => write!(f, "Recovered({status})"),
            StatusEvent::Explicit(status) => write!(f, "Explicit({status})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("invalid transition: cannot apply {event} in status {status}")]
    InvalidTransition { status: TaskStatus, event: StatusEvent },
}

// ---------------------------------------------------------------------------
// StatusMachine
// ---------------------------------------------------------------------------

/// A computed, not yet committed, status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: TaskStatus,
    pub event: StatusEvent,
    pub to: TaskStatus,
    pub review_reason: Option<ReviewReason>,
}

/// Externally visible task status with its transition history.
///
/// Changes are two-step: [`plan`](Self::plan) computes the transition so the
/// caller can persist it, then [`commit`](Self::commit) makes it current.
#[derive(Debug, Clone)]
pub struct StatusMachine {
    current: TaskStatus,
    review_reason: Option<ReviewReason>,
    history: Vec<StatusTransition>,
}

impl StatusMachine {
    pub fn new(initial: TaskStatus) -> Self {
        Self {
            current: initial,
            review_reason: None,
            history: Vec::new(),
        }
    }

    /// Resume from a persisted status that carried a review reason.
    pub fn with_review_reason(mut self, reason: Option<ReviewReason>) -> Self {
        self.review_reason = reason.filter(|_| self.current == TaskStatus::HumanReview);
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.current
    }

    pub fn review_reason(&self) -> Option<ReviewReason> {
        self.review_reason
    }

    pub fn history(&self) -> &[StatusTransition] {
        &self.history
    }

    /// Compute the transition `event` would cause.
    ///
    /// Valid transitions:
    /// - Backlog / InProgress / AiReview / HumanReview + StartRequested -> InProgress
    /// - InProgress / AiReview + AiReviewStarted -> AiReview
    /// - InProgress / AiReview + ProcessExited(r) -> HumanReview (r)
    /// - HumanReview + Rejected -> InProgress
    /// - HumanReview + Approved -> Done
    /// - any + Stopped -> Backlog
    /// - any + Recovered(s) / Explicit(s) -> s
    pub fn plan(&self, event: StatusEvent) -> Result<StatusTransition, StatusError> {
        use TaskStatus as S;
        let (to, review_reason) = match (self.current, event) {
            (S::Backlog | S::InProgress | S::AiReview | S::HumanReview, StatusEvent::StartRequested) => {
                (S::InProgress, None)
            }
            (S::InProgress | S::AiReview, StatusEvent::AiReviewStarted) => (S::AiReview, None),
            (S::InProgress | S::AiReview, StatusEvent::ProcessExited(reason)) => {
                (S::HumanReview, Some(reason))
            }
            (S::HumanReview, StatusEvent::Rejected) => (S::InProgress, None),
            (S::HumanReview, StatusEvent::Approved) => (S::Done, None),
            (_, StatusEvent::Stopped) => (S::Backlog, None),
            (_, StatusEvent::Recovered(status)) | (_, StatusEvent::Explicit(status)) => {
                (status, None)
            }
            _ => {
                return Err(StatusError::InvalidTransition {
                    status: self.current,
                    event,
                });
            }
        };
        Ok(StatusTransition {
            from: self.current,
            event,
            to,
            review_reason,
        })
    }

    pub fn commit(&mut self, transition: StatusTransition) {
        self.current = transition.to;
        self.review_reason = transition.review_reason;
        self.history.push(transition);
        tracing::debug!(
            from = %transition.from,
            event = %transition.event,
            to = %transition.to,
            "task status transition"
        );
    }

    /// Plan and commit in one step.
    pub fn transition(&mut self, event: StatusEvent) -> Result<StatusTransition, StatusError> {
        let transition = self.plan(event)?;
        self.commit(transition);
        Ok(transition)
    }

    pub fn can_transition(&self, event: StatusEvent) -> bool {
        self.plan(event).is_ok()
    }
}

impl Default for StatusMachine {
    fn default() -> Self {
        Self::new(TaskStatus::Backlog)
    }
}
