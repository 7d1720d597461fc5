use relay_core::types::{ExecutionPhase, ExecutionProgress};

use crate::phase_detector::PhaseUpdate;

/// Within-phase progress assigned when a phase is entered.
pub const PHASE_ENTRY_PROGRESS: u8 = 10;
/// Increment for repeated signals within the same phase.
pub const PHASE_STEP: u8 = 5;
/// Within-phase progress never exceeds this until the phase actually ends.
pub const PHASE_CAP: u8 = 90;

/// Slice of overall progress owned by each phase, as `(start, end)`.
pub fn phase_range(phase: ExecutionPhase) -> (u8, u8) {
    match phase {
        ExecutionPhase::Idle => (0, 0),
        ExecutionPhase::Planning => (0, 20),
        ExecutionPhase::Coding => (20, 80),
        ExecutionPhase::QaReview | ExecutionPhase::QaFixing => (80, 95),
        ExecutionPhase::Complete => (100, 100),
        ExecutionPhase::Failed => (0, 0),
    }
}

/// `start + (end - start) * phase_progress / 100`, rounded to nearest.
pub fn overall_progress(phase: ExecutionPhase, phase_progress: u8) -> u8 {
    let (start, end) = phase_range(phase);
    let pp = f64::from(phase_progress.min(100));
    let span = f64::from(end - start);
    (f64::from(start) + span * pp / 100.0).round() as u8
}

/// Folds phase updates for one process lifetime into successive progress
/// snapshots. Overall progress never goes backwards.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    current: ExecutionProgress,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            current: ExecutionProgress::starting(),
        }
    }

    pub fn current(&self) -> &ExecutionProgress {
        &self.current
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.current.phase
    }

    pub fn apply(&mut self, update: &PhaseUpdate) -> ExecutionProgress {
        let prev = &self.current;
        let phase_changed = update.phase != prev.phase;

        let phase_progress = if phase_changed {
            PHASE_ENTRY_PROGRESS
        } else {
            prev.phase_progress
                .saturating_add(PHASE_STEP)
                .clamp(PHASE_ENTRY_PROGRESS, PHASE_CAP)
        };

        let overall = match update.phase {
            ExecutionPhase::Complete => 100,
            ExecutionPhase::Failed => prev.overall_progress,
            phase => overall_progress(phase, phase_progress).max(prev.overall_progress),
        };

        let current_chunk = match (&update.current_chunk, phase_changed) {
            (Some(chunk), _) => Some(chunk.clone()),
            (None, true) => None,
            (None, false) => prev.current_chunk.clone(),
        };

        self.current = ExecutionProgress {
            phase: update.phase,
            phase_progress,
            overall_progress: overall,
            current_chunk,
            message: Some(update.message.clone()),
        };
        self.current.clone()
    }

    /// Final snapshot once the process has exited with `code`. A clean exit
    /// enters `complete` like any other transition; only overall is forced.
    pub fn finish(&mut self, code: Option<i32>) -> ExecutionProgress {
        self.current = match code {
            Some(0) => ExecutionProgress {
                phase: ExecutionPhase::Complete,
                phase_progress: match self.current.phase {
                    ExecutionPhase::Complete => self.current.phase_progress,
                    _ => PHASE_ENTRY_PROGRESS,
                },
                overall_progress: 100,
                current_chunk: None,
                message: Some(match self.current.phase {
                    ExecutionPhase::Complete => self
                        .current
                        .message
                        .clone()
                        .unwrap_or_else(|| "Process completed".to_string()),
                    _ => "Process completed".to_string(),
                }),
            },
            other => ExecutionProgress {
                phase: ExecutionPhase::Failed,
                phase_progress: self.current.phase_progress,
                overall_progress: self.current.overall_progress,
                current_chunk: self.current.current_chunk.clone(),
                message: Some(match other {
                    Some(c) => format!("Process exited with code {c}"),
                    None => "Process terminated by signal".to_string(),
                }),
            },
        };
        self.current.clone()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}
