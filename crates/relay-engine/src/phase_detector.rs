//! Infers the execution phase of an agent process from its output lines.
//!
//! The agent's output is free text, so detection is a fixed-priority list of
//! case-insensitive keyword patterns. Irreversible phases (`complete`,
//! `failed`) only come from explicit markers; softer lines are informational.

use relay_core::types::{ExecutionPhase, ProcessKind};

/// Result of inspecting one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    NoTransition,
    Transition(PhaseUpdate),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub phase: ExecutionPhase,
    pub message: String,
    pub current_chunk: Option<String>,
}

impl PhaseUpdate {
    fn new(phase: ExecutionPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            current_chunk: None,
        }
    }
}

/// Recognised line patterns, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhasePattern {
    SpecAuthoring,
    PlanAuthoring,
    CodingStart,
    ChunkMention,
    ChunkCompleted,
    QaReviewStart,
    QaFixing,
    ExplicitComplete,
    SoftComplete,
    Failure,
}

impl PhasePattern {
    pub const PRIORITY: [PhasePattern; 10] = [
        PhasePattern::SpecAuthoring,
        PhasePattern::PlanAuthoring,
        PhasePattern::CodingStart,
        PhasePattern::ChunkMention,
        PhasePattern::ChunkCompleted,
        PhasePattern::QaReviewStart,
        PhasePattern::QaFixing,
        PhasePattern::ExplicitComplete,
        PhasePattern::SoftComplete,
        PhasePattern::Failure,
    ];

    fn evaluate(self, line: &Line<'_>) -> Option<PhaseUpdate> {
        use ExecutionPhase as P;
        match self {
            PhasePattern::SpecAuthoring => {
                if line.kind != ProcessKind::SpecCreation {
                    return None;
                }
                let message = if line.has_any(&["discovering", "discovery"]) {
                    "Discovering project context"
                } else if line.has_any(&["requirements", "gathering"]) {
                    "Gathering requirements"
                } else if line.has_any(&["writing spec", "spec writer"]) {
                    "Writing specification"
                } else if line.has_any(&["validating", "validation"]) {
                    "Validating specification"
                } else if line.has("spec complete") {
                    "Specification complete"
                } else {
                    return None;
                };
                Some(PhaseUpdate::new(P::Planning, message))
            }
            PhasePattern::PlanAuthoring => line
                .has_any(&["planner agent", "creating implementation plan"])
                .then(|| PhaseUpdate::new(P::Planning, "Creating implementation plan")),
            PhasePattern::CodingStart => line
                .has_any(&["coder agent", "starting coder"])
                .then(|| PhaseUpdate::new(P::Coding, "Implementing chunks")),
            PhasePattern::ChunkMention => {
                if line.current != P::Coding {
                    return None;
                }
                let id = chunk_id(line.lower)?;
                let original = original_case(line.raw, line.lower, &id);
                Some(PhaseUpdate {
                    phase: P::Coding,
                    message: format!("Working on chunk {original}"),
                    current_chunk: Some(original),
                })
            }
            PhasePattern::ChunkCompleted => line
                .has_any(&["chunk completed", "chunk done"])
                .then(|| PhaseUpdate::new(P::Coding, "Chunk completed")),
            PhasePattern::QaReviewStart => line
                .has_any(&["qa reviewer", "starting qa"])
                .then(|| PhaseUpdate::new(P::QaReview, "Running QA review")),
            PhasePattern::QaFixing => line
                .has_any(&["qa fixer", "fixing issues"])
                .then(|| PhaseUpdate::new(P::QaFixing, "Fixing QA issues")),
            PhasePattern::ExplicitComplete => line
                .has_any(&["=== build complete ===", "qa passed"])
                .then(|| PhaseUpdate::new(P::Complete, "Build completed successfully")),
            // A coordinator may print this while chunks are still blocked, so
            // the phase stays where it is.
            PhasePattern::SoftComplete => line
                .has("all chunks completed")
                .then(|| PhaseUpdate::new(line.current, "Chunks marked complete")),
            PhasePattern::Failure => {
                let trimmed = line.lower.trim_start();
                let failed = trimmed.starts_with("error:")
                    || trimmed.starts_with("fatal:")
                    || line.has_any(&["build failed", "fatal error"]);
                failed.then(|| PhaseUpdate::new(P::Failed, truncate(line.raw.trim(), 200)))
            }
        }
    }
}

struct Line<'a> {
    raw: &'a str,
    lower: &'a str,
    kind: ProcessKind,
    current: ExecutionPhase,
}

impl Line<'_> {
    fn has(&self, needle: &str) -> bool {
        self.lower.contains(needle)
    }

    fn has_any(&self, needles: &[&str]) -> bool {
        needles.iter().any(|n| self.lower.contains(n))
    }
}

/// Inspect one output line of a `kind` process currently in `current`.
///
/// Once a process has reported `complete`, nothing it prints afterwards
/// moves it again.
pub fn detect_phase(line: &str, kind: ProcessKind, current: ExecutionPhase) -> Detection {
    if current == ExecutionPhase::Complete {
        return Detection::NoTransition;
    }
    let lower = line.to_lowercase();
    let ctx = Line {
        raw: line,
        lower: &lower,
        kind,
        current,
    };
    PhasePattern::PRIORITY
        .iter()
        .find_map(|p| p.evaluate(&ctx))
        .map_or(Detection::NoTransition, Detection::Transition)
}

/// Chunk id following `chunk` in a lower-cased line: either dotted/slashed
/// digits (`1`, `2.3`, `1/4`) or a hyphen/underscore joined word
/// (`api-routes`). Plain words are not ids.
fn chunk_id(lower: &str) -> Option<String> {
    let mut search = lower;
    while let Some(idx) = search.find("chunk") {
        let rest = &search[idx + "chunk".len()..];
        let after_sep = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        if after_sep.len() < rest.len() {
            let token: String = after_sep
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '/' | '-' | '_'))
                .collect();
            let token = token.trim_end_matches(['.', '/', '-', '_']);
            if is_numeric_id(token) || is_joined_word(token) {
                return Some(token.to_string());
            }
        }
        search = rest;
    }
    None
}

fn is_numeric_id(token: &str) -> bool {
    !token.is_empty()
        && token
            .split(['.', '/'])
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

fn is_joined_word(token: &str) -> bool {
    token.contains(['-', '_'])
        && token
            .split(['-', '_'])
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Recover the original casing of `id` from the raw line. Falls back to the
/// lower-cased id if the line's byte layout changed under lower-casing.
fn original_case(raw: &str, lower: &str, id: &str) -> String {
    if raw.len() == lower.len() {
        if let Some(idx) = lower.find(id) {
            if let Some(orig) = raw.get(idx..idx + id.len()) {
                return orig.to_string();
            }
        }
    }
    id.to_string()
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
