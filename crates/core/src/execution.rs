//! Execution identity and lifecycle types.
//!
//! An execution is one run of the agent loop for one request within a
//! session. It is identified by the (session, request) pair and moves
//! through a small set of phases before reaching a terminal outcome.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one execution: the session it belongs to and the request that
/// started it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId {
    pub session_id: String,
    pub request_id: String,
}

impl ExecutionId {
    pub fn new(session_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
        }
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.request_id)
    }
}

/// Phase of a session's current (or most recent) execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// No execution has run yet.
    Idle,
    Running,
    /// Running, but asked to stop at the next check point.
    InterruptRequested,
    Completed,
    Failed,
}

impl ExecutionPhase {
    /// Whether an execution in this phase still holds the session.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::InterruptRequested)
    }
}

/// How an execution ended. Reported once, in the completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The model produced a final answer.
    Completed,
    /// The run stopped because an interrupt was requested.
    Interrupted,
    /// The model kept requesting tools after the iteration cap was used up.
    MaxIterations,
    /// The model or the session failed.
    Failed,
}

impl ExecutionOutcome {
    /// The terminal session phase this outcome maps to.
    pub fn phase(self) -> ExecutionPhase {
        match self {
            Self::Completed | Self::Interrupted | Self::MaxIterations => ExecutionPhase::Completed,
            Self::Failed => ExecutionPhase::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::MaxIterations => "max_iterations",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_id_display() {
        assert_eq!(ExecutionId::new("ws-1", "req-7").to_string(), "ws-1/req-7");
    }

    #[test]
    fn outcome_maps_to_terminal_phase() {
        assert_eq!(ExecutionOutcome::Completed.phase(), ExecutionPhase::Completed);
        assert_eq!(ExecutionOutcome::Interrupted.phase(), ExecutionPhase::Completed);
        assert_eq!(ExecutionOutcome::MaxIterations.phase(), ExecutionPhase::Completed);
        assert_eq!(ExecutionOutcome::Failed.phase(), ExecutionPhase::Failed);
        assert!(!ExecutionOutcome::Failed.phase().is_active());
    }

    #[test]
    fn active_phases() {
        assert!(ExecutionPhase::Running.is_active());
        assert!(ExecutionPhase::InterruptRequested.is_active());
        assert!(!ExecutionPhase::Idle.is_active());
        assert!(!ExecutionPhase::Completed.is_active());
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&ExecutionOutcome::MaxIterations).unwrap();
        assert_eq!(json, r#""max_iterations""#);
    }
}
