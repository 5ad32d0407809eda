use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`SwitchboardError`].
pub type SwitchboardResult<T> = Result<T, SwitchboardError>;

/// Why no agent could be chosen for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingFailure {
    /// No registered, reachable agent declares a matching skill.
    NoEligibleAgent,
    /// The task used up its re-route budget without landing on an agent.
    RoutingExhausted,
}

impl std::fmt::Display for RoutingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingFailure::NoEligibleAgent => write!(f, "no eligible agent"),
            RoutingFailure::RoutingExhausted => write!(f, "routing exhausted"),
        }
    }
}

/// Top-level error type for Switchboard.
///
/// `NotFound`, `Conflict` and `InvalidState` mean the caller misused an
/// operation; nothing was mutated. `Routing`, `AgentUnreachable` and
/// `SubscriberOverflow` are steady-state conditions the engine recovers from.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// Unknown task or agent id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate registration of an active agent.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The operation is not legal in the task's current state.
    #[error("Invalid state: cannot {operation} task {task_id} in state {state}")]
    InvalidState {
        /// Task the operation targeted.
        task_id: String,
        /// State the task was in.
        state: String,
        /// Name of the rejected operation.
        operation: String,
    },

    /// No agent could be found for a task.
    #[error("Routing failure: {0}")]
    Routing(RoutingFailure),

    /// An agent failed a health probe or could not be reached for dispatch.
    #[error("Agent unreachable: {0}")]
    AgentUnreachable(String),

    /// A subscriber's buffer overflowed and events were dropped.
    #[error("Subscriber overflow on task {task_id}: {dropped} event(s) dropped")]
    SubscriberOverflow {
        /// Task whose stream overflowed.
        task_id: String,
        /// Number of events dropped so far.
        dropped: u64,
    },

    /// Configuration parsing or validation error.
    #[error("Config error: {0}")]
    Config(String),

    /// Error reported by an agent transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchboardError {
    /// Builds an [`SwitchboardError::InvalidState`] from displayable parts.
    pub fn invalid_state(
        task_id: impl std::fmt::Display,
        state: impl std::fmt::Display,
        operation: &str,
    ) -> Self {
        Self::InvalidState {
            task_id: task_id.to_string(),
            state: state.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Whether the engine heals from this error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Routing(_) | Self::AgentUnreachable(_) | Self::SubscriberOverflow { .. }
        )
    }
}

impl From<RoutingFailure> for SwitchboardError {
    fn from(failure: RoutingFailure) -> Self {
        Self::Routing(failure)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_display() {
        let err = SwitchboardError::invalid_state("t-1", "completed", "report_progress");
        assert_eq!(
            err.to_string(),
            "Invalid state: cannot report_progress task t-1 in state completed"
        );
    }

    #[test]
    fn test_recoverable_split() {
        assert!(SwitchboardError::Routing(RoutingFailure::NoEligibleAgent).is_recoverable());
        assert!(SwitchboardError::AgentUnreachable("a1".into()).is_recoverable());
        assert!(!SwitchboardError::NotFound("t".into()).is_recoverable());
        assert!(!SwitchboardError::Conflict("a1".into()).is_recoverable());
        assert!(!SwitchboardError::invalid_state("t", "failed", "cancel").is_recoverable());
    }

    #[test]
    fn test_routing_failure_serialization() {
        let json = serde_json::to_string(&RoutingFailure::RoutingExhausted).unwrap();
        assert_eq!(json, "\"routing_exhausted\"");
    }
}
