use crate::agent::AgentId;
use crate::error::RoutingFailure;
use crate::skill::SkillRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// A fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// Submitted ──► Routed ──► Running ──► Completed | Failed | Canceled
///     │           │ ▲         │
///     │           ▼ │         │
///     │        Rerouting ◄────┘
///     └──► Failed | Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet assigned.
    Submitted,
    /// An agent was selected and notified.
    Routed,
    /// The agent acknowledged and is executing.
    Running,
    /// The assigned agent was lost or rejected the task; a new one is being sought.
    Rerouting,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Canceled by a caller.
    Canceled,
}

impl TaskState {
    /// Terminal states accept no further events.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Whether the task currently holds a live assignment.
    pub fn is_assigned(self) -> bool {
        matches!(self, TaskState::Routed | TaskState::Running)
    }

    /// The edge table of the lifecycle graph.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Submitted, Routed | Failed | Canceled)
                | (Routed, Running | Rerouting | Failed | Canceled)
                | (Running, Completed | Failed | Canceled | Rerouting)
                | (Rerouting, Routed | Failed | Canceled)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Routed => "routed",
            TaskState::Running => "running",
            TaskState::Rerouting => "rerouting",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Why a task failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Routing could not place the task.
    Routing {
        /// Which routing failure ended the task.
        failure: RoutingFailure,
    },
    /// The agent reported failure.
    Agent,
}

/// Error record set on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Failure category.
    pub reason: FailureReason,
    /// Human-readable detail.
    pub message: String,
}

impl TaskError {
    /// An error reported by the executing agent.
    pub fn agent(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Agent,
            message: message.into(),
        }
    }

    /// A routing error.
    pub fn routing(failure: RoutingFailure) -> Self {
        Self {
            reason: FailureReason::Routing { failure },
            message: failure.to_string(),
        }
    }

    /// The routing failure, if this is one.
    pub fn routing_failure(&self) -> Option<RoutingFailure> {
        match self.reason {
            FailureReason::Routing { failure } => Some(failure),
            FailureReason::Agent => None,
        }
    }
}

/// Payload of a task status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    /// The task moved between states.
    StateChanged {
        /// Previous state.
        from: TaskState,
        /// New state.
        to: TaskState,
        /// Agent assigned after the transition, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentId>,
        /// Optional explanation (e.g. why a re-route happened).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    /// Intermediate progress reported by the agent.
    Progress {
        /// Free-form progress message.
        message: String,
        /// Optional structured data.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Terminal success.
    Completed {
        /// Result payload.
        result: serde_json::Value,
    },
    /// Terminal failure.
    Failed {
        /// Error record.
        error: TaskError,
    },
    /// Terminal cancellation.
    Canceled,
}

impl TaskEventKind {
    /// A progress event with only a message.
    pub fn progress(message: impl Into<String>) -> Self {
        Self::Progress {
            message: message.into(),
            data: None,
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Canceled
        )
    }
}

/// One entry of a task's append-only event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Per-task sequence number, starting at 0 and strictly increasing.
    pub seq: u64,
    /// Owning task.
    pub task_id: TaskId,
    /// Event payload.
    pub kind: TaskEventKind,
    /// Emission time.
    pub at: DateTime<Utc>,
}

impl TaskEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

/// What a caller hands to `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Skill the task needs.
    pub skill: SkillRequest,
    /// Opaque input.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Tasks sharing an affinity key prefer the same agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,
}

impl TaskRequest {
    /// A request for `skill` carrying `payload`.
    pub fn new(skill: SkillRequest, payload: impl Into<serde_json::Value>) -> Self {
        Self {
            skill,
            payload: payload.into(),
            affinity: None,
        }
    }

    /// Sets the sticky-routing affinity key.
    pub fn with_affinity(mut self, key: impl Into<String>) -> Self {
        self.affinity = Some(key.into());
        self
    }
}

/// The full task record owned by the task manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub skill: SkillRequest,
    pub payload: serde_json::Value,
    pub affinity: Option<String>,
    pub assigned_agent: Option<AgentId>,
    pub state: TaskState,
    pub events: Vec<TaskEvent>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    /// Re-route attempts consumed so far.
    pub reroute_attempts: u32,
    /// Incremented by every routing decision; tells the current assignment
    /// apart from earlier ones, even to the same agent.
    #[serde(default)]
    pub assignment: u64,
    /// Agents that rejected this task or could not be reached with it;
    /// never chosen again for it.
    #[serde(default)]
    pub rejected_by: Vec<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// A new task in `Submitted` with an empty history.
    pub fn new(request: TaskRequest) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            skill: request.skill,
            payload: request.payload,
            affinity: request.affinity,
            assigned_agent: None,
            state: TaskState::Submitted,
            events: Vec::new(),
            result: None,
            error: None,
            reroute_attempts: 0,
            assignment: 0,
            rejected_by: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Appends an event with the next sequence number and returns it.
    pub fn push_event(&mut self, kind: TaskEventKind) -> TaskEvent {
        let now = Utc::now();
        let event = TaskEvent {
            seq: self.events.len() as u64,
            task_id: self.id,
            kind,
            at: now,
        };
        self.events.push(event.clone());
        self.updated_at = now;
        event
    }

    /// The most recent event.
    pub fn last_event(&self) -> Option<&TaskEvent> {
        self.events.last()
    }

    /// The terminal event, once the task has ended.
    pub fn terminal_event(&self) -> Option<&TaskEvent> {
        self.events.iter().rev().find(|e| e.is_terminal())
    }

    /// A read-only view for callers.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            skill: self.skill.clone(),
            state: self.state,
            assigned_agent: self.assigned_agent.clone(),
            last_event: self.last_event().cloned(),
            result: self.result.clone(),
            error: self.error.clone(),
            reroute_attempts: self.reroute_attempts,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Current state of a task as returned by `get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub skill: SkillRequest,
    pub state: TaskState,
    pub assigned_agent: Option<AgentId>,
    pub last_event: Option<TaskEvent>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskError>,
    pub reroute_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
