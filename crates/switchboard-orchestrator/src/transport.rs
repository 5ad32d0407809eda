//! Contracts between the engine and the agents it drives.
//!
//! [`AgentTransport`] carries dispatch and cancellation signals to agents,
//! [`HealthProbe`] answers liveness questions for the orchestrator, and
//! [`AgentExecutor`] is what an agent running inside this process
//! implements. [`InProcessTransport`] ties the three together without any
//! network layer.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{
    AgentDescriptor, AgentId, HealthStatus, SkillRequest, SwitchboardError, SwitchboardResult,
    TaskId,
};
use tracing::debug;

/// Notification sent to the agent a task was routed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub task_id: TaskId,
    pub skill: SkillRequest,
    pub payload: serde_json::Value,
}

/// Delivers engine signals to agents.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Hands a routed task to `agent`. An error means the agent could not
    /// be reached and the task will be re-routed.
    async fn dispatch(&self, agent: &AgentId, dispatch: Dispatch) -> SwitchboardResult<()>;

    /// Asks `agent` to stop working on `task_id`. Best effort; the engine
    /// never waits for an acknowledgment.
    async fn cancel(&self, agent: &AgentId, task_id: TaskId) -> SwitchboardResult<()>;
}

/// Answers liveness probes for registered agents.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Current status of `agent`. An error counts as unreachable.
    async fn probe(&self, agent: &AgentDescriptor) -> SwitchboardResult<HealthStatus>;
}

/// An agent executing inside this process.
///
/// Implementations report back through the task manager (`report_progress`,
/// `complete`, `fail`, `reject`) and must eventually make exactly one
/// terminal call per dispatched task.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn on_dispatch(&self, dispatch: Dispatch) -> SwitchboardResult<()>;

    async fn on_cancel(&self, _task_id: TaskId) {}

    async fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Transport and probe for agents living in the same process.
#[derive(Default)]
pub struct InProcessTransport {
    executors: RwLock<HashMap<AgentId, Arc<dyn AgentExecutor>>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an executor to an agent id, replacing any previous one.
    pub fn attach(&self, agent: impl Into<AgentId>, executor: Arc<dyn AgentExecutor>) {
        let agent = agent.into();
        debug!(agent_id = %agent, "Executor attached");
        self.executors.write().insert(agent, executor);
    }

    /// Unbinds an agent. Later dispatches and probes for it fail.
    pub fn detach(&self, agent: &AgentId) -> bool {
        self.executors.write().remove(agent).is_some()
    }

    fn executor(&self, agent: &AgentId) -> SwitchboardResult<Arc<dyn AgentExecutor>> {
        self.executors
            .read()
            .get(agent)
            .cloned()
            .ok_or_else(|| {
                SwitchboardError::AgentUnreachable(format!("no executor attached for '{agent}'"))
            })
    }
}

#[async_trait]
impl AgentTransport for InProcessTransport {
    async fn dispatch(&self, agent: &AgentId, dispatch: Dispatch) -> SwitchboardResult<()> {
        let executor = self.executor(agent)?;
        executor.on_dispatch(dispatch).await
    }

    async fn cancel(&self, agent: &AgentId, task_id: TaskId) -> SwitchboardResult<()> {
        let executor = self.executor(agent)?;
        executor.on_cancel(task_id).await;
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for InProcessTransport {
    async fn probe(&self, agent: &AgentDescriptor) -> SwitchboardResult<HealthStatus> {
        let executor = self.executor(&agent.id)?;
        Ok(executor.health().await)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        dispatched: Mutex<Vec<TaskId>>,
        canceled: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl AgentExecutor for Recorder {
        async fn on_dispatch(&self, dispatch: Dispatch) -> SwitchboardResult<()> {
            self.dispatched.lock().push(dispatch.task_id);
            Ok(())
        }

        async fn on_cancel(&self, task_id: TaskId) {
            self.canceled.lock().push(task_id);
        }

        async fn health(&self) -> HealthStatus {
            HealthStatus::Degraded
        }
    }

    fn dispatch() -> Dispatch {
        Dispatch {
            task_id: TaskId::new(),
            skill: SkillRequest::new("summarize"),
            payload: serde_json::json!("x"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_cancel_reach_executor() {
        let transport = InProcessTransport::new();
        let recorder = Arc::new(Recorder::default());
        transport.attach("a1", recorder.clone());

        let d = dispatch();
        let id = d.task_id;
        transport.dispatch(&AgentId::new("a1"), d).await.unwrap();
        transport.cancel(&AgentId::new("a1"), id).await.unwrap();

        assert_eq!(*recorder.dispatched.lock(), vec![id]);
        assert_eq!(*recorder.canceled.lock(), vec![id]);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_unreachable() {
        let transport = InProcessTransport::new();
        let err = transport
            .dispatch(&AgentId::new("ghost"), dispatch())
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchboardError::AgentUnreachable(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_probe_uses_executor_health() {
        let transport = InProcessTransport::new();
        transport.attach("a1", Arc::new(Recorder::default()));
        let desc = AgentDescriptor::new("a1", Vec::new());
        assert_eq!(transport.probe(&desc).await.unwrap(), HealthStatus::Degraded);

        assert!(transport.detach(&AgentId::new("a1")));
        assert!(transport.probe(&desc).await.is_err());
    }
}
