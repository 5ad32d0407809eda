//! In-process agent that answers every task with its own payload.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use switchboard_core::{SwitchboardError, SwitchboardResult, TaskId};
use switchboard_orchestrator::{AgentExecutor, Dispatch, TaskManager};
use tracing::{debug, warn};

/// Acknowledges a dispatched task, reports one progress event and
/// completes it with the dispatched payload.
///
/// Holds a weak handle so the manager is not kept alive by its own agents.
pub struct EchoAgent {
    manager: Weak<TaskManager>,
}

impl EchoAgent {
    pub fn new(manager: &Arc<TaskManager>) -> Self {
        Self {
            manager: Arc::downgrade(manager),
        }
    }
}

async fn echo(manager: &TaskManager, dispatch: Dispatch) -> SwitchboardResult<()> {
    manager.acknowledge(dispatch.task_id).await?;
    manager
        .report_progress(
            dispatch.task_id,
            format!("echoing {}", dispatch.skill.id),
            None,
        )
        .await?;
    manager.complete(dispatch.task_id, dispatch.payload).await?;
    Ok(())
}

#[async_trait]
impl AgentExecutor for EchoAgent {
    async fn on_dispatch(&self, dispatch: Dispatch) -> SwitchboardResult<()> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| SwitchboardError::AgentUnreachable("task manager shut down".into()))?;
        // The dispatch call must return before the task can be acknowledged.
        tokio::spawn(async move {
            let task_id = dispatch.task_id;
            if let Err(e) = echo(&manager, dispatch).await {
                // A cancel or re-route can win the race; that is not an agent fault.
                warn!(task_id = %task_id, error = %e, "Echo agent could not finish task");
            }
        });
        Ok(())
    }

    async fn on_cancel(&self, task_id: TaskId) {
        debug!(task_id = %task_id, "Echo agent received cancel");
    }
}
