use crate::registry::AgentRegistry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{AgentId, RoutingFailure, Task};
use tracing::debug;

/// Chooses the agent for a task.
///
/// Routing reads the registry's last-known snapshot and commits nothing;
/// the task manager records the choice together with the state transition
/// and then calls [`TaskRouter::record_assignment`] so sticky routing can
/// remember it.
pub struct TaskRouter {
    registry: Arc<AgentRegistry>,
    sticky: Option<RwLock<HashMap<String, AgentId>>>,
}

impl TaskRouter {
    /// Router with sticky routing enabled.
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            sticky: Some(RwLock::new(HashMap::new())),
        }
    }

    /// Router that always uses the registry ordering.
    pub fn without_sticky(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            sticky: None,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Picks the agent for `task`.
    ///
    /// Candidates are the registry's eligible agents minus those that have
    /// rejected this task. A remembered sticky target wins while it is still
    /// a candidate; otherwise the first candidate in registry order is used.
    pub fn route(&self, task: &Task) -> Result<AgentId, RoutingFailure> {
        let mut candidates: Vec<AgentId> = self
            .registry
            .lookup_by_skill(&task.skill)
            .into_iter()
            .map(|a| a.id)
            .filter(|id| !task.rejected_by.contains(id))
            .collect();

        if candidates.is_empty() {
            debug!(task_id = %task.id, skill = %task.skill, "No eligible agent");
            return Err(RoutingFailure::NoEligibleAgent);
        }

        if let Some(target) = self.sticky_target(task) {
            if candidates.contains(&target) {
                debug!(task_id = %task.id, agent_id = %target, "Sticky route");
                return Ok(target);
            }
            debug!(task_id = %task.id, agent_id = %target, "Sticky target not eligible, falling back");
        }

        Ok(candidates.swap_remove(0))
    }

    fn sticky_target(&self, task: &Task) -> Option<AgentId> {
        let table = self.sticky.as_ref()?;
        let key = task.affinity.as_ref()?;
        table.read().get(key).cloned()
    }

    /// Remembers the agent a task was committed to, for its affinity key.
    pub fn record_assignment(&self, task: &Task) {
        if let (Some(table), Some(key), Some(agent)) =
            (&self.sticky, &task.affinity, &task.assigned_agent)
        {
            table.write().insert(key.clone(), agent.clone());
        }
    }

    /// Drops every sticky entry that points at `agent`.
    pub fn forget_agent(&self, agent: &AgentId) {
        if let Some(table) = &self.sticky {
            table.write().retain(|_, target| target != agent);
        }
    }
}
