use crate::stream::{FanOut, Subscription};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_core::{
    AgentId, SwitchboardError, SwitchboardResult, Task, TaskEvent, TaskEventKind, TaskId,
    TaskSnapshot, TaskState,
};
use tokio::sync::Mutex;

/// A task record together with the subscribers of its event stream.
pub(crate) struct TaskSlot {
    pub(crate) task: Task,
    fanout: FanOut,
}

impl TaskSlot {
    /// Appends an event to the history and delivers it to subscribers.
    pub(crate) fn emit(&mut self, kind: TaskEventKind) -> TaskEvent {
        let event = self.task.push_event(kind);
        self.fanout.publish(&event);
        event
    }

    /// Attaches a subscriber at the current point of the history.
    ///
    /// A terminal task yields only its terminal event.
    pub(crate) fn subscribe(&mut self) -> Subscription {
        let backlog = if self.task.state.is_terminal() {
            self.task.terminal_event().cloned()
        } else {
            None
        };
        self.fanout.subscribe(self.task.id, backlog)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }
}

pub(crate) type SharedSlot = Arc<Mutex<TaskSlot>>;

/// Selects tasks in [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub agent: Option<AgentId>,
}

impl TaskFilter {
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            agent: None,
        }
    }

    pub fn agent(agent: AgentId) -> Self {
        Self {
            state: None,
            agent: Some(agent),
        }
    }

    fn matches(&self, task: &Task) -> bool {
        !self.state.is_some_and(|s| task.state != s)
            && !self
                .agent
                .as_ref()
                .is_some_and(|a| task.assigned_agent.as_ref() != Some(a))
    }
}

/// Source of truth for task records.
///
/// Each task lives in its own async mutex; holding it is what makes a
/// caller the single writer for that task. The index lock is only held to
/// look up or insert a slot, never across an await.
pub struct TaskStore {
    slots: RwLock<HashMap<TaskId, SharedSlot>>,
    subscriber_buffer: usize,
}

impl TaskStore {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            subscriber_buffer,
        }
    }

    pub(crate) fn insert(&self, task: Task) -> SharedSlot {
        let id = task.id;
        let slot = Arc::new(Mutex::new(TaskSlot {
            task,
            fanout: FanOut::new(self.subscriber_buffer),
        }));
        self.slots.write().insert(id, slot.clone());
        slot
    }

    pub(crate) fn slot(&self, id: TaskId) -> SwitchboardResult<SharedSlot> {
        self.slots
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| SwitchboardError::NotFound(format!("task {id}")))
    }

    fn all_slots(&self) -> Vec<SharedSlot> {
        self.slots.read().values().cloned().collect()
    }

    /// Full record of a task, including its event history.
    pub async fn get(&self, id: TaskId) -> SwitchboardResult<Task> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Ok(guard.task.clone())
    }

    pub async fn snapshot(&self, id: TaskId) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        Ok(guard.task.snapshot())
    }

    /// Snapshots of matching tasks, oldest first.
    pub async fn list(&self, filter: &TaskFilter) -> Vec<TaskSnapshot> {
        let mut out = Vec::new();
        for slot in self.all_slots() {
            let guard = slot.lock().await;
            if filter.matches(&guard.task) {
                out.push(guard.task.snapshot());
            }
        }
        out.sort_by_key(|t| (t.created_at, t.id));
        out
    }

    /// Removes a terminal task. Live tasks cannot be purged.
    pub async fn purge(&self, id: TaskId) -> SwitchboardResult<Task> {
        let slot = self.slot(id)?;
        let guard = slot.lock().await;
        if !guard.task.state.is_terminal() {
            return Err(SwitchboardError::invalid_state(id, guard.task.state, "purge"));
        }
        self.slots.write().remove(&id);
        Ok(guard.task.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}
