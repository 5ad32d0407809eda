use crate::dead_letter::{DeadLetter, DeadLetterQueue};
use crate::registry::AgentRegistry;
use crate::router::TaskRouter;
use crate::store::{TaskFilter, TaskSlot, TaskStore};
use crate::stream::Subscription;
use crate::transport::{AgentTransport, Dispatch};
use chrono::Utc;
use std::sync::Arc;
use switchboard_core::{
    AgentId, KnowledgeBase, OrchestratorConfig, RoutingFailure, SwitchboardError,
    SwitchboardResult, Task, TaskError, TaskEvent, TaskEventKind, TaskId, TaskRequest,
    TaskSnapshot, TaskState,
};
use tracing::{debug, info, warn};

const TASK_METRICS: &str = "tasks";

enum Outcome {
    Completed(serde_json::Value),
    Failed(TaskError),
    Canceled,
}

impl Outcome {
    fn state(&self) -> TaskState {
        match self {
            Outcome::Completed(_) => TaskState::Completed,
            Outcome::Failed(_) => TaskState::Failed,
            Outcome::Canceled => TaskState::Canceled,
        }
    }
}

/// Work to do once a task's lock has been released.
#[derive(Default)]
struct Effects {
    /// Target, message and the assignment it belongs to.
    dispatch: Option<(AgentId, Dispatch, u64)>,
    cancel: Option<(AgentId, TaskId)>,
    finished: Option<TaskState>,
    dead_letter: Option<DeadLetter>,
}

/// Moves a task along a non-terminal edge, optionally (re)assigning it.
fn advance(
    slot: &mut TaskSlot,
    to: TaskState,
    agent: Option<AgentId>,
    note: Option<String>,
    operation: &str,
) -> SwitchboardResult<()> {
    let from = slot.task.state;
    if !from.can_transition_to(to) {
        return Err(SwitchboardError::invalid_state(slot.task.id, from, operation));
    }
    if agent.is_some() {
        slot.task.assigned_agent = agent;
    }
    if to == TaskState::Routed {
        slot.task.assignment += 1;
    }
    slot.task.state = to;
    let agent = slot.task.assigned_agent.clone();
    debug!(task_id = %slot.task.id, from = %from, to = %to, "Task state changed");
    slot.emit(TaskEventKind::StateChanged {
        from,
        to,
        agent,
        note,
    });
    Ok(())
}

/// Moves a task into a terminal state and emits the terminal event.
fn finish(slot: &mut TaskSlot, outcome: Outcome, operation: &str) -> SwitchboardResult<TaskState> {
    let from = slot.task.state;
    let to = outcome.state();
    if !from.can_transition_to(to) {
        return Err(SwitchboardError::invalid_state(slot.task.id, from, operation));
    }
    slot.task.state = to;
    let kind = match outcome {
        Outcome::Completed(result) => {
            slot.task.result = Some(result.clone());
            TaskEventKind::Completed { result }
        }
        Outcome::Failed(error) => {
            slot.task.error = Some(error.clone());
            TaskEventKind::Failed { error }
        }
        Outcome::Canceled => TaskEventKind::Canceled,
    };
    info!(task_id = %slot.task.id, from = %from, to = %to, "Task finished");
    slot.emit(kind);
    Ok(to)
}

struct Inner {
    store: TaskStore,
    router: TaskRouter,
    transport: Arc<dyn AgentTransport>,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
    dead_letters: DeadLetterQueue,
    max_reroutes: u32,
}

/// Builder for [`TaskManager`].
pub struct TaskManagerBuilder {
    registry: Arc<AgentRegistry>,
    transport: Arc<dyn AgentTransport>,
    config: OrchestratorConfig,
    knowledge: Option<Arc<dyn KnowledgeBase>>,
}

impl TaskManagerBuilder {
    /// Engine tunables; defaults are used when not set.
    pub fn config(mut self, config: &OrchestratorConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Knowledge base that receives the `tasks.*` counters.
    pub fn knowledge_base(mut self, knowledge: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn build(self) -> TaskManager {
        let router = if self.config.sticky_routing {
            TaskRouter::new(self.registry)
        } else {
            TaskRouter::without_sticky(self.registry)
        };
        TaskManager {
            inner: Arc::new(Inner {
                store: TaskStore::new(self.config.subscriber_buffer),
                router,
                transport: self.transport,
                knowledge: self.knowledge,
                dead_letters: DeadLetterQueue::new(self.config.dead_letter_capacity),
                max_reroutes: self.config.max_reroutes,
            }),
        }
    }
}

/// Owner of the task lifecycle.
///
/// Every mutating operation locks the task's slot for the whole
/// check-then-transition sequence, so calls on the same task are serialized
/// while different tasks proceed in parallel. Agent notifications and
/// metric writes happen after the lock is released; dispatch runs on its
/// own tokio task so `submit` returns as soon as the routing decision is
/// committed.
///
/// Cloning is cheap and shares the same state.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn builder(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
    ) -> TaskManagerBuilder {
        TaskManagerBuilder {
            registry,
            transport,
            config: OrchestratorConfig::default(),
            knowledge: None,
        }
    }

    pub fn new(
        registry: Arc<AgentRegistry>,
        transport: Arc<dyn AgentTransport>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self::builder(registry, transport).config(config).build()
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        self.inner.router.registry()
    }

    pub fn router(&self) -> &TaskRouter {
        &self.inner.router
    }

    pub fn knowledge_base(&self) -> Option<&Arc<dyn KnowledgeBase>> {
        self.inner.knowledge.as_ref()
    }

    /// Creates a task and routes it.
    ///
    /// The task is `Routed` (agent notified asynchronously) or, when no agent
    /// serves the skill, already `Failed` with `NoEligibleAgent` by the time
    /// this returns.
    pub async fn submit(&self, request: TaskRequest) -> TaskId {
        let task = Task::new(request);
        let task_id = task.id;
        info!(task_id = %task_id, skill = %task.skill, "Task submitted");
        let slot = self.inner.store.insert(task);
        let effects = {
            let mut guard = slot.lock().await;
            self.place(&mut guard, None)
        };
        self.bump("received").await;
        self.apply(effects).await;
        task_id
    }

    /// Records the agent's acknowledgment: `Routed` becomes `Running`.
    /// Acknowledging a running task is a no-op.
    pub async fn acknowledge(&self, task_id: TaskId) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.inner.store.slot(task_id)?;
        let mut guard = slot.lock().await;
        if guard.task.state != TaskState::Running {
            advance(&mut guard, TaskState::Running, None, None, "acknowledge")?;
        }
        Ok(guard.task.snapshot())
    }

    /// Appends a progress event. The first event on a `Routed` task moves
    /// it to `Running`.
    pub async fn report_progress(
        &self,
        task_id: TaskId,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> SwitchboardResult<TaskEvent> {
        let slot = self.inner.store.slot(task_id)?;
        let mut guard = slot.lock().await;
        match guard.task.state {
            TaskState::Running => {}
            TaskState::Routed => {
                advance(&mut guard, TaskState::Running, None, None, "report progress")?
            }
            state => {
                return Err(SwitchboardError::invalid_state(
                    task_id,
                    state,
                    "report progress",
                ))
            }
        }
        Ok(guard.emit(TaskEventKind::Progress {
            message: message.into(),
            data,
        }))
    }

    /// Finishes a task with a result.
    ///
    /// Calling this on a task that already ended returns the stored record
    /// unchanged.
    pub async fn complete(
        &self,
        task_id: TaskId,
        result: impl Into<serde_json::Value>,
    ) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.inner.store.slot(task_id)?;
        let (snapshot, effects) = {
            let mut guard = slot.lock().await;
            let state = guard.task.state;
            if state.is_terminal() {
                debug!(task_id = %task_id, state = %state, "Ignoring completion of finished task");
                return Ok(guard.task.snapshot());
            }
            if !state.is_assigned() {
                return Err(SwitchboardError::invalid_state(task_id, state, "complete"));
            }
            if state == TaskState::Routed {
                advance(&mut guard, TaskState::Running, None, None, "complete")?;
            }
            let finished = finish(&mut guard, Outcome::Completed(result.into()), "complete")?;
            (
                guard.task.snapshot(),
                Effects {
                    finished: Some(finished),
                    ..Default::default()
                },
            )
        };
        self.apply(effects).await;
        Ok(snapshot)
    }

    /// Finishes a task with an agent-reported error. Idempotent like
    /// [`complete`](Self::complete).
    pub async fn fail(
        &self,
        task_id: TaskId,
        message: impl Into<String>,
    ) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.inner.store.slot(task_id)?;
        let (snapshot, effects) = {
            let mut guard = slot.lock().await;
            let state = guard.task.state;
            if state.is_terminal() {
                debug!(task_id = %task_id, state = %state, "Ignoring failure of finished task");
                return Ok(guard.task.snapshot());
            }
            if !state.is_assigned() {
                return Err(SwitchboardError::invalid_state(task_id, state, "fail"));
            }
            let finished = finish(
                &mut guard,
                Outcome::Failed(TaskError::agent(message)),
                "fail",
            )?;
            (
                guard.task.snapshot(),
                Effects {
                    finished: Some(finished),
                    ..Default::default()
                },
            )
        };
        self.apply(effects).await;
        Ok(snapshot)
    }

    /// Cancels a live task.
    ///
    /// Returns once `Canceled` is committed. An assigned agent gets a
    /// best-effort cancellation signal in the background.
    pub async fn cancel(&self, task_id: TaskId) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.inner.store.slot(task_id)?;
        let (snapshot, effects) = {
            let mut guard = slot.lock().await;
            let state = guard.task.state;
            let signal = if state.is_assigned() {
                guard.task.assigned_agent.clone().map(|agent| (agent, task_id))
            } else {
                None
            };
            let finished = finish(&mut guard, Outcome::Canceled, "cancel")?;
            (
                guard.task.snapshot(),
                Effects {
                    cancel: signal,
                    finished: Some(finished),
                    ..Default::default()
                },
            )
        };
        self.apply(effects).await;
        Ok(snapshot)
    }

    /// The assigned agent declines the task. It is re-routed and never
    /// offered to that agent again.
    pub async fn reject(
        &self,
        task_id: TaskId,
        agent: &AgentId,
        reason: &str,
    ) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.inner.store.slot(task_id)?;
        let (snapshot, effects) = {
            let mut guard = slot.lock().await;
            let state = guard.task.state;
            if !state.is_assigned() || guard.task.assigned_agent.as_ref() != Some(agent) {
                return Err(SwitchboardError::invalid_state(
                    task_id,
                    state,
                    &format!("reject for agent '{agent}'"),
                ));
            }
            info!(task_id = %task_id, agent_id = %agent, reason, "Task rejected by agent");
            guard.task.rejected_by.push(agent.clone());
            let effects =
                self.reroute_locked(&mut guard, format!("rejected by '{agent}': {reason}"))?;
            (guard.task.snapshot(), effects)
        };
        self.apply(effects).await;
        Ok(snapshot)
    }

    /// Takes a task away from its agent and routes it again.
    ///
    /// From `Routed`/`Running` this records the `Rerouting` transition; from
    /// `Rerouting` it is another attempt. Each attempt consumes one unit of
    /// the re-route budget; with the budget spent the task fails with
    /// `RoutingExhausted`. An attempt that finds no agent leaves the task in
    /// `Rerouting`.
    pub async fn reroute(&self, task_id: TaskId, cause: &str) -> SwitchboardResult<TaskSnapshot> {
        let slot = self.inner.store.slot(task_id)?;
        let (snapshot, effects) = {
            let mut guard = slot.lock().await;
            let effects = self.reroute_locked(&mut guard, cause.to_string())?;
            (guard.task.snapshot(), effects)
        };
        self.apply(effects).await;
        Ok(snapshot)
    }

    /// Like [`reroute`](Self::reroute), but only while the task is still
    /// assigned to `agent`. Returns `None` when the assignment has already
    /// moved on or the task ended.
    pub async fn reroute_from(
        &self,
        task_id: TaskId,
        agent: &AgentId,
        cause: &str,
    ) -> SwitchboardResult<Option<TaskSnapshot>> {
        self.reroute_away(task_id, agent, cause, None).await
    }

    /// Re-routes away from `agent`. With `failed_assignment` set, the call
    /// comes from an undeliverable dispatch: it only applies while that
    /// assignment is still the current one, and the agent is excluded from
    /// further placements of the task.
    async fn reroute_away(
        &self,
        task_id: TaskId,
        agent: &AgentId,
        cause: &str,
        failed_assignment: Option<u64>,
    ) -> SwitchboardResult<Option<TaskSnapshot>> {
        let slot = self.inner.store.slot(task_id)?;
        let (snapshot, effects) = {
            let mut guard = slot.lock().await;
            if !guard.task.state.is_assigned() || guard.task.assigned_agent.as_ref() != Some(agent)
            {
                return Ok(None);
            }
            if let Some(assignment) = failed_assignment {
                if guard.task.assignment != assignment {
                    debug!(
                        task_id = %task_id,
                        agent_id = %agent,
                        failed = assignment,
                        current = guard.task.assignment,
                        "Ignoring dispatch failure of a superseded assignment"
                    );
                    return Ok(None);
                }
                guard.task.rejected_by.push(agent.clone());
            }
            let effects = self.reroute_locked(&mut guard, cause.to_string())?;
            (guard.task.snapshot(), effects)
        };
        self.apply(effects).await;
        Ok(Some(snapshot))
    }

    /// Moves the task off its agent and tries to place it again. The
    /// replaced agent is told to stop unless it declined the task itself or
    /// is handed the task again.
    fn reroute_locked(&self, slot: &mut TaskSlot, cause: String) -> SwitchboardResult<Effects> {
        let state = slot.task.state;
        let previous = if state.is_assigned() {
            slot.task.assigned_agent.clone()
        } else {
            None
        };
        match state {
            TaskState::Routed | TaskState::Running => {
                warn!(
                    task_id = %slot.task.id,
                    agent_id = ?slot.task.assigned_agent,
                    cause = %cause,
                    "Task needs a new agent"
                );
                advance(slot, TaskState::Rerouting, None, Some(cause), "reroute")?;
            }
            TaskState::Rerouting => {}
            _ => {
                return Err(SwitchboardError::invalid_state(
                    slot.task.id,
                    state,
                    "reroute",
                ))
            }
        }
        let mut effects = if slot.task.reroute_attempts >= self.inner.max_reroutes {
            self.fail_routing(slot, RoutingFailure::RoutingExhausted)
        } else {
            slot.task.reroute_attempts += 1;
            let note = format!("re-route attempt {}", slot.task.reroute_attempts);
            self.place(slot, Some(note))
        };
        if let Some(agent) = previous {
            let placed_again = effects
                .dispatch
                .as_ref()
                .is_some_and(|(target, ..)| *target == agent);
            if !placed_again && !slot.task.rejected_by.contains(&agent) {
                effects.cancel = Some((agent, slot.task.id));
            }
        }
        Ok(effects)
    }

    /// Routes a `Submitted` or `Rerouting` task and commits the choice.
    fn place(&self, slot: &mut TaskSlot, note: Option<String>) -> Effects {
        let from = slot.task.state;
        match self.inner.router.route(&slot.task) {
            Ok(agent) => {
                if let Err(err) =
                    advance(slot, TaskState::Routed, Some(agent.clone()), note, "route")
                {
                    warn!(task_id = %slot.task.id, error = %err, "Routing decision discarded");
                    return Effects::default();
                }
                self.inner.router.record_assignment(&slot.task);
                info!(task_id = %slot.task.id, agent_id = %agent, "Task routed");
                let dispatch = Dispatch {
                    task_id: slot.task.id,
                    skill: slot.task.skill.clone(),
                    payload: slot.task.payload.clone(),
                };
                Effects {
                    dispatch: Some((agent, dispatch, slot.task.assignment)),
                    ..Default::default()
                }
            }
            Err(_) if from == TaskState::Rerouting => {
                if slot.task.reroute_attempts < self.inner.max_reroutes {
                    debug!(
                        task_id = %slot.task.id,
                        attempts = slot.task.reroute_attempts,
                        "No agent available yet, task stays in rerouting"
                    );
                    return Effects::default();
                }
                self.fail_routing(slot, RoutingFailure::RoutingExhausted)
            }
            Err(failure) => self.fail_routing(slot, failure),
        }
    }

    fn fail_routing(&self, slot: &mut TaskSlot, failure: RoutingFailure) -> Effects {
        match finish(slot, Outcome::Failed(TaskError::routing(failure)), "route") {
            Ok(finished) => {
                warn!(task_id = %slot.task.id, reason = %failure, "Task dead-lettered");
                Effects {
                    finished: Some(finished),
                    dead_letter: Some(DeadLetter {
                        task_id: slot.task.id,
                        skill: slot.task.skill.clone(),
                        reason: failure,
                        at: Utc::now(),
                    }),
                    ..Default::default()
                }
            }
            Err(err) => {
                warn!(task_id = %slot.task.id, error = %err, "Could not fail task");
                Effects::default()
            }
        }
    }

    async fn apply(&self, effects: Effects) {
        if let Some((agent, dispatch, assignment)) = effects.dispatch {
            self.spawn_dispatch(agent, dispatch, assignment);
        }
        if let Some((agent, task_id)) = effects.cancel {
            self.spawn_cancel(agent, task_id);
        }
        if let Some(letter) = effects.dead_letter {
            self.inner.dead_letters.push(letter);
            self.bump("dlq_count").await;
        }
        match effects.finished {
            Some(TaskState::Completed) => self.bump("completed").await,
            Some(TaskState::Failed) => self.bump("failed").await,
            Some(TaskState::Canceled) => self.bump("canceled").await,
            _ => {}
        }
    }

    fn spawn_dispatch(&self, agent: AgentId, dispatch: Dispatch, assignment: u64) {
        let manager = self.clone();
        tokio::spawn(async move {
            let task_id = dispatch.task_id;
            if let Err(err) = manager.inner.transport.dispatch(&agent, dispatch).await {
                warn!(task_id = %task_id, agent_id = %agent, error = %err, "Dispatch failed");
                let cause = SwitchboardError::AgentUnreachable(err.to_string()).to_string();
                if let Err(err) = manager
                    .reroute_away(task_id, &agent, &cause, Some(assignment))
                    .await
                {
                    debug!(task_id = %task_id, error = %err, "Re-route after dispatch failure skipped");
                }
            }
        });
    }

    fn spawn_cancel(&self, agent: AgentId, task_id: TaskId) {
        let transport = self.inner.transport.clone();
        tokio::spawn(async move {
            if let Err(err) = transport.cancel(&agent, task_id).await {
                debug!(task_id = %task_id, agent_id = %agent, error = %err, "Cancel signal not delivered");
            }
        });
    }

    async fn bump(&self, name: &str) {
        if let Some(kb) = &self.inner.knowledge {
            if let Err(err) = kb.increment_metric(TASK_METRICS, name, 1).await {
                warn!(metric = name, error = %err, "Failed to update task metric");
            }
        }
    }

    /// Events of `task_id` from now on; a finished task yields just its
    /// terminal event.
    pub async fn subscribe(&self, task_id: TaskId) -> SwitchboardResult<Subscription> {
        let slot = self.inner.store.slot(task_id)?;
        let mut guard = slot.lock().await;
        Ok(guard.subscribe())
    }

    /// Live subscribers of a task's stream.
    pub async fn subscriber_count(&self, task_id: TaskId) -> SwitchboardResult<usize> {
        let slot = self.inner.store.slot(task_id)?;
        let guard = slot.lock().await;
        Ok(guard.subscriber_count())
    }

    pub async fn get(&self, task_id: TaskId) -> SwitchboardResult<TaskSnapshot> {
        self.inner.store.snapshot(task_id).await
    }

    /// The full record including event history.
    pub async fn task(&self, task_id: TaskId) -> SwitchboardResult<Task> {
        self.inner.store.get(task_id).await
    }

    pub async fn list(&self, filter: &TaskFilter) -> Vec<TaskSnapshot> {
        self.inner.store.list(filter).await
    }

    /// Tasks currently `Routed` or `Running` on `agent`.
    pub async fn tasks_assigned_to(&self, agent: &AgentId) -> Vec<TaskSnapshot> {
        self.inner
            .store
            .list(&TaskFilter::agent(agent.clone()))
            .await
            .into_iter()
            .filter(|t| t.state.is_assigned())
            .collect()
    }

    /// Removes a finished task from the store.
    pub async fn purge(&self, task_id: TaskId) -> SwitchboardResult<Task> {
        self.inner.store.purge(task_id).await
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.list()
    }

    pub fn max_reroutes(&self) -> u32 {
        self.inner.max_reroutes
    }
}
